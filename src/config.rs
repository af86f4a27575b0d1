use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::probe::PollBudget;

/// Global configuration for the supervisor
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener, state and proxy settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Settings applied to every supervised app
    #[serde(default)]
    pub apps: AppDefaults,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Reverse proxy port (default: 80)
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Reverse proxy bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the control API driven by the CLI
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Control API bind address (default: 127.0.0.1)
    #[serde(default = "default_control_bind")]
    pub control_bind: String,

    /// Domain apps are served under as `<name>.<local_domain>`
    #[serde(default = "default_local_domain")]
    pub local_domain: String,

    /// Directory holding the registry snapshot
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Singleton lockfile path
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    /// Maximum idle connections per app port (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max time to wait for an app to answer a proxied request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Stop every supervised app when the supervisor shuts down gracefully
    #[serde(default = "default_true")]
    pub stop_apps_on_exit: bool,
}

impl ServerConfig {
    pub fn registry_path(&self) -> PathBuf {
        self.state_dir.join("registry.json")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            proxy_port: default_proxy_port(),
            bind: default_bind_address(),
            control_port: default_control_port(),
            control_bind: default_control_bind(),
            local_domain: default_local_domain(),
            state_dir: default_state_dir(),
            lock_file: default_lock_file(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
            stop_apps_on_exit: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppDefaults {
    /// First port handed out to deployed apps; allocation scans upward
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Environment variable carrying the assigned port
    #[serde(default = "default_port_env")]
    pub port_env: String,

    /// File inside the project directory holding build/start commands
    #[serde(default = "default_manifest_file")]
    pub manifest_file: String,

    /// Host the port prober binds against
    #[serde(default = "default_probe_host")]
    pub probe_host: String,

    /// Health confirmation attempts after launch
    #[serde(default = "default_launch_attempts")]
    pub launch_attempts: u32,

    /// Delay between health confirmation attempts in milliseconds
    #[serde(default = "default_poll_interval")]
    pub launch_interval_ms: u64,

    /// Attempts to observe a port being released during stop/restart
    #[serde(default = "default_release_attempts")]
    pub release_attempts: u32,

    /// Delay between release checks in milliseconds
    #[serde(default = "default_poll_interval")]
    pub release_interval_ms: u64,

    /// Grace period between SIGTERM and SIGKILL in milliseconds
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_ms: u64,

    /// Lines kept per app log buffer
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,

    /// Characters returned by the logs endpoint
    #[serde(default = "default_log_tail_chars")]
    pub log_tail_chars: usize,

    /// How often running apps are checked for an unexpected exit, in milliseconds
    #[serde(default = "default_exit_check_interval")]
    pub exit_check_interval_ms: u64,
}

impl AppDefaults {
    pub fn launch_budget(&self) -> PollBudget {
        PollBudget::new(
            self.launch_attempts,
            Duration::from_millis(self.launch_interval_ms),
        )
    }

    pub fn release_budget(&self) -> PollBudget {
        PollBudget::new(
            self.release_attempts,
            Duration::from_millis(self.release_interval_ms),
        )
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    pub fn exit_check_interval(&self) -> Duration {
        Duration::from_millis(self.exit_check_interval_ms)
    }
}

impl Default for AppDefaults {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            port_env: default_port_env(),
            manifest_file: default_manifest_file(),
            probe_host: default_probe_host(),
            launch_attempts: default_launch_attempts(),
            launch_interval_ms: default_poll_interval(),
            release_attempts: default_release_attempts(),
            release_interval_ms: default_poll_interval(),
            shutdown_grace_period_ms: default_shutdown_grace_period(),
            log_capacity: default_log_capacity(),
            log_tail_chars: default_log_tail_chars(),
            exit_check_interval_ms: default_exit_check_interval(),
        }
    }
}

// Default value functions
fn default_proxy_port() -> u16 {
    80
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_control_port() -> u16 {
    1993
}

fn default_control_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_local_domain() -> String {
    "localhost".to_string()
}

fn default_state_dir() -> PathBuf {
    dirs_next::data_local_dir()
        .map(|dir| dir.join("burrow"))
        .unwrap_or_else(|| PathBuf::from("./burrow-state"))
}

fn default_lock_file() -> PathBuf {
    std::env::temp_dir().join("burrow.lock")
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_base_port() -> u16 {
    3100
}

fn default_port_env() -> String {
    "PORT".to_string()
}

fn default_manifest_file() -> String {
    ".burrow.json".to_string()
}

fn default_probe_host() -> String {
    "127.0.0.1".to_string()
}

fn default_launch_attempts() -> u32 {
    30 // ~3s at 100ms
}

fn default_release_attempts() -> u32 {
    20 // ~2s at 100ms
}

fn default_poll_interval() -> u64 {
    100
}

fn default_shutdown_grace_period() -> u64 {
    2000
}

fn default_log_capacity() -> usize {
    1000
}

fn default_log_tail_chars() -> usize {
    4000
}

fn default_exit_check_interval() -> u64 {
    1000
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path, or fall back to `burrow.toml` in the
    /// working directory, or to built-in defaults when neither exists.
    pub fn load_or_default(explicit: Option<&Path>) -> anyhow::Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            return Ok((Self::load(path)?, Some(path.to_path_buf())));
        }

        let fallback = PathBuf::from("burrow.toml");
        if fallback.exists() {
            return Ok((Self::load(&fallback)?, Some(fallback)));
        }

        Ok((Self::default(), None))
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.proxy_port == 0 {
            errors.push("server.proxy_port must be greater than 0".to_string());
        }
        if self.server.control_port == 0 {
            errors.push("server.control_port must be greater than 0".to_string());
        }
        if self.server.local_domain.trim().is_empty() {
            errors.push("server.local_domain must not be empty".to_string());
        }
        if self.apps.base_port == 0 {
            errors.push("apps.base_port must be greater than 0".to_string());
        }
        if self.apps.port_env.trim().is_empty() {
            errors.push("apps.port_env must not be empty".to_string());
        }
        if self.apps.launch_attempts == 0 {
            errors.push("apps.launch_attempts must be greater than 0".to_string());
        }
        if self.apps.release_attempts == 0 {
            errors.push("apps.release_attempts must be greater than 0".to_string());
        }
        if self.apps.exit_check_interval_ms == 0 {
            errors.push("apps.exit_check_interval_ms must be greater than 0".to_string());
        }
        if self.apps.log_capacity == 0 {
            errors.push("apps.log_capacity must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
