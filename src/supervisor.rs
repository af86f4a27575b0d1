//! The supervisor context: deploy, stop, restart, status and restore
//!
//! One [`Supervisor`] owns the registry, routing table and port allocator
//! and is shared by the proxy and control servers. Operations on the same
//! app name are serialized by the registry's per-name lock; different names
//! proceed concurrently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::SupervisorError;
use crate::logs::LogBuffer;
use crate::probe::{is_bound, BindWait, PortAllocator};
use crate::process::{self, LaunchSpec};
use crate::proxy::RoutingTable;
use crate::registry::{AppEntry, AppMetadata, Registry};
use crate::sys::{self, PortOwnerLookup, SystemPortOwners};

/// Shown in place of a usage sample that could not be taken
const NOT_AVAILABLE: &str = "n/a";

/// Build and start instructions read from a project directory
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub build: String,
    pub start: String,
}

impl Manifest {
    pub async fn load(path: &Path) -> Result<Self, SupervisorError> {
        let missing = |reason: String| SupervisorError::ConfigMissing {
            path: path.to_path_buf(),
            reason,
        };

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| missing(e.to_string()))?;
        let manifest: Manifest =
            serde_json::from_str(&content).map_err(|e| missing(e.to_string()))?;

        if manifest.start.trim().is_empty() {
            return Err(missing("\"start\" is empty".to_string()));
        }
        Ok(manifest)
    }
}

/// Body of a deploy request
#[derive(Debug, Clone, Deserialize)]
pub struct DeployRequest {
    pub name: String,
    #[serde(default)]
    pub template: String,
    pub path: PathBuf,
}

/// Result of a stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    /// Whether any process was terminated, the tracked one or an orphan
    pub terminated: bool,
    /// Orphaned processes killed to free the port
    pub reclaimed: usize,
}

/// One app's entry in the status report
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    pub port: u16,
    pub running: bool,
    pub folder_missing: bool,
    pub memory: String,
    pub cpu: String,
    pub started_at: Option<DateTime<Utc>>,
}

/// App names become DNS labels under the local domain.
pub fn validate_name(name: &str) -> Result<(), SupervisorError> {
    let valid = (1..=63).contains(&name.len())
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !name.starts_with('-')
        && !name.ends_with('-');

    if valid {
        Ok(())
    } else {
        Err(SupervisorError::InvalidName(name.to_string()))
    }
}

pub struct Supervisor {
    config: Config,
    registry: Registry,
    routes: Arc<RoutingTable>,
    ports: PortAllocator,
    owners: Arc<dyn PortOwnerLookup>,
}

impl Supervisor {
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_port_owners(config, Arc::new(SystemPortOwners))
    }

    pub fn with_port_owners(config: Config, owners: Arc<dyn PortOwnerLookup>) -> Arc<Self> {
        let registry = Registry::new(config.server.registry_path());
        let ports = PortAllocator::new(config.apps.base_port, config.apps.probe_host.clone());
        Arc::new(Self {
            config,
            registry,
            routes: Arc::new(RoutingTable::new()),
            ports,
            owners,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn routes(&self) -> Arc<RoutingTable> {
        Arc::clone(&self.routes)
    }

    fn probe_host(&self) -> &str {
        &self.config.apps.probe_host
    }

    /// Build and launch a project directory under `name`.
    ///
    /// Redeploying an existing name stops its process first and keeps a
    /// single record. Returns the port the app is listening on.
    pub async fn deploy(&self, request: DeployRequest) -> Result<u16, SupervisorError> {
        let DeployRequest {
            name,
            template,
            path,
        } = request;
        validate_name(&name)?;

        let manifest = Manifest::load(&path.join(&self.config.apps.manifest_file)).await?;
        let path = match tokio::fs::canonicalize(&path).await {
            Ok(absolute) => absolute,
            Err(_) => path,
        };

        let _op = self.registry.lock_app(&name).await;
        info!(app = %name, path = %path.display(), "Deploying app");

        let logs = LogBuffer::shared(self.config.apps.log_capacity);
        if !manifest.build.trim().is_empty() {
            process::run_build(&name, &path, &manifest.build, logs.clone()).await?;
        }

        if let Some(existing) = self.registry.get(&name) {
            self.stop_process(&name, &existing).await;
            self.config
                .apps
                .release_budget()
                .until_free(existing.port(), self.probe_host())
                .await;
        }

        let lease = self
            .ports
            .allocate(&self.registry.ports_excluding(&name))
            .await?;
        let port = lease.port();

        let entry = self.registry.upsert(AppMetadata {
            name: name.clone(),
            port,
            path,
            template,
            start_command: manifest.start,
            running: false,
            pid: None,
            started_at: None,
        });
        entry.set_logs(logs);
        entry.set_folder_missing(false);
        drop(lease);

        self.registry.persist_or_warn().await;
        self.launch(&entry).await
    }

    /// Start the record's process and wait for it to bind its port.
    ///
    /// The caller must hold the app's operation lock.
    async fn launch(&self, entry: &Arc<AppEntry>) -> Result<u16, SupervisorError> {
        let meta = entry.meta();
        let name = meta.name.as_str();
        let port = meta.port;

        if is_bound(port, self.probe_host()).await {
            if let Some(holder) = self.registry.running_holder(port, name) {
                warn!(app = name, port, holder = %holder, "Port held by another app");
                self.mark_stopped(entry).await;
                return Err(SupervisorError::PortConflict { port, holder });
            }
        }

        let logs = entry.logs().unwrap_or_else(|| {
            let logs = LogBuffer::shared(self.config.apps.log_capacity);
            entry.set_logs(logs.clone());
            logs
        });

        let spec = LaunchSpec {
            name,
            dir: &meta.path,
            command: &meta.start_command,
            port,
            port_env: &self.config.apps.port_env,
        };

        let mut child = match process::spawn_app(&spec, logs) {
            Ok(child) => child,
            Err(source) => {
                error!(app = name, error = %source, "App never started");
                self.mark_stopped(entry).await;
                return Err(SupervisorError::SpawnFailed {
                    name: name.to_string(),
                    source,
                });
            }
        };

        let pid = child.id();
        entry.update_meta(|m| {
            m.pid = pid;
            m.started_at = Some(Utc::now());
        });

        let budget = self.config.apps.launch_budget();
        let wait = budget
            .until_bound(port, self.probe_host(), || process::exit_status(&mut child))
            .await;

        let exited = match wait {
            BindWait::Bound => None,
            BindWait::Exited(status) => Some(Some(status)),
            BindWait::TimedOut => {
                process::terminate(name, &mut child, self.config.apps.shutdown_grace_period())
                    .await;
                Some(None)
            }
        };

        if let Some(exited) = exited {
            warn!(app = name, port, exited = ?exited, "App did not bind its port");
            self.mark_stopped(entry).await;
            return Err(SupervisorError::LaunchTimeout {
                name: name.to_string(),
                port,
                attempts: budget.attempts,
                exited,
            });
        }

        // Running is set before the handle so the exit watcher can only
        // ever clear it, never race it back to true
        entry.update_meta(|m| m.running = true);
        entry.set_child(child);
        self.routes.register(name, port);
        self.registry.persist_or_warn().await;

        info!(app = name, port, pid = ?pid, "App is listening");
        Ok(port)
    }

    async fn mark_stopped(&self, entry: &AppEntry) {
        entry.update_meta(|m| {
            m.running = false;
            m.pid = None;
        });
        self.registry.persist_or_warn().await;
    }

    /// Terminate the live handle, if any. Returns whether one existed.
    async fn stop_process(&self, name: &str, entry: &AppEntry) -> bool {
        let Some(mut child) = entry.take_child() else {
            return false;
        };
        process::terminate(name, &mut child, self.config.apps.shutdown_grace_period()).await;
        entry.update_meta(|m| {
            m.running = false;
            m.pid = None;
        });
        true
    }

    /// Make sure nothing but `name` could be holding `port` before it is
    /// (re)used: wait for a release, then kill whatever still listens.
    ///
    /// Returns the number of orphaned processes killed.
    async fn ensure_port_released(&self, name: &str, port: u16) -> Result<usize, SupervisorError> {
        if !is_bound(port, self.probe_host()).await {
            return Ok(0);
        }
        if let Some(holder) = self.registry.running_holder(port, name) {
            // A sibling app owns it; launch reports the conflict
            debug!(app = name, port, holder = %holder, "Port owned by another app, not reclaiming");
            return Ok(0);
        }
        if self
            .config
            .apps
            .release_budget()
            .until_free(port, self.probe_host())
            .await
        {
            return Ok(0);
        }
        self.reclaim_port(port).await
    }

    /// Kill the OS processes listening on `port` and wait for it to free up.
    async fn reclaim_port(&self, port: u16) -> Result<usize, SupervisorError> {
        let owners = Arc::clone(&self.owners);
        let killed = tokio::task::spawn_blocking(move || {
            owners
                .owners(port)
                .into_iter()
                .map(|owner| {
                    let result = owners.kill(owner.pid);
                    (owner, result)
                })
                .collect::<Vec<_>>()
        })
        .await
        .unwrap_or_else(|e| {
            warn!(port, error = %e, "Port owner lookup panicked");
            Vec::new()
        });

        if killed.is_empty() {
            warn!(port, "Port is bound but no owning process was found");
        }
        let mut reclaimed = 0;
        for (owner, result) in &killed {
            match result {
                Ok(()) => {
                    reclaimed += 1;
                    info!(port, pid = owner.pid, process = %owner.name, "Killed orphaned port owner");
                }
                Err(e) => warn!(port, pid = owner.pid, process = %owner.name, error = %e, "Failed to kill port owner"),
            }
        }

        if self
            .config
            .apps
            .release_budget()
            .until_free(port, self.probe_host())
            .await
        {
            info!(port, reclaimed, "Port reclaimed");
            Ok(reclaimed)
        } else {
            error!(port, "Port could not be reclaimed");
            Err(SupervisorError::ReclaimFailed { port })
        }
    }

    /// Stop an app and make sure its port is released.
    pub async fn stop(&self, name: &str) -> Result<StopOutcome, SupervisorError> {
        let entry = self
            .registry
            .get(name)
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
        let _op = self.registry.lock_app(name).await;

        let port = entry.port();
        let handle_terminated = self.stop_process(name, &entry).await;
        if !handle_terminated {
            debug!(app = name, "No live process handle");
        }
        entry.update_meta(|m| {
            m.running = false;
            m.pid = None;
        });

        let released = self.ensure_port_released(name, port).await;
        self.registry.persist_or_warn().await;
        let reclaimed = released?;

        let terminated = handle_terminated || reclaimed > 0;
        info!(app = name, port, terminated, reclaimed, "App stopped");
        Ok(StopOutcome {
            terminated,
            reclaimed,
        })
    }

    /// Stop an app and launch it again on the same port.
    pub async fn restart(&self, name: &str) -> Result<u16, SupervisorError> {
        let entry = self
            .registry
            .get(name)
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
        let _op = self.registry.lock_app(name).await;

        self.stop_process(name, &entry).await;

        let meta = entry.meta();
        if !tokio::fs::try_exists(&meta.path).await.unwrap_or(false) {
            entry.set_folder_missing(true);
            self.mark_stopped(&entry).await;
            return Err(SupervisorError::FolderMissing {
                name: name.to_string(),
                path: meta.path,
            });
        }
        entry.set_folder_missing(false);

        if let Err(e) = self.ensure_port_released(name, meta.port).await {
            self.mark_stopped(&entry).await;
            return Err(e);
        }

        info!(app = name, port = meta.port, "Restarting app");
        self.launch(&entry).await
    }

    /// Tail of an app's log buffer
    pub fn logs(&self, name: &str) -> Result<String, SupervisorError> {
        self.registry
            .get(name)
            .and_then(|entry| entry.logs())
            .map(|logs| logs.lock().tail(self.config.apps.log_tail_chars))
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))
    }

    /// Mark apps whose process exited on its own as stopped.
    ///
    /// Returns how many were found. Reaping also collects the exit status,
    /// so crashed apps never linger as zombies.
    pub async fn reap_exited(&self) -> usize {
        let mut reaped = 0;
        for (name, entry) in self.registry.all() {
            if let Some(status) = entry.reap_exited() {
                entry.update_meta(|m| {
                    m.running = false;
                    m.pid = None;
                });
                warn!(app = %name, status = %status, "App exited unexpectedly");
                reaped += 1;
            }
        }
        if reaped > 0 {
            self.registry.persist_or_warn().await;
        }
        reaped
    }

    /// Reap exited apps on a fixed interval until shutdown.
    pub async fn watch_exits(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.apps.exit_check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.reap_exited().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Exit watcher stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Per-app status, re-checking project folders and sampling usage
    pub async fn status(&self) -> BTreeMap<String, AppStatus> {
        self.reap_exited().await;

        let reports = self.registry.all().into_iter().map(|(name, entry)| async move {
            let meta = entry.meta();
            let folder_exists = tokio::fs::try_exists(&meta.path).await.unwrap_or(false);
            entry.set_folder_missing(!folder_exists);

            let running = meta.running && folder_exists;
            let usage = match meta.pid {
                Some(pid) if running => sys::sample_usage(pid).await,
                _ => None,
            };
            let (cpu, memory) = usage
                .map(|u| (u.cpu, u.memory))
                .unwrap_or_else(|| (NOT_AVAILABLE.to_string(), NOT_AVAILABLE.to_string()));

            (
                name,
                AppStatus {
                    port: meta.port,
                    running,
                    folder_missing: !folder_exists,
                    memory,
                    cpu,
                    started_at: meta.started_at,
                },
            )
        });

        futures::future::join_all(reports).await.into_iter().collect()
    }

    /// Names recorded in the persisted snapshot
    pub async fn list_apps(&self) -> Result<Vec<String>, SupervisorError> {
        self.registry.persisted_names().await
    }

    /// Rehydrate the registry from disk and relaunch every app whose
    /// folder still exists. Returns the number of apps relaunched.
    pub async fn restore(&self) -> usize {
        let records = self.registry.load_snapshot().await;
        if records.is_empty() {
            return 0;
        }
        info!(count = records.len(), "Restoring apps from snapshot");

        let mut relaunch = Vec::new();
        for mut meta in records {
            let _op = self.registry.lock_app(&meta.name).await;
            if self.registry.get(&meta.name).is_some() {
                debug!(app = %meta.name, "Deployed since startup, skipping snapshot record");
                continue;
            }

            meta.running = false;
            let folder_exists = tokio::fs::try_exists(&meta.path).await.unwrap_or(false);
            let name = meta.name.clone();
            let path = meta.path.clone();
            let entry = self.registry.upsert(meta);
            entry.set_folder_missing(!folder_exists);

            if folder_exists {
                relaunch.push((name, entry));
            } else {
                warn!(app = %name, path = %path.display(), "Deploy folder missing, app orphaned");
            }
        }

        let launches = relaunch.into_iter().map(|(name, entry)| async move {
            let _op = self.registry.lock_app(&name).await;
            if entry.is_running() {
                debug!(app = %name, "Already running, not relaunching");
                return false;
            }
            let result = match self.ensure_port_released(&name, entry.port()).await {
                Ok(_) => self.launch(&entry).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(port) => {
                    info!(app = %name, port, "Restored app");
                    true
                }
                Err(e) => {
                    error!(app = %name, error = %e, "Failed to restore app");
                    false
                }
            }
        });

        let restored = futures::future::join_all(launches)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();
        self.registry.persist_or_warn().await;
        restored
    }

    /// Terminate every live app process (graceful supervisor shutdown).
    pub async fn stop_all(&self) {
        let stops = self.registry.all().into_iter().map(|(name, entry)| async move {
            let _op = self.registry.lock_app(&name).await;
            self.stop_process(&name, &entry).await
        });
        let stopped = futures::future::join_all(stops)
            .await
            .into_iter()
            .filter(|s| *s)
            .count();

        self.registry.persist_or_warn().await;
        info!(stopped, "Stopped all apps");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::probe::PollBudget;
    use crate::sys::PortOwner;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn test_config(state_dir: &Path, base_port: u16) -> Config {
        let mut config = Config::default();
        config.server.state_dir = state_dir.to_path_buf();
        config.apps.base_port = base_port;
        config.apps.launch_attempts = 5;
        config.apps.launch_interval_ms = 20;
        config.apps.release_attempts = 5;
        config.apps.release_interval_ms = 20;
        config.apps.shutdown_grace_period_ms = 500;
        config
    }

    fn write_project(dir: &Path, build: &str, start: &str) {
        std::fs::create_dir_all(dir).unwrap();
        let manifest = serde_json::json!({ "build": build, "start": start });
        std::fs::write(dir.join(".burrow.json"), manifest.to_string()).unwrap();
    }

    fn deploy_request(name: &str, path: &Path) -> DeployRequest {
        DeployRequest {
            name: name.to_string(),
            template: "static".to_string(),
            path: path.to_path_buf(),
        }
    }

    /// Stands in for an orphaned process: "killing" it closes the listener.
    struct FakeOwners {
        listener: Mutex<Option<std::net::TcpListener>>,
        kills: Mutex<Vec<u32>>,
    }

    impl PortOwnerLookup for FakeOwners {
        fn owners(&self, _port: u16) -> Vec<PortOwner> {
            if self.listener.lock().is_some() {
                vec![PortOwner {
                    pid: 999_999,
                    name: "orphan".to_string(),
                }]
            } else {
                Vec::new()
            }
        }

        fn kill(&self, pid: u32) -> Result<(), String> {
            self.kills.lock().push(pid);
            self.listener.lock().take();
            Ok(())
        }
    }

    #[test]
    fn test_validate_name() {
        for ok in ["alpha", "a", "my-app-2", &"x".repeat(63)] {
            assert!(validate_name(ok).is_ok(), "{ok} should be valid");
        }
        for bad in ["", "Alpha", "my_app", "-lead", "trail-", "a.b", &"x".repeat(64)] {
            assert!(
                matches!(validate_name(bad), Err(SupervisorError::InvalidName(_))),
                "{bad} should be invalid"
            );
        }
    }

    #[tokio::test]
    async fn test_manifest_errors_are_config_missing() {
        let dir = tempfile::tempdir().unwrap();

        let err = Manifest::load(&dir.path().join(".burrow.json")).await.unwrap_err();
        assert!(matches!(err, SupervisorError::ConfigMissing { .. }));

        std::fs::write(dir.path().join(".burrow.json"), r#"{"build":"make"}"#).unwrap();
        let err = Manifest::load(&dir.path().join(".burrow.json")).await.unwrap_err();
        assert!(err.to_string().contains("start"));
    }

    #[tokio::test]
    async fn test_deploy_without_manifest_creates_no_record() {
        let state = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let sup = Supervisor::new(test_config(state.path(), 42100));

        let err = sup.deploy(deploy_request("alpha", project.path())).await.unwrap_err();
        assert_eq!(err.code(), "CONFIG_MISSING");
        assert!(sup.registry().all().is_empty());
    }

    #[tokio::test]
    async fn test_build_failure_returns_output_and_creates_no_record() {
        let state = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        write_project(project.path(), "echo compile error; exit 2", "true");
        let sup = Supervisor::new(test_config(state.path(), 42110));

        let err = sup.deploy(deploy_request("alpha", project.path())).await.unwrap_err();
        assert_eq!(err.build_output(), Some("compile error"));
        assert!(sup.registry().get("alpha").is_none());
    }

    #[tokio::test]
    async fn test_launch_reports_early_exit() {
        let state = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        write_project(project.path(), "", "echo crashing; exit 1");
        let sup = Supervisor::new(test_config(state.path(), 42120));

        let err = sup.deploy(deploy_request("alpha", project.path())).await.unwrap_err();
        match err {
            SupervisorError::LaunchTimeout { exited, .. } => assert!(exited.is_some()),
            other => panic!("unexpected error: {other}"),
        }

        let entry = sup.registry().get("alpha").unwrap();
        assert!(!entry.is_running());
        assert!(sup.routes().lookup("alpha").is_none());

        // Record persisted even though launch failed
        assert_eq!(sup.list_apps().await.unwrap(), vec!["alpha"]);
    }

    #[tokio::test]
    async fn test_launch_timeout_kills_silent_process() {
        let state = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        write_project(project.path(), "", "sleep 30");
        let sup = Supervisor::new(test_config(state.path(), 42130));

        let err = sup.deploy(deploy_request("alpha", project.path())).await.unwrap_err();
        match err {
            SupervisorError::LaunchTimeout { attempts, exited, .. } => {
                assert_eq!(attempts, 5);
                assert!(exited.is_none());
            }
            other => panic!("unexpected error: {other}"),
        }
        let entry = sup.registry().get("alpha").unwrap();
        assert!(entry.take_child().is_none());
    }

    #[tokio::test]
    async fn test_stop_and_restart_unknown_app() {
        let state = tempfile::tempdir().unwrap();
        let sup = Supervisor::new(test_config(state.path(), 42140));

        assert!(matches!(sup.stop("ghost").await, Err(SupervisorError::NotFound(_))));
        assert!(matches!(sup.restart("ghost").await, Err(SupervisorError::NotFound(_))));
        assert!(matches!(sup.logs("ghost"), Err(SupervisorError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_stop_reclaims_port_from_orphan() {
        let state = tempfile::tempdir().unwrap();
        let orphan = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = orphan.local_addr().unwrap().port();

        let owners = Arc::new(FakeOwners {
            listener: Mutex::new(Some(orphan)),
            kills: Mutex::new(Vec::new()),
        });
        let sup = Supervisor::with_port_owners(test_config(state.path(), 42150), owners.clone());
        sup.registry().upsert(AppMetadata {
            name: "alpha".to_string(),
            port,
            path: state.path().to_path_buf(),
            template: String::new(),
            start_command: "true".to_string(),
            running: true,
            pid: Some(999_999),
            started_at: None,
        });

        let outcome = sup.stop("alpha").await.unwrap();
        assert!(outcome.terminated);
        assert_eq!(outcome.reclaimed, 1);
        assert_eq!(*owners.kills.lock(), vec![999_999]);
        assert!(!is_bound(port, "127.0.0.1").await);
        assert!(!sup.registry().get("alpha").unwrap().is_running());
    }

    #[tokio::test]
    async fn test_stop_fails_when_port_cannot_be_reclaimed() {
        let state = tempfile::tempdir().unwrap();
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();

        // Lookup finds nothing, so the port stays bound
        let owners = Arc::new(FakeOwners {
            listener: Mutex::new(None),
            kills: Mutex::new(Vec::new()),
        });
        let sup = Supervisor::with_port_owners(test_config(state.path(), 42160), owners);
        sup.registry().upsert(AppMetadata {
            name: "alpha".to_string(),
            port,
            path: state.path().to_path_buf(),
            template: String::new(),
            start_command: "true".to_string(),
            running: false,
            pid: None,
            started_at: None,
        });

        let err = sup.stop("alpha").await.unwrap_err();
        assert!(matches!(err, SupervisorError::ReclaimFailed { port: p } if p == port));
        drop(held);
    }

    fn record(name: &str, port: u16, path: &Path, start: &str, running: bool) -> AppMetadata {
        AppMetadata {
            name: name.to_string(),
            port,
            path: path.to_path_buf(),
            template: String::new(),
            start_command: start.to_string(),
            running,
            pid: None,
            started_at: None,
        }
    }

    #[tokio::test]
    async fn test_launch_refuses_port_owned_by_running_app() {
        let state = tempfile::tempdir().unwrap();
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();

        let owners = Arc::new(FakeOwners {
            listener: Mutex::new(None),
            kills: Mutex::new(Vec::new()),
        });
        let sup = Supervisor::with_port_owners(test_config(state.path(), 42200), owners.clone());
        sup.registry().upsert(record("beta", port, state.path(), "true", true));
        sup.registry().upsert(record("alpha", port, state.path(), "true", true));

        let err = sup.restart("alpha").await.unwrap_err();
        match err {
            SupervisorError::PortConflict { port: p, ref holder } => {
                assert_eq!(p, port);
                assert_eq!(holder, "beta");
            }
            ref other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.status_code(), hyper::StatusCode::CONFLICT);

        // The sibling's port is never reclaimed
        assert!(owners.kills.lock().is_empty());
        assert!(!sup.registry().get("alpha").unwrap().is_running());
        assert!(sup.registry().get("beta").unwrap().is_running());
        drop(held);
    }

    #[tokio::test]
    async fn test_restart_reclaims_port_from_orphan_before_launch() {
        let state = tempfile::tempdir().unwrap();
        let orphan = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = orphan.local_addr().unwrap().port();

        let owners = Arc::new(FakeOwners {
            listener: Mutex::new(Some(orphan)),
            kills: Mutex::new(Vec::new()),
        });
        let sup = Supervisor::with_port_owners(test_config(state.path(), 42210), owners.clone());
        sup.registry().upsert(record("alpha", port, state.path(), "exit 3", false));

        // The orphan is killed, then the launch itself runs and fails
        let err = sup.restart("alpha").await.unwrap_err();
        match err {
            SupervisorError::LaunchTimeout { port: p, exited, .. } => {
                assert_eq!(p, port);
                assert!(exited.is_some());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*owners.kills.lock(), vec![999_999]);
        assert!(!is_bound(port, "127.0.0.1").await);
    }

    #[tokio::test]
    async fn test_reap_exited_marks_crashed_app_stopped() {
        let state = tempfile::tempdir().unwrap();
        let sup = Supervisor::new(test_config(state.path(), 42220));
        let entry = sup.registry().upsert(AppMetadata {
            pid: Some(999_999),
            ..record("alpha", 42220, state.path(), "true", true)
        });

        let child = tokio::process::Command::new("true").spawn().unwrap();
        entry.set_child(child);

        let mut reaped = 0;
        for _ in 0..100 {
            reaped = sup.reap_exited().await;
            if reaped > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(reaped, 1);

        let meta = entry.meta();
        assert!(!meta.running);
        assert_eq!(meta.pid, None);
        assert!(entry.take_child().is_none());

        let status = sup.status().await;
        assert!(!status["alpha"].running);
        assert_eq!(status["alpha"].memory, "n/a");

        // The stopped state reaches the snapshot
        let snapshot = sup.registry().load_snapshot().await;
        assert!(!snapshot[0].running);
    }

    #[tokio::test]
    async fn test_reap_exited_leaves_live_apps_alone() {
        let state = tempfile::tempdir().unwrap();
        let sup = Supervisor::new(test_config(state.path(), 42230));
        let entry = sup
            .registry()
            .upsert(record("alpha", 42230, state.path(), "sleep 30", true));

        let mut child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        entry.set_child(child);

        assert_eq!(sup.reap_exited().await, 0);
        assert!(entry.is_running());

        child = entry.take_child().unwrap();
        assert_eq!(child.id(), pid);
        child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_restore_keeps_records_deployed_since_startup() {
        let state = tempfile::tempdir().unwrap();
        let config = test_config(state.path(), 42240);
        let snapshot = serde_json::json!({
            "alpha": {
                "name": "alpha",
                "port": 42240,
                "path": state.path(),
                "startCommand": "old command",
                "running": true
            }
        });
        std::fs::write(config.server.registry_path(), snapshot.to_string()).unwrap();

        let sup = Supervisor::new(config);
        sup.registry()
            .upsert(record("alpha", 42241, state.path(), "new command", true));

        assert_eq!(sup.restore().await, 0);
        let meta = sup.registry().get("alpha").unwrap().meta();
        assert_eq!(meta.port, 42241);
        assert_eq!(meta.start_command, "new command");
        assert!(meta.running);
    }

    #[tokio::test]
    async fn test_restart_with_missing_folder() {
        let state = tempfile::tempdir().unwrap();
        let sup = Supervisor::new(test_config(state.path(), 42170));
        sup.registry().upsert(AppMetadata {
            name: "alpha".to_string(),
            port: 42170,
            path: state.path().join("gone"),
            template: String::new(),
            start_command: "true".to_string(),
            running: true,
            pid: None,
            started_at: None,
        });

        let err = sup.restart("alpha").await.unwrap_err();
        assert_eq!(err.status_code(), hyper::StatusCode::GONE);
        assert!(sup.registry().get("alpha").unwrap().folder_missing());
    }

    #[tokio::test]
    async fn test_status_folds_in_folder_existence() {
        let state = tempfile::tempdir().unwrap();
        let sup = Supervisor::new(test_config(state.path(), 42180));
        sup.registry().upsert(AppMetadata {
            name: "alpha".to_string(),
            port: 42180,
            path: state.path().join("gone"),
            template: String::new(),
            start_command: "true".to_string(),
            running: true,
            pid: None,
            started_at: None,
        });

        let status = sup.status().await;
        let alpha = &status["alpha"];
        assert!(!alpha.running);
        assert!(alpha.folder_missing);
        assert_eq!(alpha.memory, "n/a");
        assert_eq!(alpha.cpu, "n/a");
    }

    #[tokio::test]
    async fn test_restore_keeps_orphaned_records() {
        let state = tempfile::tempdir().unwrap();
        let config = test_config(state.path(), 42190);
        let snapshot = serde_json::json!({
            "alpha": {
                "name": "alpha",
                "port": 42190,
                "path": state.path().join("gone"),
                "startCommand": "true",
                "running": true
            }
        });
        std::fs::write(config.server.registry_path(), snapshot.to_string()).unwrap();

        let sup = Supervisor::new(config);
        assert_eq!(sup.restore().await, 0);

        let entry = sup.registry().get("alpha").unwrap();
        assert!(entry.folder_missing());
        assert!(!entry.is_running());
        // No buffer until the app is launched again
        assert!(sup.logs("alpha").is_err());
    }

    #[test]
    fn test_release_budget_is_bounded() {
        let config = test_config(Path::new("/tmp"), 3100);
        assert_eq!(
            config.apps.release_budget(),
            PollBudget::new(5, Duration::from_millis(20))
        );
    }
}
