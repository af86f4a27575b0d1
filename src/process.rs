//! Spawning, building and terminating app processes
//!
//! Apps run as `sh -c "<command>"` in their own process group so a stop
//! reaches every descendant the start command forks (npm -> node, etc.).

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::SupervisorError;
use crate::logs::{LogLine, LogStream, SharedLogBuffer};

/// Everything needed to start one app process
#[derive(Debug, Clone)]
pub struct LaunchSpec<'a> {
    pub name: &'a str,
    pub dir: &'a Path,
    pub command: &'a str,
    pub port: u16,
    /// Name of the env var carrying the port
    pub port_env: &'a str,
}

/// Build a platform shell invocation of `command` rooted at `dir`.
fn shell_command(command: &str, dir: &Path) -> Command {
    #[cfg(unix)]
    let mut cmd = {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    };

    #[cfg(not(unix))]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    };

    cmd.current_dir(dir);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd
}

/// Spawn an app's start command with its port in the environment.
///
/// Output lines are tagged, appended to `logs` and mirrored to tracing under
/// the `app_output` target. The process inherits the supervisor's
/// environment plus the port variable.
pub fn spawn_app(spec: &LaunchSpec<'_>, logs: SharedLogBuffer) -> std::io::Result<Child> {
    let mut cmd = shell_command(spec.command, spec.dir);
    cmd.env(spec.port_env, spec.port.to_string());

    #[cfg(unix)]
    cmd.process_group(0);

    info!(app = spec.name, port = spec.port, command = spec.command, "Starting app");

    let mut child = cmd.spawn()?;
    let pid = child.id().unwrap_or(0);
    debug!(app = spec.name, pid, "App process spawned");

    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, spec.name.to_string(), LogStream::Stdout, logs.clone(), None);
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, spec.name.to_string(), LogStream::Stderr, logs, None);
    }

    Ok(child)
}

/// Shared transcript of a build's combined output
type Transcript = std::sync::Arc<parking_lot::Mutex<Vec<String>>>;

/// Read `reader` line by line into the app's log buffer until EOF.
fn forward_lines<R>(
    reader: R,
    app: String,
    stream: LogStream,
    logs: SharedLogBuffer,
    transcript: Option<Transcript>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(text)) => {
                    let line = LogLine {
                        app: app.clone(),
                        stream,
                        text,
                    };
                    match stream {
                        LogStream::Stderr => warn!(target: "app_output", "{}", line),
                        _ => info!(target: "app_output", "{}", line),
                    }
                    if let Some(ref transcript) = transcript {
                        transcript.lock().push(line.text.clone());
                    }
                    logs.lock().push(line);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(app = %app, ?stream, error = %e, "Output stream closed with error");
                    break;
                }
            }
        }
    })
}

/// Run a build command to completion in `dir`.
///
/// Returns the combined output on success. A non-zero exit (or a build that
/// cannot be started at all) becomes [`SupervisorError::BuildFailed`]
/// carrying the output so the caller can show it.
pub async fn run_build(
    name: &str,
    dir: &Path,
    command: &str,
    logs: SharedLogBuffer,
) -> Result<String, SupervisorError> {
    info!(app = name, command, "Running build");
    let start = Instant::now();

    let mut child = shell_command(command, dir).spawn().map_err(|e| {
        error!(app = name, error = %e, "Failed to spawn build");
        SupervisorError::BuildFailed {
            name: name.to_string(),
            code: None,
            output: e.to_string(),
        }
    })?;

    let transcript: Transcript = Default::default();
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(forward_lines(
            stdout,
            name.to_string(),
            LogStream::Build,
            logs.clone(),
            Some(transcript.clone()),
        ));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(forward_lines(
            stderr,
            name.to_string(),
            LogStream::Build,
            logs,
            Some(transcript.clone()),
        ));
    }

    let status = child.wait().await?;
    futures::future::join_all(readers).await;

    let output = transcript.lock().join("\n");
    let duration = start.elapsed().as_secs_f64();

    if status.success() {
        info!(app = name, duration_secs = %duration, "Build completed");
        Ok(output)
    } else {
        error!(app = name, code = ?status.code(), "Build failed");
        Err(SupervisorError::BuildFailed {
            name: name.to_string(),
            code: status.code(),
            output,
        })
    }
}

/// Non-blocking check whether a child has exited, rendered for diagnostics.
pub fn exit_status(child: &mut Child) -> Option<String> {
    match child.try_wait() {
        Ok(Some(status)) => Some(status.to_string()),
        Ok(None) => None,
        Err(e) => Some(format!("unknown ({})", e)),
    }
}

/// Stop a child and its process group: SIGTERM, wait up to `grace`, SIGKILL.
///
/// Returns true if the process exited within the grace period.
pub async fn terminate(name: &str, child: &mut Child, grace: Duration) -> bool {
    let Some(pid) = child.id() else {
        // Already reaped
        debug!(app = name, "Process already exited");
        return true;
    };

    info!(app = name, pid, "Sending SIGTERM to app");

    #[cfg(unix)]
    crate::sys::signal_group(pid, libc::SIGTERM);

    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!(app = name, %status, "App exited");
            #[cfg(unix)]
            crate::sys::signal_group(pid, libc::SIGKILL);
            true
        }
        Ok(Err(e)) => {
            warn!(app = name, error = %e, "Error waiting for app to exit");
            false
        }
        Err(_) => {
            warn!(
                app = name,
                grace_period_ms = grace.as_millis() as u64,
                "Grace period exceeded, sending SIGKILL"
            );
            #[cfg(unix)]
            crate::sys::signal_group(pid, libc::SIGKILL);
            let _ = child.kill().await;
            false
        }
    }
}
