//! OS-specific process plumbing: port owner lookup, signals and usage sampling
//!
//! Everything here shells out or reads `/proc`, so it is the only part of
//! the crate that needs per-platform code.

use std::collections::HashSet;
use std::process::Command;
use tracing::{debug, warn};

/// A process found listening on a port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortOwner {
    pub pid: u32,
    pub name: String,
}

/// Finds and force-stops whatever process holds a port.
///
/// Used to reclaim ports from orphaned app processes whose handle the
/// supervisor no longer owns (for example after a supervisor restart).
pub trait PortOwnerLookup: Send + Sync {
    /// Processes currently listening on `port`
    fn owners(&self, port: u16) -> Vec<PortOwner>;

    /// Forcefully terminate `pid`
    fn kill(&self, pid: u32) -> Result<(), String>;
}

/// Port owner lookup backed by the host OS
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortOwners;

impl PortOwnerLookup for SystemPortOwners {
    fn owners(&self, port: u16) -> Vec<PortOwner> {
        let current_pid = std::process::id();
        let mut owners = find_owners(port);
        owners.retain(|o| o.pid != current_pid);
        owners
    }

    fn kill(&self, pid: u32) -> Result<(), String> {
        if pid == std::process::id() {
            return Err("refusing to kill the supervisor itself".to_string());
        }
        force_kill(pid)
    }
}

#[cfg(target_os = "linux")]
fn find_owners(port: u16) -> Vec<PortOwner> {
    let mut owners = proc_net::owners(port);
    if owners.is_empty() {
        owners = ss_owners(port);
    }
    if owners.is_empty() {
        owners = lsof_owners(port);
    }
    owners
}

#[cfg(target_os = "macos")]
fn find_owners(port: u16) -> Vec<PortOwner> {
    lsof_owners(port)
}

#[cfg(windows)]
fn find_owners(port: u16) -> Vec<PortOwner> {
    netstat_owners(port)
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
fn find_owners(port: u16) -> Vec<PortOwner> {
    debug!(port, "Port owner lookup not supported on this platform");
    Vec::new()
}

/// Name of a process from /proc, or "unknown"
#[cfg(target_os = "linux")]
fn proc_name(pid: u32) -> String {
    std::fs::read_to_string(format!("/proc/{}/comm", pid))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(target_os = "linux")]
mod proc_net {
    use super::{proc_name, PortOwner};
    use std::collections::HashSet;

    /// TCP state code for LISTEN in /proc/net/tcp
    const TCP_LISTEN: &str = "0A";

    /// Socket inodes listening on `port`, from /proc/net/tcp{,6}
    pub(super) fn listening_inodes(port: u16, tables: &[String]) -> HashSet<u64> {
        let mut inodes = HashSet::new();
        for table in tables {
            for line in table.lines().skip(1) {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() < 10 || fields[3] != TCP_LISTEN {
                    continue;
                }
                let local_port = fields[1]
                    .rsplit_once(':')
                    .and_then(|(_, hex)| u16::from_str_radix(hex, 16).ok());
                if local_port != Some(port) {
                    continue;
                }
                if let Ok(inode) = fields[9].parse::<u64>() {
                    if inode != 0 {
                        inodes.insert(inode);
                    }
                }
            }
        }
        inodes
    }

    pub(super) fn owners(port: u16) -> Vec<PortOwner> {
        let tables: Vec<String> = ["/proc/net/tcp", "/proc/net/tcp6"]
            .iter()
            .filter_map(|p| std::fs::read_to_string(p).ok())
            .collect();
        let inodes = listening_inodes(port, &tables);
        if inodes.is_empty() {
            return Vec::new();
        }

        let Ok(entries) = std::fs::read_dir("/proc") else {
            return Vec::new();
        };

        let mut owners = Vec::new();
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            // Processes owned by other users are unreadable; skip them
            let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            let holds_socket = fds.flatten().any(|fd| {
                std::fs::read_link(fd.path())
                    .ok()
                    .and_then(|target| {
                        let target = target.to_string_lossy().into_owned();
                        target
                            .strip_prefix("socket:[")
                            .and_then(|s| s.strip_suffix(']'))
                            .and_then(|s| s.parse::<u64>().ok())
                    })
                    .map(|inode| inodes.contains(&inode))
                    .unwrap_or(false)
            });
            if holds_socket {
                owners.push(PortOwner {
                    pid,
                    name: proc_name(pid),
                });
            }
        }
        owners
    }
}

#[cfg(target_os = "linux")]
fn ss_owners(port: u16) -> Vec<PortOwner> {
    let output = match Command::new("ss")
        .args(["-tlnpH", &format!("sport = :{}", port)])
        .output()
    {
        Ok(o) if o.status.success() => o,
        _ => return Vec::new(),
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut seen = HashSet::new();
    let mut owners = Vec::new();

    // users:(("node",pid=1234,fd=20))
    for part in stdout.split(|c| c == ',' || c == '(' || c == ')') {
        if let Some(pid) = part.strip_prefix("pid=").and_then(|s| s.parse::<u32>().ok()) {
            if seen.insert(pid) {
                owners.push(PortOwner {
                    pid,
                    name: proc_name(pid),
                });
            }
        }
    }
    owners
}

#[cfg(unix)]
fn lsof_owners(port: u16) -> Vec<PortOwner> {
    let output = match Command::new("lsof")
        .args(["-nP", &format!("-iTCP:{}", port), "-sTCP:LISTEN", "-F", "pc"])
        .output()
    {
        Ok(o) if o.status.success() => o,
        _ => return Vec::new(),
    };

    parse_lsof(&String::from_utf8_lossy(&output.stdout))
}

/// Parse `lsof -F pc` output: a `p<pid>` line starts each process block,
/// followed by `c<command>`.
#[cfg_attr(not(unix), allow(dead_code))]
fn parse_lsof(stdout: &str) -> Vec<PortOwner> {
    let mut owners: Vec<PortOwner> = Vec::new();
    for line in stdout.lines() {
        if let Some(pid) = line.strip_prefix('p').and_then(|s| s.parse::<u32>().ok()) {
            if !owners.iter().any(|o| o.pid == pid) {
                owners.push(PortOwner {
                    pid,
                    name: "unknown".to_string(),
                });
            }
        } else if let Some(command) = line.strip_prefix('c') {
            if let Some(last) = owners.last_mut() {
                last.name = command.to_string();
            }
        }
    }
    owners
}

#[cfg(windows)]
fn netstat_owners(port: u16) -> Vec<PortOwner> {
    let output = match Command::new("netstat").args(["-ano", "-p", "TCP"]).output() {
        Ok(o) if o.status.success() => o,
        _ => return Vec::new(),
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let suffix = format!(":{}", port);
    let mut seen = HashSet::new();
    let mut owners = Vec::new();

    // Proto  Local Address  Foreign Address  State  PID
    for line in stdout.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 || fields[3] != "LISTENING" || !fields[1].ends_with(&suffix) {
            continue;
        }
        if let Ok(pid) = fields[4].parse::<u32>() {
            if seen.insert(pid) {
                owners.push(PortOwner {
                    pid,
                    name: "unknown".to_string(),
                });
            }
        }
    }
    owners
}

/// Send SIGKILL (or `taskkill /F`) to a single process
pub fn force_kill(pid: u32) -> Result<(), String> {
    #[cfg(unix)]
    {
        let result = unsafe { libc::kill(pid as i32, libc::SIGKILL) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            // Already gone counts as success
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(format!("kill {} failed: {}", pid, err));
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let status = Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .status()
            .map_err(|e| format!("Failed to run taskkill for {}: {}", pid, e))?;
        if status.success() {
            Ok(())
        } else {
            Err(format!("taskkill exited with status: {}", status))
        }
    }
}

/// Signal a whole process group led by `pgid`.
#[cfg(unix)]
pub fn signal_group(pgid: u32, signal: i32) {
    let result = unsafe { libc::kill(-(pgid as i32), signal) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pgid, signal, error = %err, "Failed to signal process group");
        }
    }
}

/// CPU and memory sample for one process
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessUsage {
    /// e.g. "1.5%"
    pub cpu: String,
    /// e.g. "42.3 MB"
    pub memory: String,
}

/// Best-effort `ps` sample of a process; `None` when unavailable.
pub async fn sample_usage(pid: u32) -> Option<ProcessUsage> {
    if cfg!(windows) {
        return None;
    }

    let output = tokio::process::Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "%cpu=,rss="])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let usage = parse_ps_usage(&String::from_utf8_lossy(&output.stdout));
    if usage.is_none() {
        debug!(pid, "Unparseable ps output");
    }
    usage
}

fn parse_ps_usage(stdout: &str) -> Option<ProcessUsage> {
    let mut fields = stdout.split_whitespace();
    let cpu = fields.next()?;
    let rss_kb: f64 = fields.next()?.parse().ok()?;
    Some(ProcessUsage {
        cpu: format!("{}%", cpu),
        memory: format!("{:.1} MB", rss_kb / 1024.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ps_usage() {
        let usage = parse_ps_usage("  1.5 43315\n").unwrap();
        assert_eq!(usage.cpu, "1.5%");
        assert_eq!(usage.memory, "42.3 MB");

        assert!(parse_ps_usage("").is_none());
        assert!(parse_ps_usage("0.0 abc").is_none());
    }

    #[test]
    fn test_parse_lsof() {
        let out = "p1234\ncnode\np5678\ncpython3\np1234\ncnode\n";
        let owners = parse_lsof(out);
        assert_eq!(
            owners,
            vec![
                PortOwner { pid: 1234, name: "node".into() },
                PortOwner { pid: 5678, name: "python3".into() },
            ]
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_listening_inodes_filters_state_and_port() {
        let table = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n\
   0: 0100007F:0C1C 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 11111 1 0000000000000000 100 0 0 10 0\n\
   1: 0100007F:0C1C 0100007F:D431 01 00000000:00000000 00:00000000 00000000  1000        0 22222 1 0000000000000000 20 4 30 10 -1\n\
   2: 00000000:0C1D 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 33333 1 0000000000000000 100 0 0 10 0\n";

        let inodes = proc_net::listening_inodes(3100, &[table.to_string()]);
        assert_eq!(inodes, HashSet::from([11111]));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_system_lookup_excludes_own_process() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(SystemPortOwners.owners(port).is_empty());
    }

    #[test]
    fn test_refuses_to_kill_self() {
        assert!(SystemPortOwners.kill(std::process::id()).is_err());
    }
}
