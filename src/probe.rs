//! Port probing, bounded polling and port allocation
//!
//! A port counts as bound when a throwaway listener cannot be bound to it
//! because the address is in use. Any other bind failure is reported as
//! free so transient errors never show up as phantom owners.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, trace};

use crate::error::SupervisorError;

/// Check whether `port` is currently bound on `host`.
pub async fn is_bound(port: u16, host: &str) -> bool {
    match TcpListener::bind((host, port)).await {
        Ok(listener) => {
            drop(listener);
            false
        }
        Err(e) if e.kind() == ErrorKind::AddrInUse => true,
        Err(e) => {
            trace!(port, host, error = %e, "Probe bind failed, treating port as free");
            false
        }
    }
}

/// A bounded retry budget: `attempts` checks spaced `interval` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    pub attempts: u32,
    pub interval: Duration,
}

impl PollBudget {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Upper bound on wall-clock time spent sleeping between attempts
    pub fn total(&self) -> Duration {
        self.interval * self.attempts
    }

    /// Run `check` until it returns true or the budget is spent.
    pub async fn poll<F, Fut>(&self, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for attempt in 0..self.attempts {
            if check().await {
                return true;
            }
            if attempt + 1 < self.attempts {
                tokio::time::sleep(self.interval).await;
            }
        }
        false
    }

    /// Poll until the port is observed bound, giving up early once
    /// `exited` reports that the process behind it is gone.
    pub async fn until_bound<T, F>(&self, port: u16, host: &str, mut exited: F) -> BindWait<T>
    where
        F: FnMut() -> Option<T>,
    {
        for attempt in 0..self.attempts {
            if is_bound(port, host).await {
                return BindWait::Bound;
            }
            if let Some(status) = exited() {
                return BindWait::Exited(status);
            }
            if attempt + 1 < self.attempts {
                tokio::time::sleep(self.interval).await;
            }
        }
        BindWait::TimedOut
    }

    /// Poll until the port is observed free.
    pub async fn until_free(&self, port: u16, host: &str) -> bool {
        self.poll(|| async { !is_bound(port, host).await }).await
    }
}

/// How a wait for a freshly started process to bind its port ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindWait<T> {
    Bound,
    Exited(T),
    TimedOut,
}

/// Hands out app ports, scanning upward from a base port.
///
/// Ports that are handed out stay reserved until the returned [`PortLease`]
/// is dropped, so two deploys racing through allocation never get the same
/// port even before either has written its record.
pub struct PortAllocator {
    base: u16,
    host: String,
    reserved: Arc<Mutex<HashSet<u16>>>,
}

impl PortAllocator {
    pub fn new(base: u16, host: impl Into<String>) -> Self {
        Self {
            base,
            host: host.into(),
            reserved: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Allocate the first port >= base that is not in `taken`, not leased,
    /// and not bound on the probe host.
    pub async fn allocate(&self, taken: &HashSet<u16>) -> Result<PortLease, SupervisorError> {
        let mut candidate = self.base;
        loop {
            let claimed = {
                let mut reserved = self.reserved.lock();
                if taken.contains(&candidate) || reserved.contains(&candidate) {
                    false
                } else {
                    reserved.insert(candidate)
                }
            };

            if claimed {
                if !is_bound(candidate, &self.host).await {
                    debug!(port = candidate, "Allocated app port");
                    return Ok(PortLease {
                        port: candidate,
                        reserved: Arc::clone(&self.reserved),
                    });
                }
                self.reserved.lock().remove(&candidate);
            }

            candidate = candidate
                .checked_add(1)
                .ok_or(SupervisorError::NoFreePort { base: self.base })?;
        }
    }

    /// Number of ports currently leased out
    pub fn leased(&self) -> usize {
        self.reserved.lock().len()
    }
}

/// A port reservation held for the duration of a deploy
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    reserved: Arc<Mutex<HashSet<u16>>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.reserved.lock().remove(&self.port);
    }
}
