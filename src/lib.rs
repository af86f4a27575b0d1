//! Burrow - a single-host supervisor for local web apps
//!
//! This library:
//! - Builds and launches project directories as OS processes on assigned ports
//! - Confirms each launch by probing for its listening socket
//! - Persists the app registry as a JSON snapshot and relaunches apps on startup
//! - Routes `<name>.<local_domain>` to the app's port, WebSocket upgrades included
//! - Exposes a control API for deploy, stop, restart, logs and status
//! - Guards against a second supervisor instance with a lockfile

pub mod config;
pub mod control;
pub mod error;
pub mod lockfile;
pub mod logs;
pub mod pool;
pub mod probe;
pub mod process;
pub mod proxy;
pub mod registry;
pub mod supervisor;
pub mod sys;
