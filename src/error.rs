//! Error taxonomy for supervisor operations and gateway error pages

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by supervisor operations.
///
/// Every variant is recovered at the control API boundary and rendered as a
/// structured JSON error; none of them take the supervisor down.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("No build/start instructions at {}: {reason}", .path.display())]
    ConfigMissing { path: PathBuf, reason: String },

    #[error("Invalid app name \"{0}\": use 1-63 lowercase letters, digits or '-'")]
    InvalidName(String),

    #[error("Build failed for \"{name}\" (exit code {})", .code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()))]
    BuildFailed {
        name: String,
        code: Option<i32>,
        output: String,
    },

    #[error("Port {port} is already in use by \"{holder}\"")]
    PortConflict { port: u16, holder: String },

    #[error("\"{name}\" did not bind port {port} after {attempts} checks{}", .exited.as_ref().map(|s| format!(" (process exited: {s})")).unwrap_or_default())]
    LaunchTimeout {
        name: String,
        port: u16,
        attempts: u32,
        exited: Option<String>,
    },

    #[error("Failed to start \"{name}\": {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("App \"{0}\" not found")]
    NotFound(String),

    #[error("Deploy folder for \"{name}\" is missing: {}", .path.display())]
    FolderMissing { name: String, path: PathBuf },

    #[error("Port {port} is still held by another process and could not be reclaimed")]
    ReclaimFailed { port: u16 },

    #[error("No free port at or above {base}")]
    NoFreePort { base: u16 },

    #[error("Registry snapshot {} is unreadable: {reason}", .path.display())]
    PersistenceCorrupt { path: PathBuf, reason: String },

    #[error("Snapshot encoding error: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// HTTP status used when this error reaches the control API
    pub fn status_code(&self) -> StatusCode {
        match self {
            SupervisorError::ConfigMissing { .. } | SupervisorError::InvalidName(_) => {
                StatusCode::BAD_REQUEST
            }
            SupervisorError::NotFound(_) => StatusCode::NOT_FOUND,
            SupervisorError::PortConflict { .. } => StatusCode::CONFLICT,
            SupervisorError::FolderMissing { .. } => StatusCode::GONE,
            SupervisorError::NoFreePort { .. } => StatusCode::SERVICE_UNAVAILABLE,
            SupervisorError::BuildFailed { .. }
            | SupervisorError::LaunchTimeout { .. }
            | SupervisorError::SpawnFailed { .. }
            | SupervisorError::ReclaimFailed { .. }
            | SupervisorError::PersistenceCorrupt { .. }
            | SupervisorError::Snapshot(_)
            | SupervisorError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::ConfigMissing { .. } => "CONFIG_MISSING",
            SupervisorError::InvalidName(_) => "INVALID_NAME",
            SupervisorError::BuildFailed { .. } => "BUILD_FAILED",
            SupervisorError::PortConflict { .. } => "PORT_CONFLICT",
            SupervisorError::LaunchTimeout { .. } => "LAUNCH_TIMEOUT",
            SupervisorError::SpawnFailed { .. } => "SPAWN_FAILED",
            SupervisorError::NotFound(_) => "NOT_FOUND",
            SupervisorError::FolderMissing { .. } => "FOLDER_MISSING",
            SupervisorError::ReclaimFailed { .. } => "RECLAIM_FAILED",
            SupervisorError::NoFreePort { .. } => "NO_FREE_PORT",
            SupervisorError::PersistenceCorrupt { .. } => "PERSISTENCE_CORRUPT",
            SupervisorError::Snapshot(_) => "SNAPSHOT_ERROR",
            SupervisorError::Io(_) => "IO_ERROR",
        }
    }

    /// Captured build output, if this is a build failure
    pub fn build_output(&self) -> Option<&str> {
        match self {
            SupervisorError::BuildFailed { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// JSON error body returned by the control API
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    /// Stable error code
    pub error: &'static str,
    /// Human-readable error message
    pub message: String,
    /// Captured build output for build failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: code,
            message: message.into(),
            output: None,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"success":false,"error":"{}","message":"{}"}}"#,
                self.error,
                self.message.replace('\"', "\\\"")
            )
        })
    }
}

impl From<&SupervisorError> for ErrorResponse {
    fn from(err: &SupervisorError) -> Self {
        Self {
            success: false,
            error: err.code(),
            message: err.to_string(),
            output: err.build_output().map(String::from),
        }
    }
}

/// Error codes for reverse proxy responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// Missing or malformed Host header
    MissingHostHeader,
    /// No route registered for the subdomain
    UnknownApp,
    /// Route exists but the app is not accepting connections
    BackendUnreachable,
    /// App accepted the connection but did not answer in time
    RequestTimeout,
    /// Non-root path on the bare local domain
    NotFound,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownApp => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::BackendUnreachable => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::UnknownApp => "UNKNOWN_APP",
            ProxyErrorCode::BackendUnreachable => "BACKEND_UNREACHABLE",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::NotFound => "NOT_FOUND",
        }
    }
}

/// Create a plain-text gateway error page with an X-Proxy-Error header
pub fn gateway_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut body = message.into();
    body.push('\n');

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
