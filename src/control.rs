//! Control API driven by the CLI
//!
//! Routes:
//! - `POST /deploy` `{name, template, path}`
//! - `POST /control/{name}/stop`
//! - `POST /control/{name}/restart`
//! - `GET /control/{name}/logs`
//! - `GET /status`, `GET /apps`, `GET /health`, `GET /version`

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorResponse, SupervisorError};
use crate::supervisor::{DeployRequest, StopOutcome, Supervisor};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a plain-text response - infallible with valid StatusCode
fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(body).unwrap_or_else(|e| {
        ErrorResponse::new("SERIALIZATION_ERROR", e.to_string())
            .to_json()
            .into_bytes()
    });
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static header")
}

fn error_response(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response<Full<Bytes>> {
    json_response(status, &ErrorResponse::new(code, message))
}

fn supervisor_error_response(err: &SupervisorError) -> Response<Full<Bytes>> {
    json_response(err.status_code(), &ErrorResponse::from(err))
}

#[derive(Debug, Serialize)]
struct DeployResponse {
    success: bool,
    message: String,
    port: u16,
}

#[derive(Debug, Serialize)]
struct StopResponse {
    success: bool,
    message: String,
    terminated: bool,
}

/// HTTP listener for the control API
pub struct ControlServer {
    listener: TcpListener,
    supervisor: Arc<Supervisor>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ControlServer {
    /// Bind the control listener. Failing to bind is fatal to the caller.
    pub async fn bind(
        addr: SocketAddr,
        supervisor: Arc<Supervisor>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            supervisor,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.local_addr()?, "Control API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let supervisor = Arc::clone(&self.supervisor);
                            tokio::spawn(async move {
                                if let Err(e) = serve_control_connection(stream, supervisor).await {
                                    debug!(addr = %addr, error = %e, "Control connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept control connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Control server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_control_connection(stream: TcpStream, supervisor: Arc<Supervisor>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let supervisor = Arc::clone(&supervisor);
        async move { handle_control_request(req, supervisor).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Control connection error: {}", e))?;

    Ok(())
}

/// Run a supervisor operation in its own task so a client hanging up
/// never abandons a half-finished launch or kill sequence.
async fn detached<T, F>(operation: F) -> Result<T, SupervisorError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, SupervisorError>> + Send + 'static,
{
    tokio::spawn(operation).await.unwrap_or_else(|e| {
        Err(SupervisorError::Io(std::io::Error::other(format!(
            "operation task failed: {}",
            e
        ))))
    })
}

/// `/control/{name}/{action}` split into its parts
fn parse_control_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix("/control/")?;
    let (name, action) = rest.split_once('/')?;
    if name.is_empty() || action.is_empty() || action.contains('/') {
        return None;
    }
    Some((name, action))
}

async fn handle_control_request(
    req: Request<Incoming>,
    supervisor: Arc<Supervisor>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "Control API request");

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => text_response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            }),
        ),

        (&Method::POST, "/deploy") => {
            let body = req.collect().await?.to_bytes();
            match serde_json::from_slice::<DeployRequest>(&body) {
                Ok(request) => deploy(request, supervisor).await,
                Err(e) => {
                    warn!(error = %e, "Malformed deploy request");
                    error_response(
                        StatusCode::BAD_REQUEST,
                        "INVALID_REQUEST",
                        format!("Invalid request body: {}", e),
                    )
                }
            }
        }

        (&Method::GET, "/status") => json_response(StatusCode::OK, &supervisor.status().await),

        (&Method::GET, "/apps") => match supervisor.list_apps().await {
            Ok(names) => json_response(StatusCode::OK, &names),
            Err(e) => {
                error!(error = %e, "Failed to read registry snapshot");
                supervisor_error_response(&e)
            }
        },

        (method, path) if path.starts_with("/control/") => match parse_control_path(path) {
            Some((name, "stop")) if method == Method::POST => stop(name.to_string(), supervisor).await,
            Some((name, "restart")) if method == Method::POST => {
                restart(name.to_string(), supervisor).await
            }
            Some((name, "logs")) if method == Method::GET => match supervisor.logs(name) {
                Ok(tail) => text_response(StatusCode::OK, tail),
                Err(e) => supervisor_error_response(&e),
            },
            _ => not_found(),
        },

        _ => not_found(),
    };

    Ok(response)
}

fn not_found() -> Response<Full<Bytes>> {
    error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "Not found")
}

async fn deploy(request: DeployRequest, supervisor: Arc<Supervisor>) -> Response<Full<Bytes>> {
    let name = request.name.clone();
    match detached(async move { supervisor.deploy(request).await }).await {
        Ok(port) => json_response(
            StatusCode::OK,
            &DeployResponse {
                success: true,
                message: format!("Deployed \"{}\" on port {}", name, port),
                port,
            },
        ),
        Err(e) => {
            warn!(app = %name, error = %e, "Deploy failed");
            supervisor_error_response(&e)
        }
    }
}

async fn stop(name: String, supervisor: Arc<Supervisor>) -> Response<Full<Bytes>> {
    let op_name = name.clone();
    match detached(async move { supervisor.stop(&op_name).await }).await {
        Ok(outcome) => json_response(
            StatusCode::OK,
            &StopResponse {
                success: true,
                message: stop_message(&name, &outcome),
                terminated: outcome.terminated,
            },
        ),
        Err(e) => {
            warn!(app = %name, error = %e, "Stop failed");
            supervisor_error_response(&e)
        }
    }
}

fn stop_message(name: &str, outcome: &StopOutcome) -> String {
    match outcome.reclaimed {
        0 => format!("Stopped \"{}\"", name),
        1 => format!("Stopped \"{}\" (killed an orphaned process holding its port)", name),
        n => format!("Stopped \"{}\" (killed {} orphaned processes holding its port)", name, n),
    }
}

async fn restart(name: String, supervisor: Arc<Supervisor>) -> Response<Full<Bytes>> {
    let op_name = name.clone();
    match detached(async move { supervisor.restart(&op_name).await }).await {
        Ok(port) => json_response(
            StatusCode::OK,
            &DeployResponse {
                success: true,
                message: format!("Restarted \"{}\" on port {}", name, port),
                port,
            },
        ),
        Err(e) => {
            warn!(app = %name, error = %e, "Restart failed");
            supervisor_error_response(&e)
        }
    }
}
