//! Subdomain reverse proxy
//!
//! `<name>.<local_domain>` is forwarded to the port registered for `name`.
//! Plain requests go through the pooled client; upgrade requests
//! (WebSocket) are relayed over a raw TCP connection and then copied in
//! both directions.

use dashmap::DashMap;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{gateway_error_response, ProxyErrorCode};
use crate::pool::{upstream_authority, ConnectionPool, PoolConfig, PoolError};
use crate::supervisor::Supervisor;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Body served for `/` on the bare local domain
pub const LIVENESS_TEXT: &str = "burrow proxy running";

/// Largest upgrade response head we are willing to buffer
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

/// Largest rejection body relayed back when an app refuses an upgrade
const MAX_REJECTION_BODY: usize = 1024 * 1024;

/// How long to wait for the rest of a rejection body
const REJECTION_BODY_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum hostname length (RFC 1035)
const MAX_HOSTNAME_LEN: usize = 253;

/// In-memory map of app name to port. Routes are added on every
/// successful launch and never removed.
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: DashMap<String, u16>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the route for `name`
    pub fn register(&self, name: &str, port: u16) {
        if let Some(previous) = self.routes.insert(name.to_string(), port) {
            if previous != port {
                debug!(app = name, previous, port, "Route updated");
            }
        } else {
            debug!(app = name, port, "Route registered");
        }
    }

    pub fn lookup(&self, name: &str) -> Option<u16> {
        self.routes.get(name).map(|p| *p)
    }
}

/// Where a request's Host points
#[derive(Debug, PartialEq, Eq)]
enum Target {
    /// The bare local domain
    Root,
    /// An app subdomain
    App(String),
}

/// Only hosts under `.<local_domain>` name an app; every other host,
/// bare IPs included, is treated as the root.
fn resolve_target(hostname: &str, local_domain: &str) -> Target {
    let domain = local_domain.trim_end_matches('.').to_ascii_lowercase();
    let subdomains = hostname
        .strip_suffix(domain.as_str())
        .and_then(|rest| rest.strip_suffix('.'));

    match subdomains.and_then(|rest| rest.split('.').next()) {
        Some(label) if !label.is_empty() => Target::App(label.to_string()),
        _ => Target::Root,
    }
}

/// State shared by every proxied connection
struct ProxyContext {
    supervisor: Arc<Supervisor>,
    pool: ConnectionPool,
    local_domain: String,
    request_timeout: Duration,
}

/// The public reverse proxy listener
pub struct ProxyServer {
    listener: TcpListener,
    context: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Bind the proxy listener. Failing to bind is fatal to the caller.
    pub async fn bind(
        addr: SocketAddr,
        supervisor: Arc<Supervisor>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        let server_config = &supervisor.config().server;
        let context = ProxyContext {
            pool: ConnectionPool::new(PoolConfig::from(server_config)),
            local_domain: server_config.local_domain.to_lowercase(),
            request_timeout: server_config.request_timeout(),
            supervisor: Arc::clone(&supervisor),
        };

        Ok(Self {
            listener,
            context: Arc::new(context),
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            addr = %self.local_addr()?,
            domain = %self.context.local_domain,
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, context).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    context: Arc<ProxyContext>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move { handle_request(req, context, addr).await }
    });

    // HTTP/1.1 connections can still upgrade; h2c is accepted too
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    context: Arc<ProxyContext>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let Some(hostname) = extract_hostname(&req) else {
        return Ok(gateway_error_response(
            ProxyErrorCode::MissingHostHeader,
            "Missing or invalid Host header",
        ));
    };

    let name = match resolve_target(&hostname, &context.local_domain) {
        Target::Root if req.uri().path() == "/" => return Ok(liveness_response()),
        Target::Root => {
            return Ok(gateway_error_response(ProxyErrorCode::NotFound, "Not found"));
        }
        Target::App(name) => name,
    };

    let Some(port) = context.supervisor.routes().lookup(&name) else {
        debug!(app = %name, hostname, request_id, "No route for subdomain");
        return Ok(gateway_error_response(
            ProxyErrorCode::UnknownApp,
            format!("No app deployed as \"{}\"", name),
        ));
    };

    // Overwrite rather than append: this proxy is the first trusted hop
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(app = %name, port, method = %req.method(), uri = %req.uri(), request_id, "Proxying request");

    if is_upgrade_request(&req) {
        return handle_upgrade(req, name, port, request_id).await;
    }

    let result =
        tokio::time::timeout(context.request_timeout, context.pool.send_request(req, port)).await;

    match result {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(PoolError::Connect { source, .. })) => {
            warn!(app = %name, port, error = %source, "App is not accepting connections");
            Ok(unreachable_response(&name, port))
        }
        Ok(Err(e)) => {
            error!(app = %name, port, error = %e, "Failed to forward request");
            Ok(gateway_error_response(
                ProxyErrorCode::BackendUnreachable,
                format!("App \"{}\" on port {} failed to respond", name, port),
            ))
        }
        Err(_) => {
            warn!(
                app = %name,
                port,
                timeout_secs = context.request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(gateway_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "App \"{}\" did not respond within {} seconds",
                    name,
                    context.request_timeout.as_secs()
                ),
            ))
        }
    }
}

fn liveness_response() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(
            Full::new(Bytes::from_static(LIVENESS_TEXT.as_bytes()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}

fn unreachable_response(name: &str, port: u16) -> Response<BoxBody<Bytes, hyper::Error>> {
    gateway_error_response(
        ProxyErrorCode::BackendUnreachable,
        format!("App \"{}\" is not reachable on port {}", name, port),
    )
}

fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            let hostname = h.split(':').next()?;

            if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
                return None;
            }

            // Keeps control characters out of logs and lookups
            if !hostname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            {
                return None;
            }

            Some(hostname.to_lowercase())
        })
}

fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Raw HTTP/1.1 request head for the upgrade handshake, Host rewritten
fn build_upgrade_request<B>(req: &Request<B>, port: u16) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut head = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            head.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    head.push_str(&format!("Host: {}\r\n\r\n", upstream_authority(port)));
    head.into_bytes()
}

/// Split a buffered upgrade response into status, headers and any bytes
/// that arrived after the head.
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>, Vec<u8>)> {
    let head_end = find_head_end(data)?;
    let head = std::str::from_utf8(&data[..head_end]).ok()?;
    let mut lines = head.split("\r\n");

    // HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let code: u16 = status_line.split(' ').nth(1)?.parse().ok()?;
    let status = StatusCode::from_u16(code).ok()?;

    let headers = lines
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    Some((status, headers, data[head_end + 4..].to_vec()))
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Send the upgrade request head and buffer the app's response head
async fn upgrade_handshake(stream: &mut TcpStream, raw_request: &[u8]) -> std::io::Result<Vec<u8>> {
    stream.write_all(raw_request).await?;
    read_upgrade_head(stream).await
}

async fn read_upgrade_head(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "app closed connection before responding to upgrade",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if find_head_end(&buf).is_some() {
            return Ok(buf);
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upgrade response head too large",
            ));
        }
    }
}

async fn handle_upgrade(
    req: Request<Incoming>,
    name: String,
    port: u16,
    request_id: String,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let upgrade_type = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string());
    debug!(app = %name, request_id, upgrade_type, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, port);

    let mut backend = match TcpStream::connect(upstream_authority(port)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(app = %name, port, error = %e, "App is not accepting upgrade connections");
            return Ok(unreachable_response(&name, port));
        }
    };

    let parsed = match upgrade_handshake(&mut backend, &raw_request).await {
        Ok(buf) => parse_upgrade_response(&buf),
        Err(e) => {
            error!(app = %name, error = %e, "Upgrade handshake with app failed");
            return Ok(gateway_error_response(
                ProxyErrorCode::BackendUnreachable,
                format!("App \"{}\" failed the upgrade handshake", name),
            ));
        }
    };

    let Some((status, response_headers, leftover)) = parsed else {
        error!(app = %name, "Invalid upgrade response from app");
        return Ok(gateway_error_response(
            ProxyErrorCode::BackendUnreachable,
            format!("App \"{}\" sent an invalid upgrade response", name),
        ));
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(app = %name, status = %status, "App rejected upgrade request");
        let framing = rejection_framing(status, &response_headers);
        let read = read_rejection_body(&mut backend, framing, leftover);
        let body = match tokio::time::timeout(REJECTION_BODY_TIMEOUT, read).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                error!(app = %name, error = %e, "Failed to read upgrade rejection body");
                return Ok(gateway_error_response(
                    ProxyErrorCode::BackendUnreachable,
                    format!("App \"{}\" sent an incomplete response", name),
                ));
            }
            Err(_) => {
                error!(app = %name, "Timed out reading upgrade rejection body");
                return Ok(gateway_error_response(
                    ProxyErrorCode::BackendUnreachable,
                    format!("App \"{}\" sent an incomplete response", name),
                ));
            }
        };

        let mut response = Response::builder().status(status);
        for (header, value) in &response_headers {
            if header.eq_ignore_ascii_case("transfer-encoding")
                || header.eq_ignore_ascii_case("content-length")
            {
                continue;
            }
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(header.as_str(), hv);
            }
        }
        return Ok(response
            .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
            .expect("valid response builder"));
    }

    info!(app = %name, request_id, upgrade_type, "Upgrade accepted by app");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (header, value) in &response_headers {
        if header.eq_ignore_ascii_case("content-length")
            || header.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(header.as_str(), hv);
        }
    }
    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => relay(upgraded, backend, leftover, &name, &request_id).await,
            Err(e) => error!(app = %name, error = %e, "Failed to upgrade client connection"),
        }
    });

    Ok(response)
}

/// How the body of a refused upgrade is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    Empty,
    Length(usize),
    Chunked,
    UntilClose,
}

fn rejection_framing(status: StatusCode, headers: &[(String, String)]) -> BodyFraming {
    if status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return BodyFraming::Empty;
    }

    let header = |wanted: &str| {
        headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(wanted))
            .map(|(_, value)| value.as_str())
    };

    if header("transfer-encoding").is_some_and(|v| v.to_ascii_lowercase().contains("chunked")) {
        return BodyFraming::Chunked;
    }
    match header("content-length").and_then(|v| v.parse::<usize>().ok()) {
        Some(len) => BodyFraming::Length(len),
        None => BodyFraming::UntilClose,
    }
}

/// Read the remainder of a rejection body. `body` holds whatever arrived
/// together with the response head.
async fn read_rejection_body<R: AsyncRead + Unpin>(
    backend: &mut R,
    framing: BodyFraming,
    mut body: Vec<u8>,
) -> std::io::Result<Vec<u8>> {
    let mut chunk = [0u8; 4096];
    loop {
        match framing {
            BodyFraming::Empty => return Ok(Vec::new()),
            BodyFraming::Length(len) if body.len() >= len => {
                body.truncate(len);
                return Ok(body);
            }
            BodyFraming::Chunked => {
                if let Some(decoded) = decode_chunked(&body) {
                    return Ok(decoded);
                }
            }
            _ => {}
        }

        if body.len() > MAX_REJECTION_BODY {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upgrade rejection body too large",
            ));
        }

        let n = backend.read(&mut chunk).await?;
        if n == 0 {
            return match framing {
                BodyFraming::UntilClose => Ok(body),
                _ => Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "app closed connection mid-body",
                )),
            };
        }
        body.extend_from_slice(&chunk[..n]);
    }
}

/// Decode a complete chunked body, or `None` while more data is needed
fn decode_chunked(data: &[u8]) -> Option<Vec<u8>> {
    let mut decoded = Vec::new();
    let mut rest = data;
    loop {
        let line_end = rest.windows(2).position(|w| w == b"\r\n")?;
        let size_line = std::str::from_utf8(&rest[..line_end]).ok()?;
        let size = usize::from_str_radix(size_line.split(';').next()?.trim(), 16).ok()?;
        rest = &rest[line_end + 2..];

        if size == 0 {
            // Trailers, if any, end with an empty line
            let done = rest.starts_with(b"\r\n") || find_head_end(rest).is_some();
            return done.then_some(decoded);
        }
        if rest.len() < size + 2 {
            return None;
        }
        decoded.extend_from_slice(&rest[..size]);
        rest = &rest[size + 2..];
    }
}

/// Copy bytes both ways until either side closes
async fn relay(client: Upgraded, mut backend: TcpStream, leftover: Vec<u8>, name: &str, request_id: &str) {
    let mut client_io = TokioIo::new(client);

    if !leftover.is_empty() {
        if let Err(e) = client_io.write_all(&leftover).await {
            debug!(app = name, request_id, error = %e, "Client closed before relay started");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((client_to_app, app_to_client)) => {
            debug!(app = name, request_id, client_to_app, app_to_client, "Upgraded connection closed");
        }
        Err(e) => {
            debug!(app = name, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}
