//! Pooled HTTP client used to forward proxied requests to app ports

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::ServerConfig;

/// Errors forwarding a request to an app
#[derive(Debug, Error)]
pub enum PoolError {
    /// Nothing accepted the TCP connection
    #[error("connection to 127.0.0.1:{port} failed: {source}")]
    Connect {
        port: u16,
        #[source]
        source: hyper_util::client::legacy::Error,
    },

    /// Connected, but the exchange failed midway
    #[error("request to 127.0.0.1:{port} failed: {source}")]
    Client {
        port: u16,
        #[source]
        source: hyper_util::client::legacy::Error,
    },

    #[error("could not build upstream request: {0}")]
    RequestBuild(String),
}

/// Idle-connection settings for the pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per app port
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

impl From<&ServerConfig> for PoolConfig {
    fn from(server: &ServerConfig) -> Self {
        Self {
            max_idle_per_host: server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(server.pool_idle_timeout_secs),
        }
    }
}

/// Keep-alive connections to every app port, shared by all proxy connections
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self { client, config }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Send `req` to `127.0.0.1:<port>`, keeping method, path, headers and
    /// body, with the Host header rewritten to the target address.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        port: u16,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let upstream = upstream_request(req, port)?;

        let response = self.client.request(upstream).await.map_err(|source| {
            if source.is_connect() {
                PoolError::Connect { port, source }
            } else {
                PoolError::Client { port, source }
            }
        })?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Target address in `host:port` form, used for the rewritten Host header
pub fn upstream_authority(port: u16) -> String {
    format!("127.0.0.1:{}", port)
}

fn upstream_request<B>(req: Request<B>, port: u16) -> Result<Request<B>, PoolError> {
    let authority = upstream_authority(port);
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = format!("http://{}{}", authority, path);

    let (mut parts, body) = req.into_parts();
    parts.uri = uri
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| PoolError::RequestBuild(e.to_string()))?;
    let host = HeaderValue::from_str(&authority)
        .map_err(|e| PoolError::RequestBuild(e.to_string()))?;
    parts.headers.insert(HOST, host);

    Ok(Request::from_parts(parts, body))
}
