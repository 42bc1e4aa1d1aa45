//! Upstream HTTP clients
//!
//! A shared pooled client is created once and reused by every proxied request.
//! When pooling is disabled, each request opens and drives its own connection.

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::ForwardError;
use crate::hotfile::Target;

/// Statistics for the upstream clients
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests sent upstream
    pub total_requests: AtomicU64,
    /// Requests that failed before a response arrived
    pub failed_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
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

/// A keep-alive connection pool shared across proxied requests
pub struct ConnectionPool {
    client: Client<HttpConnector, Full<Bytes>>,
    config: PoolConfig,
}

impl ConnectionPool {
    /// Create a new connection pool with the given configuration
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

    /// Get the pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    async fn send(&self, req: Request<Full<Bytes>>) -> Result<Response<Incoming>, ForwardError> {
        self.client.request(req).await.map_err(|e| {
            if e.is_connect() {
                ForwardError::Connect(e.to_string())
            } else {
                ForwardError::Upstream(e.to_string())
            }
        })
    }
}

/// How proxied requests reach the upstream
#[derive(Clone)]
pub enum UpstreamClient {
    /// Shared keep-alive pool
    Pooled(Arc<ConnectionPool>),
    /// Fresh connection per request
    OneShot,
}

/// An upstream client plus its counters
#[derive(Clone)]
pub struct Upstream {
    client: UpstreamClient,
    stats: Arc<PoolStats>,
}

impl Upstream {
    pub fn pooled(config: PoolConfig) -> Self {
        Self::new(UpstreamClient::Pooled(Arc::new(ConnectionPool::new(config))))
    }

    pub fn one_shot() -> Self {
        Self::new(UpstreamClient::OneShot)
    }

    pub fn new(client: UpstreamClient) -> Self {
        Self {
            client,
            stats: Arc::new(PoolStats::default()),
        }
    }

    /// Get statistics
    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_pooled(&self) -> bool {
        matches!(self.client, UpstreamClient::Pooled(_))
    }

    /// Send a request whose URI is absolute (`http://host:port/path?query`)
    pub async fn send(&self, req: Request<Full<Bytes>>, target: &Target) -> Result<Response<Incoming>, ForwardError> {
        self.stats.record_request();

        let result = match self.client {
            UpstreamClient::Pooled(ref pool) => pool.send(req).await,
            UpstreamClient::OneShot => send_one_shot(req, target).await,
        };

        if result.is_err() {
            self.stats.record_failure();
        }
        result
    }
}

async fn send_one_shot(mut req: Request<Full<Bytes>>, target: &Target) -> Result<Response<Incoming>, ForwardError> {
    let stream = TcpStream::connect((target.host.as_str(), target.port))
        .await
        .map_err(|e| ForwardError::Connect(e.to_string()))?;
    let _ = stream.set_nodelay(true);

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| ForwardError::Connect(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "One-shot upstream connection closed with error");
        }
    });

    // Origin-form on a direct connection
    let origin: Uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| ForwardError::RequestBuild(e.to_string()))?;
    *req.uri_mut() = origin;

    sender
        .send_request(req)
        .await
        .map_err(|e| ForwardError::Upstream(e.to_string()))
}
