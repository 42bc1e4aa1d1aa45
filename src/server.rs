//! The listening side: per-request pipeline and accept loop

use hyper::body::Incoming;
use hyper::header::{HeaderMap, HOST};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::app::{route_source, Application};
use crate::config::Config;
use crate::error::ProxyBody;
use crate::forwarded::{ConnectionInfo, ForwardedHeaders, ScopeKind, TrustedHosts};
use crate::hotfile::Rendezvous;
use crate::pool::{PoolConfig, Upstream};
use crate::proxy::{decode_path, DevProxy, ProxyOutcome};
use crate::routes::RoutePrefixIndex;
use crate::tunnel::{is_websocket_upgrade, requests_hmr_protocol, HmrTunnel};

/// Everything one request passes through: forwarded headers, the HMR
/// tunnel, the dev proxy and finally the application.
pub struct Gateway {
    forwarded: Option<ForwardedHeaders>,
    proxy: DevProxy,
    tunnel: HmrTunnel,
    app: Arc<dyn Application>,
}

impl Gateway {
    pub fn new(proxy: DevProxy, tunnel: HmrTunnel, app: Arc<dyn Application>) -> Self {
        Self {
            forwarded: None,
            proxy,
            tunnel,
            app,
        }
    }

    /// Honor `X-Forwarded-*` from trusted callers (builder pattern)
    pub fn with_forwarded(mut self, forwarded: ForwardedHeaders) -> Self {
        self.forwarded = Some(forwarded);
        self
    }

    /// Wire up the full pipeline from configuration.
    pub fn from_config(config: &Config, app: Arc<dyn Application>, rendezvous: Arc<Rendezvous>) -> anyhow::Result<Self> {
        let upstream = upstream_from_config(config);
        let routes = Arc::new(RoutePrefixIndex::new(route_source(app.clone())));
        let proxy = DevProxy::from_config(config, routes, rendezvous, upstream)?;
        let tunnel = HmrTunnel::new(proxy.targets().clone(), config.proxy.ws_open_timeout());

        let mut gateway = Self::new(proxy, tunnel, app);
        if config.forwarded.enabled {
            let trusted = TrustedHosts::from_entries(config.forwarded.trusted_hosts.entries());
            gateway = gateway.with_forwarded(ForwardedHeaders::new(trusted, config.forwarded.honor_host));
        }
        Ok(gateway)
    }

    pub fn proxy(&self) -> &DevProxy {
        &self.proxy
    }

    /// Whether the application's router serves `path`
    pub fn owned_by_application(&self, path: &str) -> bool {
        self.proxy.policy().routes().matches(&decode_path(path))
    }

    /// Whether `path` would be forwarded to the frontend tool
    pub fn is_proxy_target(&self, path: &str) -> bool {
        self.proxy.is_proxy_target(path)
    }

    /// Whether a WebSocket upgrade for `path` belongs to the HMR tunnel.
    ///
    /// The root is the HMR endpoint when the frontend is served from `/`, so
    /// an HMR subprotocol there wins over an application route for `/`.
    pub fn tunnels_websocket(&self, path: &str, headers: &HeaderMap) -> bool {
        let hmr = requests_hmr_protocol(headers);
        if hmr && path == "/" {
            return true;
        }
        !self.owned_by_application(path) && (hmr || self.proxy.is_proxy_target(path))
    }

    pub async fn handle(&self, mut req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        let websocket = is_websocket_upgrade(&req);
        let (kind, scheme) = if websocket {
            (ScopeKind::WebSocket, "ws")
        } else {
            (ScopeKind::Http, "http")
        };

        let info = match &self.forwarded {
            Some(forwarded) => forwarded.apply(&mut req, peer, scheme, kind),
            None => {
                let info = ConnectionInfo {
                    scheme: scheme.to_string(),
                    client: peer.ip().to_string(),
                    original_host: req.headers().get(HOST).and_then(|v| v.to_str().ok()).map(String::from),
                };
                req.extensions_mut().insert(info.clone());
                info
            }
        };

        debug!(
            method = %req.method(),
            uri = %req.uri(),
            client = %info.client,
            scheme = %info.scheme,
            "Incoming request"
        );

        if websocket && self.tunnels_websocket(req.uri().path(), req.headers()) {
            return self.tunnel.handle(req);
        }

        match self.proxy.handle(req).await {
            ProxyOutcome::Handled(response) => response,
            ProxyOutcome::Delegate(req) => self.app.handle(req).await,
        }
    }
}

/// Pooled or one-shot upstream client, per `[server].use_pool`
pub fn upstream_from_config(config: &Config) -> Upstream {
    if config.server.use_pool {
        Upstream::pooled(PoolConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: std::time::Duration::from_secs(config.server.pool_idle_timeout_secs),
        })
    } else {
        Upstream::one_shot()
    }
}

/// HTTP/1.1 and HTTP/2 listener in front of a [`Gateway`]
pub struct DevServer {
    listener: TcpListener,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
}

impl DevServer {
    pub async fn bind(addr: SocketAddr, gateway: Arc<Gateway>, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            gateway,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        info!(%addr, "Dev server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let _ = stream.set_nodelay(true);
                            let gateway = Arc::clone(&self.gateway);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer, gateway).await {
                                    debug!(%peer, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Dev server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, peer: SocketAddr, gateway: Arc<Gateway>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        async move { Ok::<_, Infallible>(gateway.handle(req, peer).await) }
    });

    // WebSocket upgrades ride on HTTP/1.1 connections
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
