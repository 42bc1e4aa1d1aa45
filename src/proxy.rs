//! HTTP reverse proxy in front of the frontend dev server.
//!
//! One [`DevProxy`] serves both policies. In `spa` mode the tool only serves
//! assets and HMR infrastructure, so only an allow-list of prefixes is
//! forwarded. In `ssr` mode the tool renders pages, so everything is forwarded
//! except paths the host application owns.

use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, CONNECTION, HOST};
use hyper::{Request, Response, Uri};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{Config, FrontendMode, ProxyConfig};
use crate::error::{error_response, ForwardError, ProxyBody, ProxyErrorCode};
use crate::forwarded::{ConnectionInfo, X_FORWARDED_FOR, X_FORWARDED_HOST, X_FORWARDED_PROTO};
use crate::hotfile::{Rendezvous, Target};
use crate::pool::Upstream;
use crate::routes::RoutePrefixIndex;

/// Header name for request ID
pub const X_REQUEST_ID: &str = "x-request-id";

/// Dev server internals: client runtime, module ids, file system access,
/// pre-bundled deps, ping and HMR endpoints
pub const INFRA_PREFIXES: &[&str] = &[
    "/@vite",
    "/@id/",
    "/@fs/",
    "/@react-refresh",
    "/node_modules/.vite/",
    "/__vite_ping",
    "/vite-hmr",
];

/// Headers meaningful for a single transport hop only
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "content-length",
    "content-encoding",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
];

/// Prefixes forwarded in allow-list mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowPrefixes {
    prefixes: Vec<String>,
}

impl AllowPrefixes {
    /// Infrastructure prefixes plus the given directories, each normalized
    /// to `/dir/`
    pub fn new<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut prefixes: Vec<String> = INFRA_PREFIXES.iter().map(|p| p.to_string()).collect();
        for prefix in extra.into_iter().filter_map(|p| normalize_prefix(p.as_ref())) {
            if !prefixes.contains(&prefix) {
                prefixes.push(prefix);
            }
        }
        Self { prefixes }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        let extra = std::iter::once(config.asset_url.as_str())
            .chain(config.resource_dir.as_deref())
            .chain(config.allow_prefixes.iter().map(String::as_str));
        Self::new(extra)
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    pub fn matches(&self, path: &str) -> bool {
        self.prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }
}

/// `static`, `/static`, `static/` all become `/static/`. Absolute URLs
/// (assets on a CDN) and the bare root yield nothing.
pub fn normalize_prefix(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.contains("://") {
        return None;
    }
    let inner = raw.trim_matches('/');
    if inner.is_empty() {
        return None;
    }
    Some(format!("/{}/", inner))
}

/// Which requests go to the frontend tool. Chosen once at startup.
#[derive(Debug, Clone)]
pub enum ProxyPolicy {
    /// Forward infrastructure and asset prefixes only
    AllowList {
        prefixes: AllowPrefixes,
        routes: Arc<RoutePrefixIndex>,
    },
    /// Forward everything the application does not own
    DenyList { routes: Arc<RoutePrefixIndex> },
}

impl ProxyPolicy {
    /// `path` must already be percent-decoded
    pub fn should_proxy(&self, path: &str) -> bool {
        match self {
            ProxyPolicy::AllowList { prefixes, routes } => prefixes.matches(path) && !routes.matches(path),
            ProxyPolicy::DenyList { routes } => !routes.matches(path),
        }
    }

    pub fn routes(&self) -> &Arc<RoutePrefixIndex> {
        match self {
            ProxyPolicy::AllowList { routes, .. } | ProxyPolicy::DenyList { routes } => routes,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProxyPolicy::AllowList { .. } => "allow-list",
            ProxyPolicy::DenyList { .. } => "deny-list",
        }
    }
}

/// Where the upstream address comes from
#[derive(Debug, Clone)]
pub enum TargetSource {
    /// Statically configured
    Fixed(Target),
    /// Published by the tool through the hot file
    Rendezvous(Arc<Rendezvous>),
}

impl TargetSource {
    pub fn resolve(&self) -> Option<Target> {
        match self {
            TargetSource::Fixed(target) => Some(target.clone()),
            TargetSource::Rendezvous(rendezvous) => rendezvous.resolve(),
        }
    }

    /// HMR endpoint: the `.hmr` record when present, else the main one
    pub fn resolve_hmr(&self) -> Option<Target> {
        match self {
            TargetSource::Fixed(target) => Some(target.clone()),
            TargetSource::Rendezvous(rendezvous) => rendezvous.resolve_hmr(),
        }
    }

    fn describe(&self) -> String {
        match self {
            TargetSource::Fixed(target) => target.to_string(),
            TargetSource::Rendezvous(rendezvous) => rendezvous.primary().path().display().to_string(),
        }
    }
}

/// Result of offering a request to the proxy
pub enum ProxyOutcome<B> {
    /// Not ours: hand the untouched request to the next handler
    Delegate(Request<B>),
    /// Answered by the proxy (upstream response or error)
    Handled(Response<ProxyBody>),
}

impl<B> fmt::Debug for ProxyOutcome<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyOutcome::Delegate(req) => f.debug_tuple("Delegate").field(&req.uri()).finish(),
            ProxyOutcome::Handled(resp) => f.debug_tuple("Handled").field(&resp.status()).finish(),
        }
    }
}

/// Reverse proxy to the frontend dev server
pub struct DevProxy {
    policy: ProxyPolicy,
    targets: TargetSource,
    upstream: Upstream,
    timeout: Duration,
}

impl DevProxy {
    pub fn new(policy: ProxyPolicy, targets: TargetSource, upstream: Upstream, timeout: Duration) -> Self {
        Self {
            policy,
            targets,
            upstream,
            timeout,
        }
    }

    /// Build the proxy the configuration describes. Page renders get the
    /// longer timeout.
    pub fn from_config(
        config: &Config,
        routes: Arc<RoutePrefixIndex>,
        rendezvous: Arc<Rendezvous>,
        upstream: Upstream,
    ) -> anyhow::Result<Self> {
        let targets = match config.frontend.fixed_target()? {
            Some(target) => TargetSource::Fixed(target),
            None => TargetSource::Rendezvous(rendezvous),
        };

        let (policy, timeout) = match config.frontend.mode {
            FrontendMode::Spa => (
                ProxyPolicy::AllowList {
                    prefixes: AllowPrefixes::from_config(&config.proxy),
                    routes,
                },
                config.proxy.request_timeout(),
            ),
            FrontendMode::Ssr => (ProxyPolicy::DenyList { routes }, config.proxy.render_timeout()),
        };

        Ok(Self::new(policy, targets, upstream, timeout))
    }

    pub fn policy(&self) -> &ProxyPolicy {
        &self.policy
    }

    pub fn targets(&self) -> &TargetSource {
        &self.targets
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    /// Whether a request for `path` (raw, possibly percent-encoded) would be
    /// forwarded to the frontend tool
    pub fn is_proxy_target(&self, path: &str) -> bool {
        self.policy.should_proxy(&decode_path(path))
    }

    /// Forward the request if the policy takes it, otherwise give it back.
    pub async fn handle<B>(&self, req: Request<B>) -> ProxyOutcome<B>
    where
        B: Body<Data = Bytes>,
        B::Error: fmt::Display,
    {
        if !self.is_proxy_target(req.uri().path()) {
            return ProxyOutcome::Delegate(req);
        }

        let Some(target) = self.targets.resolve() else {
            debug!(path = %req.uri().path(), "No rendezvous record, frontend not running");
            return ProxyOutcome::Handled(error_response(
                ProxyErrorCode::NotRunning,
                format!(
                    "Frontend dev server not running (no address published at {}). Start it and reload.",
                    self.targets.describe()
                ),
            ));
        };

        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let response = match self.forward(req, &target).await {
            Ok(response) => {
                debug!(%method, path, status = response.status().as_u16(), %target, "Proxied request");
                response
            }
            Err(ForwardError::BodyRead(e)) => {
                // Client went away mid-body
                debug!(%method, path, error = %e, "Failed to read request body");
                error_response(ProxyErrorCode::BadRequest, format!("failed to read request body: {}", e))
            }
            Err(e) => {
                warn!(%method, path, %target, error = %e, "Failed to proxy request");
                e.into_response()
            }
        };
        ProxyOutcome::Handled(response)
    }

    async fn forward<B>(&self, req: Request<B>, target: &Target) -> Result<Response<ProxyBody>, ForwardError>
    where
        B: Body<Data = Bytes>,
        B::Error: fmt::Display,
    {
        forward_request(&self.upstream, req, target, self.timeout, HostHeader::Upstream).await
    }
}

/// What the forwarded request carries as `Host`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostHeader {
    /// The upstream authority; the original goes out as `X-Forwarded-Host`
    Upstream,
    /// The client's original value, mirrored into `X-Forwarded-Host`
    Preserve,
}

/// Buffer `req`, rewrite it for `target` and send it with a deadline.
pub async fn forward_request<B>(
    upstream: &Upstream,
    req: Request<B>,
    target: &Target,
    timeout: Duration,
    host_header: HostHeader,
) -> Result<Response<ProxyBody>, ForwardError>
where
    B: Body<Data = Bytes>,
    B::Error: fmt::Display,
{
    let (parts, body) = req.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|e| ForwardError::BodyRead(e.to_string()))?
        .to_bytes();

    let path_and_query = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let uri: Uri = target
        .http_url(path_and_query)
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| ForwardError::RequestBuild(e.to_string()))?;

    let original_host = parts
        .headers
        .get(HOST)
        .cloned()
        .or_else(|| parts.uri.authority().and_then(|a| HeaderValue::from_str(a.as_str()).ok()));
    let info = parts.extensions.get::<ConnectionInfo>();

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    // Encoded bodies would lose their Content-Encoding on the way back
    headers.remove(ACCEPT_ENCODING);

    let request_id = headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Some(info) = info {
        if let Ok(value) = HeaderValue::from_str(&info.client) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        if let Ok(value) = HeaderValue::from_str(&info.scheme) {
            headers.insert(X_FORWARDED_PROTO, value);
        }
    }

    match (host_header, original_host) {
        (HostHeader::Upstream, original) => {
            if let Some(host) = original {
                headers.insert(X_FORWARDED_HOST, host);
            }
            let authority = HeaderValue::from_str(&target.authority())
                .map_err(|e| ForwardError::RequestBuild(e.to_string()))?;
            headers.insert(HOST, authority);
        }
        (HostHeader::Preserve, Some(host)) => {
            headers.insert(X_FORWARDED_HOST, host.clone());
            headers.insert(HOST, host);
        }
        (HostHeader::Preserve, None) => {
            headers.remove(X_FORWARDED_HOST);
        }
    }

    let mut upstream_req = Request::new(Full::new(body));
    *upstream_req.method_mut() = parts.method;
    *upstream_req.uri_mut() = uri;
    *upstream_req.headers_mut() = headers;

    debug!(request_id, %target, "Forwarding request upstream");

    let response = match tokio::time::timeout(timeout, upstream.send(upstream_req, target)).await {
        Ok(result) => result?,
        Err(_) => return Err(ForwardError::Timeout(timeout)),
    };

    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Ok(Response::from_parts(parts, body.boxed()))
}

impl fmt::Debug for DevProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevProxy")
            .field("policy", &self.policy.name())
            .field("targets", &self.targets)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Percent-decode for matching only; undecodable paths are matched raw.
pub fn decode_path(path: &str) -> String {
    urlencoding::decode(path)
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| path.to_string())
}

/// Remove hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}
