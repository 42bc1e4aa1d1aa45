//! The host application behind the gateway

use futures::future::BoxFuture;
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::{Request, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{full_body, ProxyBody};
use crate::hotfile::Target;
use crate::pool::Upstream;
use crate::proxy::{forward_request, HostHeader};
use crate::routes::{RouteSnapshot, RouteSource};

/// Receives every request the dev proxy does not take.
///
/// The route snapshot feeds the prefix index, so the frontend tool never
/// shadows a route the application serves itself.
pub trait Application: RouteSource {
    fn handle(&self, req: Request<Incoming>) -> BoxFuture<'_, Response<ProxyBody>>;
}

/// Route source view of an application, for the prefix index
pub fn route_source(app: Arc<dyn Application>) -> Arc<dyn RouteSource> {
    Arc::new(AppRoutes(app))
}

struct AppRoutes(Arc<dyn Application>);

impl RouteSource for AppRoutes {
    fn route_snapshot(&self) -> RouteSnapshot {
        self.0.route_snapshot()
    }
}

/// Forwards delegated requests to a running backend, or answers 404
pub struct BackendApp {
    routes: RouteSnapshot,
    backend: Option<Target>,
    upstream: Upstream,
    timeout: Duration,
}

impl BackendApp {
    pub fn new(routes: RouteSnapshot, backend: Option<Target>, upstream: Upstream, timeout: Duration) -> Self {
        Self {
            routes,
            backend,
            upstream,
            timeout,
        }
    }

    pub fn from_config(config: &Config, upstream: Upstream) -> anyhow::Result<Self> {
        let mut routes = RouteSnapshot::new(config.app.routes.iter().cloned());
        if let Some(docs) = &config.app.docs_path {
            routes = routes.with_docs_path(docs.clone());
        }
        let backend = config
            .app
            .backend_url
            .as_deref()
            .map(Target::parse)
            .transpose()?;
        Ok(Self::new(routes, backend, upstream, config.proxy.request_timeout()))
    }

    pub fn backend(&self) -> Option<&Target> {
        self.backend.as_ref()
    }

    async fn respond(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let Some(backend) = &self.backend else {
            debug!(path = %req.uri().path(), "No backend configured");
            return not_found();
        };

        let path = req.uri().path().to_string();
        match forward_request(&self.upstream, req, backend, self.timeout, HostHeader::Preserve).await {
            Ok(response) => response,
            Err(e) => {
                warn!(path, %backend, error = %e, "Failed to reach backend");
                e.into_response()
            }
        }
    }
}

impl RouteSource for BackendApp {
    fn route_snapshot(&self) -> RouteSnapshot {
        self.routes.clone()
    }
}

impl Application for BackendApp {
    fn handle(&self, req: Request<Incoming>) -> BoxFuture<'_, Response<ProxyBody>> {
        Box::pin(self.respond(req))
    }
}

pub fn not_found() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body("Not Found"))
        .expect("valid response with StatusCode enum and static headers")
}
