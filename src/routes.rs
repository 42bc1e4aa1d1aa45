//! Path prefixes owned by the host application's router
//!
//! Both proxy policies consult this so that a frontend dev server never
//! shadows a real application route.

use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Prefixes treated as application-owned even when not registered explicitly
pub const CONVENTIONAL_PREFIXES: &[&str] = &["/api", "/schema", "/docs"];

/// Registered routes as reported by the host router
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteSnapshot {
    pub paths: Vec<String>,
    pub docs_path: Option<String>,
}

impl RouteSnapshot {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            docs_path: None,
        }
    }

    /// Set the documentation path (builder pattern)
    pub fn with_docs_path(mut self, path: impl Into<String>) -> Self {
        self.docs_path = Some(path.into());
        self
    }
}

/// Anything that can describe its registered routes
pub trait RouteSource: Send + Sync {
    fn route_snapshot(&self) -> RouteSnapshot;
}

impl RouteSource for RouteSnapshot {
    fn route_snapshot(&self) -> RouteSnapshot {
        self.clone()
    }
}

/// Prefixes sorted longest first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixSet {
    prefixes: Vec<String>,
}

impl PrefixSet {
    pub fn build(snapshot: &RouteSnapshot) -> Self {
        let mut prefixes: Vec<String> = snapshot
            .paths
            .iter()
            .map(|p| static_prefix(p))
            .chain(snapshot.docs_path.as_deref().map(static_prefix))
            .chain(CONVENTIONAL_PREFIXES.iter().map(|p| p.to_string()))
            .collect();

        prefixes.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        prefixes.dedup();
        Self { prefixes }
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    /// `path == prefix` or `path` starts with `prefix/`
    pub fn matches(&self, path: &str) -> bool {
        self.prefixes.iter().any(|prefix| {
            path == prefix
                || (path.len() > prefix.len()
                    && path.starts_with(prefix.as_str())
                    && path.as_bytes()[prefix.len()] == b'/')
        })
    }
}

/// Static part of a route pattern: `/users/{id}` and `/users/:id` become `/users`
fn static_prefix(path: &str) -> String {
    let mut prefix = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if segment.contains('{') || segment.starts_with(':') || segment.contains('*') {
            break;
        }
        prefix.push('/');
        prefix.push_str(segment);
    }
    if prefix.is_empty() {
        prefix.push('/');
    }
    prefix
}

/// Lazily built, cached prefix set for one application instance
pub struct RoutePrefixIndex {
    source: Arc<dyn RouteSource>,
    prefixes: OnceLock<PrefixSet>,
}

impl RoutePrefixIndex {
    pub fn new(source: Arc<dyn RouteSource>) -> Self {
        Self {
            source,
            prefixes: OnceLock::new(),
        }
    }

    pub fn prefixes(&self) -> &PrefixSet {
        self.prefixes.get_or_init(|| {
            let set = PrefixSet::build(&self.source.route_snapshot());
            debug!(prefixes = ?set.prefixes(), "Built application route prefix index");
            set
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.prefixes().matches(path)
    }
}

impl std::fmt::Debug for RoutePrefixIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutePrefixIndex")
            .field("prefixes", &self.prefixes.get())
            .finish()
    }
}
