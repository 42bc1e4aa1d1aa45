//! Filesystem rendezvous between the frontend tool and the gateway
//!
//! The frontend tool writes its base URL (`scheme://host:port`) into a "hot file"
//! once it is listening. The gateway reads that file lazily and caches the first
//! successful read for the rest of the process lifetime. A sibling `<path>.hmr`
//! record carries the HMR endpoint for tools that run it on a separate port.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Suffix of the HMR record next to the primary hot file
pub const HMR_SUFFIX: &str = ".hmr";

/// Error parsing a rendezvous URL
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TargetParseError {
    #[error("missing scheme in '{0}'")]
    MissingScheme(String),
    #[error("unsupported scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("missing host in '{0}'")]
    MissingHost(String),
    #[error("invalid port in '{0}'")]
    InvalidPort(String),
}

/// Resolved upstream endpoint for a proxied request or connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Target {
    /// Parse `scheme://host[:port][/]`. One trailing slash is tolerated;
    /// any path beyond it is ignored.
    pub fn parse(input: &str) -> Result<Self, TargetParseError> {
        let trimmed = input.trim();
        let (scheme, rest) = trimmed
            .split_once("://")
            .ok_or_else(|| TargetParseError::MissingScheme(trimmed.to_string()))?;

        let scheme = scheme.to_ascii_lowercase();
        let default_port = match scheme.as_str() {
            "http" | "ws" => 80,
            "https" | "wss" => 443,
            _ => return Err(TargetParseError::UnsupportedScheme(scheme)),
        };

        let authority = rest.split('/').next().unwrap_or_default();
        if authority.is_empty() {
            return Err(TargetParseError::MissingHost(trimmed.to_string()));
        }

        let (host, port) = if let Some(v6) = authority.strip_prefix('[') {
            // [::1]:5173
            let (host, after) = v6
                .split_once(']')
                .ok_or_else(|| TargetParseError::MissingHost(trimmed.to_string()))?;
            let port = match after.strip_prefix(':') {
                Some(p) => p
                    .parse()
                    .map_err(|_| TargetParseError::InvalidPort(trimmed.to_string()))?,
                None if after.is_empty() => default_port,
                None => return Err(TargetParseError::InvalidPort(trimmed.to_string())),
            };
            (host.to_string(), port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (
                    host.to_string(),
                    port.parse()
                        .map_err(|_| TargetParseError::InvalidPort(trimmed.to_string()))?,
                ),
                None => (authority.to_string(), default_port),
            }
        };

        if host.is_empty() {
            return Err(TargetParseError::MissingHost(trimmed.to_string()));
        }

        Ok(Self { scheme, host, port })
    }

    /// `host:port`, with IPv6 hosts bracketed
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Base URL without trailing slash
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.authority())
    }

    /// Full HTTP URL for a path-and-query
    pub fn http_url(&self, path_and_query: &str) -> String {
        let scheme = match self.scheme.as_str() {
            "ws" => "http",
            "wss" => "https",
            other => other,
        };
        format!("{}://{}{}", scheme, self.authority(), path_and_query)
    }

    /// WebSocket URL for a path-and-query
    pub fn ws_url(&self, path_and_query: &str) -> String {
        let scheme = match self.scheme.as_str() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        format!("{}://{}{}", scheme, self.authority(), path_and_query)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base_url())
    }
}

/// One rendezvous record on disk, with a permanent read cache.
///
/// Only successful reads are cached. A missing file means the tool has not
/// published its address yet and is re-checked on the next call.
#[derive(Debug)]
pub struct HotFile {
    path: PathBuf,
    cached: OnceLock<Target>,
}

impl HotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: OnceLock::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve the published address, reading the file at most once successfully
    pub fn read(&self) -> Option<Target> {
        if let Some(target) = self.cached.get() {
            return Some(target.clone());
        }

        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read hot file");
                return None;
            }
        };

        let line = content.lines().next().unwrap_or_default().trim();
        if line.is_empty() {
            // Tool created the file but has not finished writing it
            return None;
        }

        match Target::parse(line) {
            Ok(target) => {
                debug!(path = %self.path.display(), %target, "Resolved upstream from hot file");
                // A racing reader may have set the same value first
                let _ = self.cached.set(target);
                self.cached.get().cloned()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring malformed hot file");
                None
            }
        }
    }

    /// Publish an address, creating parent directories and replacing the contents
    pub fn write(&self, url: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, url.trim_end_matches('/'))
    }

    /// Remove the record if present
    pub fn clear(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// `<path>.hmr`
pub fn hmr_path(primary: &Path) -> PathBuf {
    let mut name: OsString = primary.as_os_str().to_owned();
    name.push(HMR_SUFFIX);
    PathBuf::from(name)
}

/// The primary record plus its HMR sibling
#[derive(Debug)]
pub struct Rendezvous {
    primary: HotFile,
    hmr: HotFile,
}

impl Rendezvous {
    pub fn new(primary: impl Into<PathBuf>) -> Self {
        let primary = primary.into();
        let hmr = hmr_path(&primary);
        Self {
            primary: HotFile::new(primary),
            hmr: HotFile::new(hmr),
        }
    }

    pub fn primary(&self) -> &HotFile {
        &self.primary
    }

    pub fn hmr(&self) -> &HotFile {
        &self.hmr
    }

    /// Main dev server address
    pub fn resolve(&self) -> Option<Target> {
        self.primary.read()
    }

    /// HMR address, falling back to the main record
    pub fn resolve_hmr(&self) -> Option<Target> {
        self.hmr.read().or_else(|| self.primary.read())
    }

    /// Remove both records, e.g. before launching a fresh tool
    pub fn clear(&self) -> io::Result<()> {
        self.primary.clear()?;
        self.hmr.clear()
    }
}
