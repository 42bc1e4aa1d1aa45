//! Trusted `X-Forwarded-*` handling
//!
//! Headers are only honored when the direct caller is a trusted proxy. The
//! real client is the first untrusted hop reading `X-Forwarded-For` from the
//! right, which unwinds chains of several trusted proxies.

use hyper::header::{HeaderMap, HeaderValue, HOST};
use hyper::Request;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use tracing::debug;

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// An IPv4 or IPv6 CIDR block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNetwork {
    addr: IpAddr,
    prefix: u8,
}

impl IpNetwork {
    /// Parse `addr/prefix`
    pub fn parse(input: &str) -> Option<Self> {
        let (addr, prefix) = input.trim().split_once('/')?;
        let addr: IpAddr = addr.parse().ok()?;
        let prefix: u8 = prefix.parse().ok()?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return None;
        }
        Some(Self { addr, prefix })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - self.prefix as u32).unwrap_or(0);
                u32::from(net) & mask == u32::from(*ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - self.prefix as u32).unwrap_or(0);
                u128::from(net) & mask == u128::from(*ip) & mask
            }
            // IPv4-mapped IPv6 callers against IPv4 networks
            (IpAddr::V4(_), IpAddr::V6(v6)) => v6
                .to_ipv4_mapped()
                .map(|v4| self.contains(&IpAddr::V4(v4)))
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// Callers whose forwarding headers are believed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustedHosts {
    /// `"*"`: trust every caller
    Any,
    Set {
        addrs: HashSet<IpAddr>,
        networks: Vec<IpNetwork>,
        /// Non-IP identities such as Unix socket paths
        literals: HashSet<String>,
    },
}

impl TrustedHosts {
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut addrs = HashSet::new();
        let mut networks = Vec::new();
        let mut literals = HashSet::new();

        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            if entry == "*" {
                return TrustedHosts::Any;
            }
            if let Some(ip) = parse_ip(entry) {
                addrs.insert(ip);
            } else if let Some(network) = IpNetwork::parse(entry) {
                networks.push(network);
            } else {
                literals.insert(entry.to_string());
            }
        }

        TrustedHosts::Set {
            addrs,
            networks,
            literals,
        }
    }

    /// Check a caller identity (IP, `ip:port`, or opaque literal)
    pub fn contains(&self, host: &str) -> bool {
        match self {
            TrustedHosts::Any => true,
            TrustedHosts::Set {
                addrs,
                networks,
                literals,
            } => {
                let host = host.trim();
                if let Some(ip) = parse_ip(host) {
                    let ip = canonical_ip(ip);
                    addrs.iter().any(|a| canonical_ip(*a) == ip)
                        || networks.iter().any(|n| n.contains(&ip))
                } else {
                    literals.contains(host)
                }
            }
        }
    }
}

/// Accept bare IPs, bracketed IPv6, and `ip:port` forms
fn parse_ip(input: &str) -> Option<IpAddr> {
    let input = input.trim();
    if let Ok(ip) = input.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Ok(sock) = input.parse::<SocketAddr>() {
        return Some(sock.ip());
    }
    input
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .and_then(|s| s.parse().ok())
}

fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

/// Whether the request is a plain HTTP exchange or a WebSocket handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Http,
    WebSocket,
}

/// Scheme and client address the rest of the pipeline should see.
/// Stored as a request extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub scheme: String,
    pub client: String,
    /// Original `Host` before any rewrite
    pub original_host: Option<String>,
}

/// Outcome of evaluating forwarding headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub scheme: String,
    pub client: String,
    pub host: Option<HeaderValue>,
}

/// Rewrites scheme, client and host from trusted forwarding headers
#[derive(Debug, Clone)]
pub struct ForwardedHeaders {
    trusted: TrustedHosts,
    honor_host: bool,
}

impl ForwardedHeaders {
    pub fn new(trusted: TrustedHosts, honor_host: bool) -> Self {
        Self { trusted, honor_host }
    }

    pub fn trusted(&self) -> &TrustedHosts {
        &self.trusted
    }

    /// Evaluate headers for one request. Pure: nothing is mutated.
    pub fn resolve(&self, kind: ScopeKind, peer: &str, scheme: &str, headers: &HeaderMap) -> Resolved {
        let untouched = Resolved {
            scheme: scheme.to_string(),
            client: peer.to_string(),
            host: None,
        };

        if !self.trusted.contains(peer) {
            return untouched;
        }

        let mut resolved = untouched;

        if let Some(proto) = first_header(headers, X_FORWARDED_PROTO) {
            match normalize_proto(kind, proto) {
                Some(proto) => resolved.scheme = proto.to_string(),
                None => debug!(proto, "Ignoring invalid X-Forwarded-Proto"),
            }
        }

        if let Some(chain) = first_header(headers, X_FORWARDED_FOR) {
            if let Some(client) = self.client_from_chain(chain) {
                resolved.client = client;
            }
        }

        if self.honor_host {
            resolved.host = headers
                .get(X_FORWARDED_HOST)
                .filter(|v| !v.is_empty())
                .cloned();
        }

        resolved
    }

    /// First untrusted hop from the right, else the leftmost entry
    fn client_from_chain(&self, chain: &str) -> Option<String> {
        let hops: Vec<&str> = chain.split(',').map(str::trim).filter(|h| !h.is_empty()).collect();
        hops.iter()
            .rev()
            .find(|hop| !self.trusted.contains(hop))
            .or_else(|| hops.first())
            .map(|hop| hop.to_string())
    }

    /// Apply to a request: rewrites `Host` when honored and attaches
    /// [`ConnectionInfo`] as an extension.
    pub fn apply<B>(&self, req: &mut Request<B>, peer: SocketAddr, scheme: &str, kind: ScopeKind) -> ConnectionInfo {
        let peer_ip = canonical_ip(peer.ip()).to_string();
        let original_host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let resolved = self.resolve(kind, &peer_ip, scheme, req.headers());

        if let Some(host) = resolved.host {
            let headers = req.headers_mut();
            match headers.get_mut(HOST) {
                Some(existing) => *existing = host,
                None => {
                    headers.insert(HOST, host);
                }
            }
        }

        let info = ConnectionInfo {
            scheme: resolved.scheme,
            client: resolved.client,
            original_host,
        };
        req.extensions_mut().insert(info.clone());
        info
    }
}

fn first_header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn normalize_proto(kind: ScopeKind, value: &str) -> Option<&'static str> {
    let value = value.trim().to_ascii_lowercase();
    match (kind, value.as_str()) {
        (ScopeKind::Http, "http" | "ws") => Some("http"),
        (ScopeKind::Http, "https" | "wss") => Some("https"),
        (ScopeKind::WebSocket, "http" | "ws") => Some("ws"),
        (ScopeKind::WebSocket, "https" | "wss") => Some("wss"),
        _ => None,
    }
}
