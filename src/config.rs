use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::hotfile::Target;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and upstream client settings
    #[serde(default)]
    pub server: ServerConfig,

    /// The supervised frontend tool
    #[serde(default)]
    pub frontend: FrontendConfig,

    /// Asset proxy prefixes and timeouts
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// X-Forwarded-* handling
    #[serde(default)]
    pub forwarded: ForwardedConfig,

    /// Snapshot of the host application's router
    #[serde(default)]
    pub app: AppConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port (default: 8000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Maximum idle upstream connections per host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle upstream connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Share one pooled client across requests (default: true).
    /// When false every proxied request opens its own connection.
    #[serde(default = "default_true")]
    pub use_pool: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            use_pool: true,
        }
    }
}

/// Which proxy policy the gateway runs
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FrontendMode {
    /// Tool serves assets and HMR only; forward known prefixes (allow-list)
    #[default]
    Spa,
    /// Tool renders full pages; forward everything the app does not own (deny-list)
    Ssr,
}

/// Configuration for the supervised frontend tool
///
/// # Security Warning
///
/// `command` is executed directly with the permissions of the gateway process.
/// Configuration files must come from a trusted source.
#[derive(Debug, Deserialize, Clone)]
pub struct FrontendConfig {
    /// Command line to start the tool, split with shell rules (e.g. "npm run dev")
    pub command: Option<String>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Extra environment variables for the command
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Path of the rendezvous file the tool writes its address into
    #[serde(default = "default_hot_file")]
    pub hot_file: String,

    /// Proxy policy selection
    #[serde(default)]
    pub mode: FrontendMode,

    /// Fixed upstream for ssr mode; when unset the hot file is used
    pub target: Option<String>,

    /// Seconds to wait after SIGTERM before SIGKILL (default: 5)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Window in milliseconds during which an exit counts as a failed start (default: 250)
    #[serde(default = "default_startup_probe")]
    pub startup_probe_ms: u64,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            command: None,
            working_dir: None,
            env: HashMap::new(),
            hot_file: default_hot_file(),
            mode: FrontendMode::default(),
            target: None,
            shutdown_timeout_secs: default_shutdown_timeout(),
            startup_probe_ms: default_startup_probe(),
        }
    }
}

impl FrontendConfig {
    /// Split the command line into argv
    pub fn argv(&self) -> anyhow::Result<Option<Vec<String>>> {
        let Some(ref command) = self.command else {
            return Ok(None);
        };
        let argv = shell_words::split(command)
            .map_err(|e| anyhow::anyhow!("Invalid frontend command '{}': {}", command, e))?;
        if argv.is_empty() {
            anyhow::bail!("Frontend command is empty");
        }
        Ok(Some(argv))
    }

    pub fn hot_file_path(&self) -> PathBuf {
        PathBuf::from(&self.hot_file)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn startup_probe(&self) -> Duration {
        Duration::from_millis(self.startup_probe_ms)
    }

    /// Parse the fixed ssr target, if any
    pub fn fixed_target(&self) -> anyhow::Result<Option<Target>> {
        self.target
            .as_deref()
            .map(|t| Target::parse(t).map_err(anyhow::Error::from))
            .transpose()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// URL prefix the frontend tool serves built assets under (default: /static/)
    #[serde(default = "default_asset_url")]
    pub asset_url: String,

    /// Source resource directory the tool serves directly (e.g. "resources")
    pub resource_dir: Option<String>,

    /// Additional prefixes to forward in spa mode
    #[serde(default)]
    pub allow_prefixes: Vec<String>,

    /// Timeout for proxied asset requests in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout for proxied page renders in ssr mode in seconds (default: 60)
    #[serde(default = "default_render_timeout")]
    pub render_timeout_secs: u64,

    /// Timeout for opening the upstream HMR WebSocket in seconds (default: 10)
    #[serde(default = "default_ws_open_timeout")]
    pub ws_open_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            asset_url: default_asset_url(),
            resource_dir: None,
            allow_prefixes: Vec::new(),
            request_timeout_secs: default_request_timeout(),
            render_timeout_secs: default_render_timeout(),
            ws_open_timeout_secs: default_ws_open_timeout(),
        }
    }
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs)
    }

    pub fn ws_open_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_open_timeout_secs)
    }
}

/// Trusted proxy list as written in TOML: `"*"`, `"10.0.0.1"`,
/// `"10.0.0.1, 10.1.0.0/16"` or `["10.0.0.1", "fd00::/8"]`
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum TrustedHostsSetting {
    List(Vec<String>),
    Single(String),
}

impl TrustedHostsSetting {
    /// Flatten into individual trimmed entries
    pub fn entries(&self) -> Vec<String> {
        match self {
            TrustedHostsSetting::List(items) => items
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            TrustedHostsSetting::Single(value) => value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}

impl Default for TrustedHostsSetting {
    fn default() -> Self {
        TrustedHostsSetting::Single("127.0.0.1".to_string())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ForwardedConfig {
    /// Honor X-Forwarded-* from trusted callers (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Callers whose forwarded headers are believed
    #[serde(default)]
    pub trusted_hosts: TrustedHostsSetting,

    /// Rewrite Host from X-Forwarded-Host (default: true)
    #[serde(default = "default_true")]
    pub honor_host: bool,
}

impl Default for ForwardedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trusted_hosts: TrustedHostsSetting::default(),
            honor_host: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    /// Route paths registered by the host application
    #[serde(default)]
    pub routes: Vec<String>,

    /// API documentation path, if the application serves one
    pub docs_path: Option<String>,

    /// Upstream that receives requests the proxy does not take
    pub backend_url: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    8000
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_hot_file() -> String {
    "public/hot".to_string()
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_startup_probe() -> u64 {
    250
}

fn default_asset_url() -> String {
    "/static/".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_render_timeout() -> u64 {
    60 // page renders are slower than asset fetches
}

fn default_ws_open_timeout() -> u64 {
    10
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.frontend.argv() {
            errors.push(e.to_string());
        }

        if self.frontend.hot_file.trim().is_empty() {
            errors.push("frontend.hot_file must not be empty".to_string());
        }

        if let Err(e) = self.frontend.fixed_target() {
            errors.push(format!("frontend.target: {}", e));
        }

        if self.frontend.target.is_some() && self.frontend.mode != FrontendMode::Ssr {
            errors.push("frontend.target is only used in ssr mode".to_string());
        }

        if let Some(ref url) = self.app.backend_url {
            if let Err(e) = Target::parse(url) {
                errors.push(format!("app.backend_url: {}", e));
            }
        }

        for route in &self.app.routes {
            if !route.starts_with('/') {
                errors.push(format!("app.routes entry '{}' must start with '/'", route));
            }
        }

        if self.proxy.ws_open_timeout_secs == 0 {
            errors.push("proxy.ws_open_timeout_secs must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
bind = "0.0.0.0"

[frontend]
command = "npm run dev -- --host 127.0.0.1"
working_dir = "web"
hot_file = "web/public/hot"

[frontend.env]
NODE_ENV = "development"

[proxy]
asset_url = "/assets"
resource_dir = "resources"

[forwarded]
enabled = true
trusted_hosts = "10.0.0.0/8, 127.0.0.1"

[app]
routes = ["/api/users", "/login"]
docs_path = "/schema"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.frontend.mode, FrontendMode::Spa);
        assert_eq!(
            config.frontend.argv().unwrap().unwrap(),
            vec!["npm", "run", "dev", "--", "--host", "127.0.0.1"]
        );
        assert_eq!(config.frontend.env.get("NODE_ENV").unwrap(), "development");
        assert_eq!(config.proxy.resource_dir.as_deref(), Some("resources"));
        assert_eq!(
            config.forwarded.trusted_hosts.entries(),
            vec!["10.0.0.0/8", "127.0.0.1"]
        );
        assert_eq!(config.app.routes.len(), 2);
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 8000);
        assert!(config.server.use_pool);
        assert_eq!(config.frontend.hot_file, "public/hot");
        assert_eq!(config.frontend.shutdown_timeout(), Duration::from_secs(5));
        assert_eq!(config.proxy.asset_url, "/static/");
        assert_eq!(config.proxy.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.proxy.render_timeout(), Duration::from_secs(60));
        assert_eq!(config.proxy.ws_open_timeout(), Duration::from_secs(10));
        assert!(!config.forwarded.enabled);
        assert!(config.forwarded.honor_host);
        assert!(config.frontend.argv().unwrap().is_none());
    }

    #[test]
    fn test_trusted_hosts_forms() {
        let wildcard: ForwardedConfig = toml::from_str(r#"trusted_hosts = "*""#).unwrap();
        assert_eq!(wildcard.trusted_hosts.entries(), vec!["*"]);

        let list: ForwardedConfig =
            toml::from_str(r#"trusted_hosts = ["192.168.1.1", " fd00::/8 "]"#).unwrap();
        assert_eq!(list.trusted_hosts.entries(), vec!["192.168.1.1", "fd00::/8"]);

        let defaulted: ForwardedConfig = toml::from_str("").unwrap();
        assert_eq!(defaulted.trusted_hosts.entries(), vec!["127.0.0.1"]);
    }

    #[test]
    fn test_ssr_fixed_target() {
        let config: Config = toml::from_str(
            r#"
[frontend]
mode = "ssr"
target = "http://127.0.0.1:3000/"
"#,
        )
        .unwrap();
        config.validate().unwrap();
        let target = config.frontend.fixed_target().unwrap().unwrap();
        assert_eq!(target.authority(), "127.0.0.1:3000");
    }

    #[test]
    fn test_validation_collects_errors() {
        let config: Config = toml::from_str(
            r#"
[frontend]
command = "npm 'unterminated"
target = "not a url"

[app]
routes = ["api"]
backend_url = "ftp://example.com"
"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("Invalid frontend command"));
        assert!(err.contains("frontend.target"));
        assert!(err.contains("only used in ssr mode"));
        assert!(err.contains("must start with '/'"));
        assert!(err.contains("app.backend_url"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vitegate.toml");
        std::fs::write(&path, "[server]\nport = 9100\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 9100);

        assert!(Config::load(dir.path().join("missing.toml")).is_err());
    }
}
