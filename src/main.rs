use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use vitegate::app::{Application, BackendApp};
use vitegate::config::Config;
use vitegate::hotfile::Rendezvous;
use vitegate::server::{upstream_from_config, DevServer, Gateway};
use vitegate::supervisor::{self, ProcessSpec, Supervisor};

/// Environment variable carrying the primary rendezvous file path
const ENV_HOT_FILE: &str = "VITEGATE_HOT_FILE";
/// Environment variable carrying the asset URL prefix
const ENV_ASSET_URL: &str = "VITEGATE_ASSET_URL";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vitegate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("vitegate.toml"));

    let config = if config_path.exists() {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    } else {
        warn!(path = %config_path.display(), "Configuration file not found, using defaults");
        Config::default()
    };

    print_startup_banner(&config);

    // From here on every supervised group is killed if we bail out early
    let lifecycle = supervisor::init();

    let hot_file = absolute(&config.frontend.hot_file_path())?;
    let rendezvous = Arc::new(Rendezvous::new(&hot_file));
    rendezvous.clear()?;

    let _frontend = if let Some(argv) = config.frontend.argv()? {
        let mut spec = ProcessSpec::new(argv)
            .with_env(ENV_HOT_FILE, hot_file.display().to_string())
            .with_env(ENV_ASSET_URL, config.proxy.asset_url.clone());
        if let Some(ref dir) = config.frontend.working_dir {
            spec = spec.with_working_dir(dir);
        }
        for (key, value) in &config.frontend.env {
            spec = spec.with_env(key, value);
        }

        let frontend = Supervisor::new(
            "frontend",
            config.frontend.startup_probe(),
            config.frontend.shutdown_timeout(),
        );
        // A broken dev server command makes the session useless
        let pid = frontend.start(&spec).await.map_err(|e| {
            error!(error = %e, "Failed to start frontend dev server");
            e
        })?;
        info!(pid, command = ?spec.argv, hot_file = %hot_file.display(), "Frontend dev server started");
        Some(frontend)
    } else {
        info!(hot_file = %hot_file.display(), "No frontend command configured, waiting for an external dev server");
        None
    };

    let backend_upstream = upstream_from_config(&config);
    let backend_stats = backend_upstream.stats();
    let app: Arc<dyn Application> = Arc::new(BackendApp::from_config(&config, backend_upstream)?);
    let gateway = Arc::new(Gateway::from_config(&config, app, rendezvous)?);
    let frontend_stats = gateway.proxy().upstream().stats();

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = DevServer::bind(addr, gateway, shutdown_rx).await?;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Dev server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Stop the frontend process group
    lifecycle.shutdown().await;

    // Wait for the server to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!(
        frontend_requests = frontend_stats.get_total_requests(),
        frontend_failures = frontend_stats.get_failed_requests(),
        backend_requests = backend_stats.get_total_requests(),
        backend_failures = backend_stats.get_failed_requests(),
        "Upstream request totals"
    );
    info!("Shutdown complete");
    Ok(())
}

fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn print_startup_banner(config: &Config) {
    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting dev gateway"
    );
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        use_pool = config.server.use_pool,
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Server configuration"
    );
    info!(
        mode = ?config.frontend.mode,
        command = ?config.frontend.command,
        hot_file = %config.frontend.hot_file,
        target = ?config.frontend.target,
        "Frontend settings"
    );
    info!(
        asset_url = %config.proxy.asset_url,
        resource_dir = ?config.proxy.resource_dir,
        request_timeout_secs = config.proxy.request_timeout_secs,
        render_timeout_secs = config.proxy.render_timeout_secs,
        ws_open_timeout_secs = config.proxy.ws_open_timeout_secs,
        "Proxy settings"
    );
    info!(
        enabled = config.forwarded.enabled,
        trusted_hosts = ?config.forwarded.trusted_hosts.entries(),
        "Forwarded headers"
    );
}
