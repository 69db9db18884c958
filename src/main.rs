use devgate::config::Config;
use devgate::monitor::IdleReaper;
use devgate::proxy::ProxyServer;
use devgate::registry::Registry;
use devgate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Loaded from the working directory when no path is given
const DEFAULT_CONFIG_FILE: &str = "devgate.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("devgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config = load_config().map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reaper = IdleReaper::new(config.monitor.clone());
    let registry = Registry::new(config.apps.clone(), reaper.clone());

    let reaper_handle = tokio::spawn(Arc::clone(&reaper).run(shutdown_rx.clone()));

    let proxy_handle = if config.server.port > 0 {
        let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
        let proxy = ProxyServer::new(addr, Arc::clone(&registry), shutdown_rx.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = proxy.run().await {
                error!(error = %e, "Proxy server error");
            }
        }))
    } else {
        info!("HTTP listener disabled (port = 0)");
        None
    };

    wait_for_shutdown_signal().await?;

    let _ = shutdown_tx.send(true);

    info!("Stopping all applications...");
    registry.shutdown().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if let Some(handle) = proxy_handle {
            let _ = handle.await;
        }
        let _ = reaper_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn load_config() -> anyhow::Result<Config> {
    match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => {
            let config = Config::load(&path)?;
            info!(path = %path.display(), "Configuration loaded");
            Ok(config)
        }
        None if std::path::Path::new(DEFAULT_CONFIG_FILE).exists() => {
            let config = Config::load(DEFAULT_CONFIG_FILE)?;
            info!(path = DEFAULT_CONFIG_FILE, "Configuration loaded");
            Ok(config)
        }
        None => {
            info!("No configuration file, using defaults");
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received SIGINT (Ctrl+C), shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        bind = %config.server.bind,
        port = if config.server.port > 0 { Some(config.server.port) } else { None },
        "Server configuration"
    );
    info!(
        host_root = %config.apps.host_root.display(),
        socket_root = %config.apps.socket_root().display(),
        log_root = %config.apps.log_root().display(),
        launcher = %config.apps.launcher.display(),
        default_app = %config.apps.default_app,
        "Application settings"
    );
    info!(
        startup_timeout_secs = config.apps.startup_timeout_secs,
        poll_interval_ms = config.apps.poll_interval_ms,
        "Worker startup settings"
    );
    info!(
        idle_timeout_secs = config.monitor.idle_timeout_secs,
        reap_interval_secs = config.monitor.reap_interval_secs,
        "Idle monitor settings"
    );
}
