use stackgate::api::ApiContext;
use stackgate::auth::{AuthProvider, InMemoryAuthProvider};
use stackgate::config::Config;
use stackgate::orchestrator::StackOrchestrator;
use stackgate::pool::{ConnectionPool, PoolConfig};
use stackgate::proxy::{ProxyContext, ProxyServer};
use stackgate::stack_config::StackConfigProvider;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Version information
const VERSION: &str = env!("CARGO_PKG_VERSION");
const PKG_NAME: &str = env!("CARGO_PKG_NAME");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("stackgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration; a missing file falls back to defaults so a local
    // test profile runs with zero setup.
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if config_path.exists() {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    } else {
        warn!(path = %config_path.display(), "No configuration file, using defaults");
        Config::default()
    };

    print_startup_banner(&config);

    // Stack configs are read once; the definitions directory must exist.
    let stacks_dir = config.stacks.dir.clone();
    let stack_configs = Arc::new(StackConfigProvider::load(&stacks_dir)?);

    // Runtime and download tracker variants are fixed here, once, and never
    // switched afterwards.
    let orchestrator = if config.stacks.use_mocks {
        warn!("Mocked container runtime and download tracker are in use, nothing will really be deployed");
        Arc::new(StackOrchestrator::simulated(
            Arc::clone(&stack_configs),
            stacks_dir.clone(),
        ))
    } else {
        Arc::new(StackOrchestrator::real(
            Arc::clone(&stack_configs),
            stacks_dir.clone(),
        ))
    };

    let auth: Arc<dyn AuthProvider> = Arc::new(InMemoryAuthProvider::new(
        &config.auth.admin_user,
        &config.auth.admin_password,
    ));
    if config.auth.admin_password.is_empty() {
        warn!("auth.admin_password is empty, login is disabled");
    }

    let api = Arc::new(ApiContext {
        orchestrator: Arc::clone(&orchestrator),
        auth: Arc::clone(&auth),
        cookie_name: config.auth.cookie_name.clone(),
        wipe_endpoint_enabled: config.stacks.enable_wipe_endpoint,
    });

    let context = Arc::new(ProxyContext {
        api,
        auth,
        configs: stack_configs,
        control_hosts: config.server.control_hosts(),
        root_domain: config.server.root_domain.clone(),
        cookie_name: config.auth.cookie_name.clone(),
        pool: ConnectionPool::new(PoolConfig::default()),
    });

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let proxy = ProxyServer::new(bind_addr, context, shutdown_rx);
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

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
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown; deployed stacks keep running on their own.
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), proxy_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting server");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        root_domain = %config.server.root_domain,
        control_hosts = ?config.server.control_hosts(),
        "Server configuration"
    );
    info!(
        stacks_dir = %config.stacks.dir.display(),
        use_mocks = config.stacks.use_mocks,
        wipe_endpoint = config.stacks.enable_wipe_endpoint,
        "Stack management configuration"
    );
    if config.stacks.enable_wipe_endpoint {
        warn!("The data-wipe endpoint is open, do not use this setup in production");
    }
}
