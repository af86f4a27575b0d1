use burrow::config::Config;
use burrow::control::{ControlServer, PKG_NAME, VERSION};
use burrow::lockfile::{install_panic_hook, LockFile};
use burrow::proxy::ProxyServer;
use burrow::supervisor::Supervisor;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("burrow=debug".parse().expect("valid log directive")),
        )
        .init();

    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let (config, source) = Config::load_or_default(explicit_path.as_deref()).map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    match source {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => info!("No configuration file, using defaults"),
    }
    print_startup_banner(&config);

    // Must happen before any listener binds
    let lock = Arc::new(LockFile::acquire(&config.server.lock_file)?);
    install_panic_hook(Arc::clone(&lock));

    let result = run(config).await;
    lock.release();
    result
}

async fn run(config: Config) -> anyhow::Result<()> {
    let proxy_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.proxy_port).parse()?;
    let control_addr: SocketAddr =
        format!("{}:{}", config.server.control_bind, config.server.control_port).parse()?;
    let stop_apps_on_exit = config.server.stop_apps_on_exit;

    let supervisor = Supervisor::new(config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let proxy = ProxyServer::bind(proxy_addr, Arc::clone(&supervisor), shutdown_rx.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind proxy on {}: {}", proxy_addr, e))?;
    let control = ControlServer::bind(control_addr, Arc::clone(&supervisor), shutdown_rx.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind control API on {}: {}", control_addr, e))?;

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });
    let control_handle = tokio::spawn(async move {
        if let Err(e) = control.run().await {
            error!(error = %e, "Control server error");
        }
    });

    tokio::spawn(Arc::clone(&supervisor).watch_exits(shutdown_rx.clone()));

    let restorer = Arc::clone(&supervisor);
    tokio::spawn(async move {
        let restored = restorer.restore().await;
        info!(restored, "Restore complete");
    });

    wait_for_shutdown_signal().await?;

    let _ = shutdown_tx.send(true);

    if stop_apps_on_exit {
        info!("Stopping all apps...");
        supervisor.stop_all().await;
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        let _ = control_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
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
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting app supervisor");
    info!(
        bind = %config.server.bind,
        proxy_port = config.server.proxy_port,
        control = %format!("{}:{}", config.server.control_bind, config.server.control_port),
        domain = %config.server.local_domain,
        "Server configuration"
    );
    info!(
        state_dir = %config.server.state_dir.display(),
        lock_file = %config.server.lock_file.display(),
        "State locations"
    );
    info!(
        base_port = config.apps.base_port,
        launch_attempts = config.apps.launch_attempts,
        launch_interval_ms = config.apps.launch_interval_ms,
        shutdown_grace_period_ms = config.apps.shutdown_grace_period_ms,
        "App defaults"
    );
}
