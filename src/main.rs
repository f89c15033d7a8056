//! cmdlink - Binary command protocol server
//!
//! Serves the built-in echo commands over TCP.

use cmdlink_net::metrics::{run_metrics_server, Metrics};
use cmdlink_net::{echo, Config, NetService, RuntimeExecutor, ServiceConfig};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if CMDLINK_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("CMDLINK_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.network.selectors)
        .thread_name("cmdlink-io")
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("Starting cmdlink server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  I/O threads: {}", config.network.selectors);
    tracing::info!(
        "  Request timeout: {}ms (sweep every {}ms)",
        config.engine.request_timeout_ms,
        config.engine.request_timeout_detect_interval_ms
    );
    tracing::info!(
        "  Idle timeouts: read={}ms write={}ms",
        config.engine.channel_read_timeout_ms,
        config.engine.channel_write_timeout_ms
    );

    let blocking = Arc::new(RuntimeExecutor::new(tokio::runtime::Handle::current()));
    let mut builder = NetService::builder(ServiceConfig::from(&config))
        .commands(echo::commands())
        .handlers(echo::handlers(blocking));

    let (metrics_shutdown_tx, _) = broadcast::channel(1);
    let metrics_handle = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        builder = builder.metrics(metrics.clone());

        let addr = config.metrics.bind_addr;
        let shutdown = metrics_shutdown_tx.subscribe();
        tracing::info!("  Metrics: enabled on {}", addr);
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown).await {
                tracing::error!("Metrics server error: {}", e);
            }
        }))
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let service = builder.build();
    service.start()?;
    let addr = service.bind(config.network.bind_addr).await?;
    tracing::info!("Server listening on {}", addr);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping server...");

    service.shutdown();
    let _ = metrics_shutdown_tx.send(());
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    tracing::info!("Server stopped");
    Ok(())
}
