//! On-demand test proxy server.
//!
//! # Usage
//!
//! ```bash
//! ondemand-proxy --config ~/.nem/config --server voltha-rw-core.voltha:50057
//! ```

use anyhow::Context;
use clap::Parser;
use ondemand_proxy::{Cli, OnDemandService, ProxyConfig, RequestHandler, VolthaActionClient, server};
use ondemand_proxy_core::{ActionClient, EventBus};
use ondemand_proxy_redpanda::RedpandaEventBus;
use ondemand_proxy_runtime::CorrelationBridge;
use ondemand_proxy_runtime::metrics::MetricsServer;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "debug"
    } else {
        "info,ondemand_proxy=debug"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting ondemand-proxy");

    let config = ProxyConfig::load(&cli).context("Failed to load configuration")?;
    config.log_summary();

    if let Some(addr) = config.metrics_listen {
        let mut metrics = MetricsServer::new(addr);
        metrics.start().context("Failed to start metrics server")?;
    }

    let bus: Arc<dyn EventBus> = Arc::new(
        RedpandaEventBus::builder()
            .brokers(config.kafka.clone())
            .build()
            .context("Failed to create event bus client")?,
    );
    let bridge = Arc::new(
        CorrelationBridge::start(bus, config.bridge_config())
            .await
            .context("Failed to subscribe to device events")?,
    );

    let backend: Arc<dyn ActionClient> =
        Arc::new(VolthaActionClient::new(&config).context("Failed to configure backend client")?);
    let handler = Arc::new(RequestHandler::new(
        Arc::clone(&bridge),
        backend,
        config.grpc.timeout,
    ));

    let tls = server::server_tls_config(&config.tls)?;
    let addr = config.listen_addr()?;
    let listener = server::bind(addr).await?;
    tracing::info!(%addr, tls = tls.is_some(), "Listening for test requests");

    server::serve(listener, OnDemandService::new(handler), tls, shutdown_signal()).await?;

    tracing::info!("Shutting down");
    bridge.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Ctrl+C received");
}
