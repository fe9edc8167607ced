//! agentd - service entry point
//!
//! Loads the catalog, connects tool servers, starts the scheduler and runs
//! until Ctrl-C or SIGTERM.

use std::sync::Arc;

use agentd::{
    catalog::StaticCatalog,
    config::Config,
    llm::{LlmClient, OpenRouterClient},
    AgentRuntime, Catalog,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agentd=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!("Loaded configuration: model={}", config.default_model);

    let catalog: Arc<dyn Catalog> = match &config.catalog_path {
        Some(path) => {
            let catalog = StaticCatalog::load(path).await?;
            info!("Loaded catalog from {}", path.display());
            Arc::new(catalog)
        }
        None => {
            warn!("AGENTD_CATALOG not set, starting with an empty catalog");
            Arc::new(StaticCatalog::new())
        }
    };

    let mut client = OpenRouterClient::new(config.api_key.clone());
    if let Some(base_url) = &config.llm_base_url {
        client = client.with_base_url(base_url.clone());
    }
    let llm: Arc<dyn LlmClient> = Arc::new(client);

    let runtime = AgentRuntime::new(config, catalog, llm);
    runtime.start().await;

    shutdown_signal().await;
    info!("Shutdown requested");
    let report = runtime.shutdown().await;
    if !report.cancelled.is_empty() {
        warn!("Cancelled {} unfinished runs", report.cancelled.len());
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
