//! PaaS billing service
//!
//! Runs the HTTP API together with the background processor, the cost gauge
//! loop and, when Cloud Foundry credentials are configured, one usage event
//! collector per event kind.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use paasbill_common::{Config, EventKind};
use paasbill_eventstore::collector::{CfUsageEventFetcher, EventCollector};
use paasbill_eventstore::{EventStore, Processor, StoreMetrics};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use paasbill_api::auth::{Authenticator, StaticAuthenticator, UaaAuthenticator};
use paasbill_api::{router, AppConfig, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting PaaS billing v{}", env!("CARGO_PKG_VERSION"));

    let reference = match &config.billing_config {
        Some(path) => Config::from_path(path)
            .with_context(|| format!("failed to load billing config {}", path.display()))?,
        None => {
            warn!("BILLING_CONFIG is not set, starting without pricing plans");
            Config::default()
        }
    };

    let registry = prometheus::Registry::new();
    let metrics = StoreMetrics::new()?;
    metrics.register(&registry)?;

    let store = EventStore::connect(config.engine.clone(), reference, metrics).await?;
    store.init().await.context("failed to initialise event store")?;
    info!(database_url = %config.engine.database_url, "Event store ready");

    let token = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let processor = Processor::new(store.clone(), config.processor.clone());
    tasks.push(tokio::spawn({
        let processor = processor.clone();
        let token = token.clone();
        async move { processor.run(token).await }
    }));
    tasks.push(tokio::spawn({
        let token = token.clone();
        async move { processor.run_metrics(token).await }
    }));

    let authenticator: Arc<dyn Authenticator> = match &config.cf {
        Some(cf) => {
            for kind in [EventKind::App, EventKind::Service] {
                let fetcher = CfUsageEventFetcher::new(kind, config.fetcher_config(cf))?;
                let collector = EventCollector::new(
                    config.collector.clone(),
                    Arc::new(fetcher),
                    Arc::new(store.clone()),
                );
                tasks.push(tokio::spawn(collector.run(token.clone())));
            }
            Arc::new(UaaAuthenticator::new(&cf.token_url, &cf.api_address)?)
        }
        None => {
            warn!("CF_API_ADDRESS or CF_TOKEN_URL not set, collectors and authenticated routes are disabled");
            Arc::new(StaticAuthenticator::new())
        }
    };

    let app = router(AppState::new(store, authenticator, registry))
        .layer(CompressionLayer::new())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(token.clone()))
        .await?;

    token.cancel();
    for task in tasks {
        if let Err(err) = task.await {
            warn!(error = %err, "background task ended abnormally");
        }
    }
    info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM and cancels the background loops
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Received shutdown signal");
    token.cancel();
}
