use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use warp::Filter;

mod agents;
mod api;
mod bus;
mod config;
mod coordinator;
mod envelope;
mod error;
mod metrics;
mod middleware;
mod models;
mod runtime;
mod store;
mod workflow;

#[cfg(test)]
mod test_support;

use crate::agents::{HeuristicSummary, ModelSummary, SummaryStrategy};
use crate::bus::{Backoff, MemoryTransport, MessageBus, RedisTransport, Transport};
use crate::config::{BusBackend, Config, StoreBackend, SummarizerKind};
use crate::coordinator::Coordinator;
use crate::metrics::MetricsCollector;
use crate::runtime::Services;
use crate::store::{MemoryStateStore, PgStateStore, StateStore};
use crate::workflow::WorkflowTracker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(environment = ?config.environment, "Starting pipeline orchestrator");

    let metrics = Arc::new(MetricsCollector::new()?);

    // State store: failing to reach Postgres at startup is fatal
    let store: Arc<dyn StateStore> = match config.store_backend {
        StoreBackend::Postgres => Arc::new(
            PgStateStore::connect(&config.database_url)
                .await
                .context("failed to initialize state store")?,
        ),
        StoreBackend::Memory => Arc::new(MemoryStateStore::new()),
    };
    info!(backend = ?config.store_backend, "State store ready");

    // Message bus: so is failing the first connect
    let transport: Arc<dyn Transport> = match config.bus_backend {
        BusBackend::Redis => Arc::new(RedisTransport::new(&config.redis_url)?),
        BusBackend::Memory => Arc::new(MemoryTransport::new()),
    };
    let bus = Arc::new(MessageBus::with_backoff(
        transport,
        Backoff::new(config.reconnect_initial(), config.reconnect_max()),
    ));
    bus.connect()
        .await
        .context("failed to connect to message bus")?;
    info!(backend = ?config.bus_backend, "Message bus connected");

    let services = Services {
        bus: bus.clone(),
        store: store.clone(),
        metrics: metrics.clone(),
    };

    let strategy: Arc<dyn SummaryStrategy> = match config.summarizer {
        SummarizerKind::Heuristic => Arc::new(HeuristicSummary),
        SummarizerKind::Model => Arc::new(ModelSummary::new(
            config.summarizer_endpoint.clone(),
            config.summarizer_api_key.clone(),
        )?),
    };

    let coordinator = Arc::new(
        Coordinator::new(
            agents::pipeline_stages(store, strategy, config.research_latency()),
            services.clone(),
        )
        .with_shutdown_grace(config.shutdown_grace()),
    );
    coordinator.start_all().await?;

    let tracker =
        Arc::new(WorkflowTracker::new(services).with_poll_interval(config.poll_interval()));

    let routes = api::routes(api::ApiContext {
        coordinator: coordinator.clone(),
        tracker,
        metrics,
        run_timeout: config.run_timeout(),
    })
    .recover(error::handle_rejection)
    .with(warp::log("api"))
    .with(middleware::cors());

    // Start server
    let addr = ([0, 0, 0, 0], config.port);
    let (bound, server) = warp::serve(routes).bind_with_graceful_shutdown(addr, async {
        // If the signal handler cannot be installed, run until killed.
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    });
    info!(addr = %bound, "Server listening");
    server.await;

    info!("Shutting down");
    coordinator.stop_all().await;
    bus.disconnect().await;
    info!("Shutdown complete");

    Ok(())
}
