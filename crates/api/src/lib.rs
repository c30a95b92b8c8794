//! HTTP monitoring surface and process wiring for the saga engine.
//!
//! Provides the ingest endpoint feeding the in-process message source, the
//! read-only monitoring endpoints over the store, and [`start_engine`], which
//! assembles dispatcher, saga engine, step executor, ingress, and relay into
//! a running system with coordinated shutdown.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use dispatcher::Dispatcher;
use ingress::{ChannelSource, IngressWorker};
use relay::OutboxRelay;
use saga::{SagaEngine, order_processing};
use store::SagaStore;

pub use config::Config;
use routes::records::AppState;

/// Handles to the engine's background workers, used for graceful shutdown.
pub struct EngineHandles {
    shutdown_tx: watch::Sender<bool>,
    ingress_task: JoinHandle<()>,
    relay_task: JoinHandle<()>,
    dispatcher: Dispatcher,
}

impl EngineHandles {
    /// Shuts the engine down in dependency order: ingress stops pulling, the
    /// relay finishes its in-flight batch, then the dispatcher drains its
    /// queues up to `grace` per worker.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);
        let _ = tokio::time::timeout(grace, self.ingress_task).await;
        let _ = tokio::time::timeout(grace, self.relay_task).await;
        self.dispatcher.shutdown(grace).await;
        tracing::info!("engine shut down");
    }
}

/// Wires up and starts the whole engine around the given store.
///
/// Returns the shared API state and the background-worker handles.
pub fn start_engine<S: SagaStore + Clone + 'static>(
    store: S,
    config: &Config,
) -> Result<(Arc<AppState<S>>, EngineHandles), executor::ExecutorError> {
    let dispatcher = Dispatcher::new(config.dispatcher_workers, config.dispatcher_queue_depth);
    let definition = Arc::new(order_processing::definition());

    let engine = Arc::new(SagaEngine::new(
        store.clone(),
        dispatcher.clone(),
        definition.clone(),
    ));
    engine.register();

    executor::register_step_handlers(
        &dispatcher,
        &definition,
        &config.step_endpoints,
        reqwest::Client::new(),
    )?;

    let (source, ingest) = ChannelSource::new(256);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ingress_task = tokio::spawn(
        IngressWorker::new(store.clone(), dispatcher.clone(), definition, source)
            .run(shutdown_rx.clone()),
    );
    let relay_task = tokio::spawn(
        OutboxRelay::new(store.clone(), dispatcher.clone(), config.relay_config())
            .run(shutdown_rx),
    );

    let state = Arc::new(AppState { store, ingest });
    let handles = EngineHandles {
        shutdown_tx,
        ingress_task,
        relay_task,
        dispatcher,
    };
    Ok((state, handles))
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: SagaStore + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/records", post(routes::records::ingest::<S>))
        .route("/stats", get(routes::sagas::stats::<S>))
        .route("/sagas/{id}", get(routes::sagas::get::<S>))
        .route("/outbox/recent", get(routes::outbox::recent::<S>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
