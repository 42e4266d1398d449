//! Saga orchestrator service.
//!
//! Serves saga initiation and inspection over HTTP, consumes the saga command
//! and domain status topics, and runs the timeout scheduler. Structured logs
//! go through `tracing`, counters through `metrics` with a Prometheus scrape
//! endpoint.

pub mod config;
pub mod error;
pub mod routes;
pub mod supervisor;
pub mod tenant;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use routes::sagas::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::render))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/sagas", get(routes::sagas::list).post(routes::sagas::create))
        .route("/sagas/{transaction_id}", get(routes::sagas::get))
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
