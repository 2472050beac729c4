//! HTTP API Module
//!
//! Operations endpoints of the fleetmount server:
//! - `state`: Shared application state
//! - `health`: Liveness and readiness probes
//! - `metrics`: Prometheus metrics endpoint
//! - `mounts`: Local mount points and build information

mod health;
mod metrics;
mod mounts;
mod state;

pub use state::AppState;

use axum::{routing::get, Router};

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health checks
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        // Observability
        .route("/metrics", get(metrics::get_metrics))
        .route("/version", get(mounts::get_version))
        // Mount points
        .route("/mounts", get(mounts::list_mounts))
        .with_state(state)
}
