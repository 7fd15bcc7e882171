//! Defines the service routes.
//!
//! ## Structure
//! - `GET  /healthz`: liveness
//! - `GET  /readyz` : readiness (document table reachable)
//! - `POST /worker` : run a worker operation in the background

use crate::handlers::{
    AppState,
    health_handlers::{healthz, readyz},
    worker_handlers::invoke_worker,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build the router; the caller supplies `AppState` with `with_state`.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/worker", post(invoke_worker))
}
