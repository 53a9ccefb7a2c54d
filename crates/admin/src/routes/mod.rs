//! HTTP route handlers for admin.
//!
//! # Route Structure
//!
//! ```text
//! GET  /health                                  - Liveness check
//! GET  /health/ready                            - Readiness check (database)
//!
//! # Shipping (Melhor Envio)
//! GET  /admin/shipping/test                     - Company + balance connectivity check
//! POST /admin/shipping/quotes                   - Quote a shipment
//! GET  /admin/orders/{order_id}/label           - Active label for an order
//! POST /admin/orders/{order_id}/label           - Buy a label for an order
//! POST /admin/shipping/labels/{label_id}/cancel - Cancel a purchased label
//! POST /admin/shipping/labels/{label_id}/sync   - Refresh tracking status
//! ```

pub mod shipping;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{Router, routing::get};

use crate::state::AppState;

/// Build the full router with state applied.
///
/// Tracing and Sentry layers are added by the binary.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(readiness))
        .merge(shipping::router())
        .with_state(state)
}

/// Liveness health check endpoint.
///
/// Returns "ok" if the server is running. Does not check dependencies.
async fn health() -> &'static str {
    "ok"
}

/// Readiness health check endpoint.
///
/// Verifies database connectivity before returning OK.
/// Returns 503 Service Unavailable if the database is not reachable.
async fn readiness(State(state): State<AppState>) -> StatusCode {
    match sqlx::query("SELECT 1").fetch_one(state.pool()).await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
