//! Shipping routes: carrier diagnostics, quotes and labels.

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use shipdesk_core::{CarrierServiceId, LabelId, OrderId, ShipmentRequest};

use crate::error::AppError;
use crate::melhor_envio::{Label, Quote};
use crate::state::AppState;

/// Build the shipping router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/shipping/test", get(test_connection))
        .route("/admin/shipping/quotes", post(quotes))
        .route(
            "/admin/orders/{order_id}/label",
            get(order_label).post(purchase_label),
        )
        .route("/admin/shipping/labels/{label_id}/cancel", post(cancel_label))
        .route("/admin/shipping/labels/{label_id}/sync", post(sync_tracking))
}

// =============================================================================
// API Types
// =============================================================================

/// Successful API response.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }
}

/// Failure body for the connection test.
#[derive(Debug, Serialize)]
pub struct TestFailure {
    pub error: String,
    pub details: String,
}

/// Request to buy a label for an order.
#[derive(Debug, Deserialize)]
pub struct PurchaseLabelRequest {
    pub service_id: CarrierServiceId,
    pub shipment: ShipmentRequest,
}

/// Malformed JSON bodies are validation failures.
fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| AppError::BadRequest(rejection.body_text()))
}

// =============================================================================
// Route Handlers
// =============================================================================

/// GET /admin/shipping/test - Verify carrier credentials and connectivity.
///
/// Returns the account's company and balance.
#[instrument(skip(state))]
async fn test_connection(State(state): State<AppState>) -> Response {
    match state.shipping().account().preflight().await {
        Ok(diagnostics) => ApiResponse::ok(diagnostics).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Carrier connection test failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(TestFailure {
                    error: "Carrier connection test failed".to_string(),
                    details: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// POST /admin/shipping/quotes - Quote a shipment, cheapest first.
#[instrument(skip(state, body))]
async fn quotes(
    State(state): State<AppState>,
    body: Result<Json<ShipmentRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<Vec<Quote>>>, AppError> {
    let shipment = json_body(body)?;
    let quotes = state.shipping().quotes().get_quotes(&shipment).await?;
    Ok(ApiResponse::ok(quotes))
}

/// POST /admin/orders/{order_id}/label - Buy a label for an order.
///
/// Re-quotes the shipment so the label is bought at a price the carrier is
/// offering now.
#[instrument(skip(state, body))]
async fn purchase_label(
    State(state): State<AppState>,
    Path(order_id): Path<i32>,
    body: Result<Json<PurchaseLabelRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<Label>>), AppError> {
    let request = json_body(body)?;
    let shipping = state.shipping();

    let quote = shipping
        .quotes()
        .quote_for_service(&request.shipment, request.service_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "service {} is not offered for this shipment",
                request.service_id
            ))
        })?;

    let label = shipping
        .labels()
        .purchase_label(OrderId::new(order_id), &quote)
        .await?;

    Ok((StatusCode::CREATED, ApiResponse::ok(label)))
}

/// GET /admin/orders/{order_id}/label - The order's active label.
#[instrument(skip(state))]
async fn order_label(
    State(state): State<AppState>,
    Path(order_id): Path<i32>,
) -> Result<Json<ApiResponse<Label>>, AppError> {
    let label = state
        .shipping()
        .labels()
        .label_for_order(OrderId::new(order_id))
        .await?
        .ok_or_else(|| AppError::NotFound(format!("order {order_id} has no active label")))?;

    Ok(ApiResponse::ok(label))
}

/// POST /admin/shipping/labels/{label_id}/cancel - Cancel a purchased label.
#[instrument(skip(state))]
async fn cancel_label(
    State(state): State<AppState>,
    Path(label_id): Path<String>,
) -> Result<Json<ApiResponse<Label>>, AppError> {
    let label = state
        .shipping()
        .labels()
        .cancel_label(&LabelId::new(label_id))
        .await?;

    Ok(ApiResponse::ok(label))
}

/// POST /admin/shipping/labels/{label_id}/sync - Pull the carrier's tracking status.
#[instrument(skip(state))]
async fn sync_tracking(
    State(state): State<AppState>,
    Path(label_id): Path<String>,
) -> Result<Json<ApiResponse<Label>>, AppError> {
    let label = state
        .shipping()
        .labels()
        .sync_tracking(&LabelId::new(label_id))
        .await?;

    Ok(ApiResponse::ok(label))
}
