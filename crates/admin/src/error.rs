//! Unified error handling for admin.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::melhor_envio::ShippingError;

/// Application-level error type for the admin API.
#[derive(Debug, Error)]
pub enum AppError {
    /// Carrier integration failed.
    #[error("Shipping error: {0}")]
    Shipping(#[from] ShippingError),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bad request from client.
    #[error("Bad request: {0}")]
    BadRequest(String),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

impl AppError {
    /// HTTP status for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Shipping(err) => shipping_status(err),
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

const fn shipping_status(err: &ShippingError) -> StatusCode {
    match err {
        ShippingError::Validation(_) => StatusCode::BAD_REQUEST,
        ShippingError::LabelNotFound(_) => StatusCode::NOT_FOUND,
        ShippingError::DuplicatePurchase { .. } | ShippingError::InvalidStateTransition { .. } => {
            StatusCode::CONFLICT
        }
        ShippingError::CarrierRequest { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ShippingError::Auth(_)
        | ShippingError::CarrierUnavailable { .. }
        | ShippingError::Decode(_) => StatusCode::BAD_GATEWAY,
        ShippingError::Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Log server-side and upstream failures with Sentry
        if status.is_server_error() {
            let event_id = sentry::capture_error(&self);
            tracing::error!(
                error = %self,
                sentry_event_id = %event_id,
                "Admin request error"
            );
        }

        // Don't expose internal error details to clients
        let message = match &self {
            Self::Shipping(ShippingError::Repository(_)) => {
                "Internal server error".to_string()
            }
            Self::Shipping(err) => err.to_string(),
            _ => self.to_string(),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}
