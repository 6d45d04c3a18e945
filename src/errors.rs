use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::order::OrderStatus;

/// Standard error payload returned to HTTP adapters.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Conflict")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// ISO 8601 timestamp when the error occurred
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sea_orm::error::DbErr),

    #[error("Insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: Uuid,
        requested: i32,
        available: i32,
    },

    #[error("Coupon not found: {0}")]
    CouponNotFound(String),

    #[error("Coupon expired or inactive: {0}")]
    CouponExpired(String),

    #[error("Coupon already used: {0}")]
    CouponAlreadyUsed(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: OrderStatus, to: OrderStatus },

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Concurrent modification of {0}, retry the request")]
    ConcurrentModification(Uuid),

    #[error("Refund exceeds refundable amount: {0}")]
    RefundExceedsAvailable(String),

    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Payment gateway rejected the request: {0}")]
    GatewayRejected(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// Single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) | Self::EventError(_) | Self::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::OrderNotFound(_) | Self::NotFound(_) | Self::CouponNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::ValidationError(_)
            | Self::InvalidOperation(_)
            | Self::InvalidStateTransition { .. }
            | Self::CouponExpired(_) => StatusCode::BAD_REQUEST,
            Self::CouponAlreadyUsed(_) | Self::ConcurrentModification(_) => StatusCode::CONFLICT,
            Self::InsufficientStock { .. } | Self::RefundExceedsAvailable(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::GatewayUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::GatewayRejected(_) => StatusCode::PAYMENT_REQUIRED,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::EventError(_) | Self::InternalError(_) => "Internal server error".to_string(),
            // Validation-shaped errors describe user-actionable conditions and
            // are surfaced verbatim.
            _ => self.to_string(),
        }
    }

    /// Whether the caller should retry the whole operation from scratch.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentModification(_) | Self::GatewayUnavailable(_)
        )
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}
