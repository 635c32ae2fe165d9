use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::DbErr;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Errors produced by the service layer.
///
/// Each variant corresponds to one code of the public error taxonomy, plus a
/// few internal classes that all surface as `INTERNAL_ERROR`.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("payment failed: {0}")]
    PaymentFailed(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("insufficient stock in zone {zone_id}: requested {requested}, available {available}")]
    InsufficientStock {
        zone_id: String,
        requested: i64,
        available: i64,
    },

    #[error("per-user reservation cap exceeded: holding {current}, requested {requested}, cap {cap}")]
    MaxPerUserExceeded {
        current: i64,
        requested: i64,
        cap: i64,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("reservation expired or missing: {0}")]
    ReservationExpired(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("database error: {0}")]
    Database(#[from] DbErr),

    #[error("inventory store error: {0}")]
    InventoryStore(String),

    #[error("message queue error: {0}")]
    MessageQueue(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// The stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "VALIDATION_ERROR",
            ServiceError::Unauthorized(_) => "UNAUTHORIZED",
            ServiceError::PaymentFailed(_) => "PAYMENT_FAILED",
            ServiceError::Forbidden(_) => "FORBIDDEN",
            ServiceError::NotFound(_) => "NOT_FOUND",
            ServiceError::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
            ServiceError::MaxPerUserExceeded { .. } => "MAX_PER_USER_EXCEEDED",
            ServiceError::Conflict(_) => "CONFLICT",
            ServiceError::ReservationExpired(_) => "RESERVATION_EXPIRED",
            ServiceError::RateLimited { .. } => "RATE_LIMITED",
            ServiceError::Database(_)
            | ServiceError::InventoryStore(_)
            | ServiceError::MessageQueue(_)
            | ServiceError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether a worker observing this error should retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::Database(_)
                | ServiceError::InventoryStore(_)
                | ServiceError::MessageQueue(_)
                | ServiceError::Internal(_)
        )
    }
}

/// HTTP-facing error wrapper. Converts a `ServiceError` into the standard
/// `{success: false, error: {code, message}}` envelope.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ApiError(#[from] pub ServiceError);

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServiceError::PaymentFailed(_) => StatusCode::PAYMENT_REQUIRED,
            ServiceError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::InsufficientStock { .. }
            | ServiceError::MaxPerUserExceeded { .. }
            | ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::ReservationExpired(_) => StatusCode::GONE,
            ServiceError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ServiceError::Database(_)
            | ServiceError::InventoryStore(_)
            | ServiceError::MessageQueue(_)
            | ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// User-visible message. Internal classes are masked so backend details
    /// never reach the client.
    fn public_message(&self) -> String {
        match &self.0 {
            ServiceError::Database(_)
            | ServiceError::InventoryStore(_)
            | ServiceError::MessageQueue(_)
            | ServiceError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }

        let body = Json(json!({
            "success": false,
            "error": {
                "code": self.0.code(),
                "message": self.public_message(),
            }
        }));

        let mut response = (status, body).into_response();
        if let ServiceError::RateLimited { retry_after_secs } = self.0 {
            if let Ok(value) = http::HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_codes_are_stable() {
        assert_eq!(
            ServiceError::Validation("q".into()).code(),
            "VALIDATION_ERROR"
        );
        assert_eq!(
            ServiceError::InsufficientStock {
                zone_id: "z".into(),
                requested: 2,
                available: 1
            }
            .code(),
            "INSUFFICIENT_STOCK"
        );
        assert_eq!(
            ServiceError::MaxPerUserExceeded {
                current: 3,
                requested: 2,
                cap: 4
            }
            .code(),
            "MAX_PER_USER_EXCEEDED"
        );
        assert_eq!(
            ServiceError::RateLimited {
                retry_after_secs: 1
            }
            .code(),
            "RATE_LIMITED"
        );
        assert_eq!(
            ServiceError::Internal("boom".into()).code(),
            "INTERNAL_ERROR"
        );
    }

    #[test]
    fn internal_errors_are_masked() {
        let err = ApiError(ServiceError::Internal("pool exhausted at 10.0.0.3".into()));
        assert_eq!(err.public_message(), "internal server error");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn retryable_classification() {
        assert!(ServiceError::InventoryStore("io".into()).is_retryable());
        assert!(!ServiceError::ReservationExpired("b1".into()).is_retryable());
        assert!(!ServiceError::Conflict("already confirmed".into()).is_retryable());
    }
}
