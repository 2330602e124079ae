//! REST error envelope.
//!
//! Every error leaves the server as `{"error": {"code": ..., "message": ...}}`.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

/// Error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    /// Machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// Top-level error envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// The error.
    pub error: ApiErrorBody,
}

impl ApiError {
    /// Create an error envelope.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ApiErrorBody {
                code: code.into(),
                message: message.into(),
            },
        }
    }

    /// Pair with a status code into a response.
    #[must_use]
    pub fn with_status(self, status: StatusCode) -> Response {
        (status, Json(self)).into_response()
    }
}

/// Resource not found.
pub const NOT_FOUND: &str = "not_found";
/// Request failed validation.
pub const INVALID_REQUEST: &str = "invalid_request";
/// Backing store unavailable.
pub const STORE_UNAVAILABLE: &str = "store_unavailable";
/// Too many admin requests from this client.
pub const RATE_LIMITED: &str = "rate_limited";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_shape() {
        let json = serde_json::to_value(ApiError::new(NOT_FOUND, "no plan")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"error": {"code": "not_found", "message": "no plan"}})
        );
    }
}
