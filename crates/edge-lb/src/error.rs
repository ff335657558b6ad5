//! Configuration errors and their rendering at the request boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::clock::iso_timestamp;

/// Fatal problems with the raw load-balancer input.
///
/// Only the origin pool can be fatal: every other field has a default and is
/// clamped instead of rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} is not set")]
    Missing { field: &'static str },

    #[error("{field} does not contain any entries")]
    Empty { field: &'static str },
}

impl IntoResponse for ConfigError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            axum::Json(serde_json::json!({
                "error": "Load balancer configuration error",
                "message": self.to_string(),
                "timestamp": iso_timestamp(),
            })),
        )
            .into_response()
    }
}
