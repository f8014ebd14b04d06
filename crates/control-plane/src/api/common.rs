// Common DTOs for public API
//
// Every endpoint answers with the same envelope. Validation failures are
// client errors (400); every other failure is reported as a server error
// (500) with the message in `error`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use keel_durable::ControlError;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Response envelope. Absent fields are omitted.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiResponse<T> {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Human-readable outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Operation result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error description when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Handler error, rendered as an error envelope
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    /// Map a control error, prefixing its message with `context`
    pub fn from_control(context: &str, error: ControlError) -> Self {
        let category = error.category();
        if category.is_client_error() {
            tracing::debug!(%category, "{}: {}", context, error);
            Self::bad_request(format!("{}: {}", context, error))
        } else {
            tracing::error!(%category, "{}: {}", context, error);
            Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: format!("{}: {}", context, error),
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiResponse::<()>::error(self.message))).into_response()
    }
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Seconds since the Unix epoch, as timestamps appear on the wire
pub fn epoch_seconds(time: DateTime<Utc>) -> i64 {
    time.timestamp()
}
