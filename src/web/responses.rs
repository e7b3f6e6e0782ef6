use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::utils::error::AppError;

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ApiError>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(ApiError {
                code: code.into(),
                message: message.into(),
            }),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// HTTP rendering of a failed command.
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl HttpError {
    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    pub fn error_code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "BAD_REQUEST",
            message: msg.into(),
        }
    }
}

impl From<AppError> for HttpError {
    fn from(err: AppError) -> Self {
        let (status, code) = match err.root_cause() {
            AppError::NotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_FAILED"),
            AppError::DuplicateTask { .. } => (StatusCode::CONFLICT, "ALREADY_QUEUED"),
            AppError::TaskRemoved { .. } => (StatusCode::CONFLICT, "TASK_REMOVED"),
            AppError::QueueFull { .. } => (StatusCode::SERVICE_UNAVAILABLE, "QUEUE_FULL"),
            AppError::QueueClosed => (StatusCode::SERVICE_UNAVAILABLE, "QUEUE_CLOSED"),
            AppError::RecoveryExhausted { .. } => (StatusCode::SERVICE_UNAVAILABLE, "RECOVERY_EXHAUSTED"),
            AppError::Timeout { .. } | AppError::QueueTimeout { .. } => {
                (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_SERVER_ERROR"),
        };

        if status.is_server_error() {
            tracing::error!("Command failed: {}", err);
        }

        Self {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let body = ApiResponse::<()>::error(self.code, self.message);
        (self.status, Json(body)).into_response()
    }
}
