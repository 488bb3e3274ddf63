use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::lifecycle::{Action, AppointmentStatus};
use crate::models::ApiResponse;
use crate::schedule::ScheduleError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    InvalidDateOrTime(#[from] ScheduleError),

    #[error("{0}")]
    Unauthorized(String),

    #[error("access denied")]
    AccessDenied,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("master has no availability configured")]
    MasterNotConfigured,

    #[error("service not found")]
    ServiceNotFound,

    #[error("service does not belong to this master")]
    ServiceOwnershipMismatch,

    #[error("slot already taken")]
    SlotTaken,

    #[error("cannot {action} an appointment that is {from}")]
    InvalidStateTransition {
        from: AppointmentStatus,
        action: Action,
    },

    #[error("review not allowed: {0}")]
    ReviewNotAllowed(&'static str),

    #[error("too many requests, try again in {retry_after} seconds")]
    RateLimited { retry_after: u64 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_)
            | AppError::InvalidDateOrTime(_)
            | AppError::ServiceNotFound
            | AppError::ServiceOwnershipMismatch
            | AppError::SlotTaken
            | AppError::InvalidStateTransition { .. }
            | AppError::ReviewNotAllowed(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::AccessDenied => StatusCode::FORBIDDEN,
            AppError::NotFound(_) | AppError::MasterNotConfigured => StatusCode::NOT_FOUND,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        let body = Json(ApiResponse::<()>::error(message));

        match self {
            AppError::RateLimited { retry_after } => (
                status,
                [(header::RETRY_AFTER, retry_after.to_string())],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, AppError>;
