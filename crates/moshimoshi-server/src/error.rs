use crate::directory::DirectoryError;
use crate::media::EngineError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use moshimoshi_protocol::{ErrorCode, ErrorPayload};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthenticated,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    BadRequest(String),

    #[error("Media engine failure: {0}")]
    EngineFailure(#[from] EngineError),

    #[error("Directory failure: {0}")]
    DirectoryFailure(DirectoryError),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl From<DirectoryError> for AppError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::MeetingNotFound(id) => {
                AppError::NotFound(format!("meeting {id} not found or already finished"))
            }
            DirectoryError::ParticipantNotFound { meeting_id, user_id } => AppError::NotFound(
                format!("user {user_id} is not attending meeting {meeting_id}"),
            ),
            other => AppError::DirectoryFailure(other),
        }
    }
}

impl AppError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Unauthenticated => ErrorCode::Unauthenticated,
            AppError::NotFound(_) => ErrorCode::NotFound,
            AppError::BadRequest(_) => ErrorCode::BadRequest,
            AppError::EngineFailure(_) => ErrorCode::EngineFailure,
            AppError::DirectoryFailure(_) => ErrorCode::DirectoryFailure,
            AppError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Message safe to show to the client; storage and internal details stay in the logs
    pub fn public_message(&self) -> String {
        match self {
            AppError::NotFound(msg) | AppError::BadRequest(msg) => msg.clone(),
            AppError::DirectoryFailure(e) => {
                tracing::error!("Directory error: {:?}", e);
                "Directory unavailable".to_string()
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code(),
            message: self.public_message(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::EngineFailure(_) => StatusCode::BAD_GATEWAY,
            AppError::DirectoryFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.public_message(),
            "code": self.code(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
