use crate::domain::job::JobError;
use crate::services::queue::SubmitError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Service unavailable: {0}")]
    Unavailable(#[from] SubmitError),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl From<JobError> for AppError {
    fn from(e: JobError) -> Self {
        Self::BadRequest(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => {
                tracing::debug!(message = %msg, "Bad request");
                (StatusCode::BAD_REQUEST, msg)
            }
            Self::Unavailable(e) => {
                tracing::warn!(reason = e.as_str(), "Submission refused");
                (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
        };

        let body = Json(json!({
            "message": message
        }));

        (status, body).into_response()
    }
}
