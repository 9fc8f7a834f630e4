use std::time::Duration;

use thiserror::Error;
use warp::http::StatusCode;
use warp::{reject::Reject, Rejection, Reply};

/// Failures raised inside the messaging runtime.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("Run {context_id} timed out after {elapsed:?}")]
    Timeout { context_id: String, elapsed: Duration },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<redis::RedisError> for PipelineError {
    fn from(err: redis::RedisError) -> Self {
        PipelineError::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        PipelineError::Handler(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

impl Reject for ApiError {}

pub async fn handle_rejection(err: Rejection) -> std::result::Result<impl Reply, Rejection> {
    if let Some(api_err) = err.find::<ApiError>() {
        let (code, message) = match api_err {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "Resource not found"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "Bad request"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "Conflict"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
        };

        let json = warp::reply::json(&serde_json::json!({
            "error": message,
            "details": api_err.to_string(),
        }));

        Ok(warp::reply::with_status(json, code))
    } else if let Some(body_err) = err.find::<warp::filters::body::BodyDeserializeError>() {
        let json = warp::reply::json(&serde_json::json!({
            "error": "Bad request",
            "details": body_err.to_string(),
        }));

        Ok(warp::reply::with_status(json, StatusCode::BAD_REQUEST))
    } else {
        Err(err)
    }
}
