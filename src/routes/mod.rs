mod health;
mod metrics;
mod predict;
mod sessions;

use crate::{
    inference::InferenceError, predictor::Predictor, server::SharedState, video::VideoPathError,
};
use axum::{
    body::Bytes,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

pub fn api_routes<P: Predictor>() -> Router<SharedState<P>> {
    Router::new()
        .route("/start_session", post(sessions::start_session::<P>))
        .route("/close_session", post(sessions::close_session::<P>))
        .route("/predict", post(predict::predict::<P>))
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler::<P>))
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("{0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorDetail {
    detail: String,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Inference(err) => match err {
                InferenceError::Validation(_) | InferenceError::Resource(_) => {
                    StatusCode::BAD_REQUEST
                }
                InferenceError::VideoPath(VideoPathError::NotFound) => StatusCode::NOT_FOUND,
                InferenceError::VideoPath(_) => StatusCode::BAD_REQUEST,
                InferenceError::Session(_) => StatusCode::NOT_FOUND,
                InferenceError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
                InferenceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        } else {
            tracing::warn!("request rejected: {}", self);
        }

        (
            status,
            Json(ErrorDetail {
                detail: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// An empty body stands for `{}`.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {}", e)))
}
