use crate::{predictor::Predictor, routes::ApiError, server::SharedState};
use axum::{extract::State, response::IntoResponse};
use prometheus::{Encoder, TextEncoder};

pub async fn metrics_handler<P: Predictor>(
    State(state): State<SharedState<P>>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .metrics
        .record_open_sessions(state.inference_service.session_count());
    let metric_families = state.metrics.registry.gather();

    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| ApiError::Internal(format!("failed to encode metrics: {}", e)))?;

    String::from_utf8(buffer)
        .map_err(|e| ApiError::Internal(format!("metrics are not valid utf-8: {}", e)))
}
