use crate::{
    models::{CloseSessionRequest, CloseSessionResponse, StartSessionRequest, StartSessionResponse},
    predictor::Predictor,
    routes::{parse_body, ApiError},
    server::SharedState,
};
use axum::{body::Bytes, extract::State, response::Json};
use tracing::instrument;

#[instrument(skip(state, body))]
pub async fn start_session<P: Predictor>(
    State(state): State<SharedState<P>>,
    body: Bytes,
) -> Result<Json<StartSessionResponse>, ApiError> {
    state.metrics.record_request("/start_session");
    let request: StartSessionRequest = parse_body(&body)?;

    let session_id = state.inference_service.start_session(request.path).await?;
    state
        .metrics
        .record_open_sessions(state.inference_service.session_count());

    Ok(Json(StartSessionResponse { session_id }))
}

#[instrument(skip(state, body))]
pub async fn close_session<P: Predictor>(
    State(state): State<SharedState<P>>,
    body: Bytes,
) -> Result<Json<CloseSessionResponse>, ApiError> {
    state.metrics.record_request("/close_session");
    let request: CloseSessionRequest = parse_body(&body)?;
    let session_id = request
        .session_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::BadRequest("sessionId required".into()))?;

    let success = state.inference_service.close_session(session_id).await?;
    state
        .metrics
        .record_open_sessions(state.inference_service.session_count());

    Ok(Json(CloseSessionResponse { success }))
}
