use crate::{
    mask::MaskEncoding,
    models::{FrameResult, PredictPayload},
    multipart::MultipartMaskResponse,
    predictor::Predictor,
    routes::{parse_body, ApiError},
    server::SharedState,
};
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap},
    response::{IntoResponse, Json, Response},
};
use futures::stream;
use std::{convert::Infallible, time::Instant};
use tracing::instrument;

const MULTIPART_MIXED: &str = "multipart/mixed";

#[instrument(skip(state, headers, body))]
pub async fn predict<P: Predictor>(
    State(state): State<SharedState<P>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    state.metrics.record_request("/predict");
    let payload: PredictPayload = parse_body(&body)?;
    let encoding = requested_encoding(&headers);

    let started = Instant::now();
    let result = state.inference_service.predict(payload, encoding).await?;
    state.metrics.record_prediction_duration(
        started.elapsed().as_millis() as u64,
        match encoding {
            MaskEncoding::Base64 => "base64",
            MaskEncoding::Binary => "binary",
        },
    );
    state
        .metrics
        .record_open_sessions(state.inference_service.session_count());

    tracing::debug!(
        "predict returned {} masks for session {} frame {}",
        result.results.len(),
        result.session_id,
        result.frame_index
    );

    match encoding {
        MaskEncoding::Base64 => Ok(Json(result).into_response()),
        MaskEncoding::Binary => multipart_response(result),
    }
}

fn requested_encoding(headers: &HeaderMap) -> MaskEncoding {
    let wants_multipart = headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.to_ascii_lowercase().contains(MULTIPART_MIXED));

    if wants_multipart {
        MaskEncoding::Binary
    } else {
        MaskEncoding::Base64
    }
}

fn multipart_response(result: FrameResult) -> Result<Response, ApiError> {
    let mut multipart = MultipartMaskResponse::new();
    multipart
        .add_metadata(&result.session_id, result.frame_index, result.results.len())
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    for object in result.results {
        let png = object
            .mask
            .data
            .png_bytes()
            .cloned()
            .ok_or_else(|| ApiError::Internal("mask was not binary encoded".into()))?;
        multipart
            .add_mask(
                object.object_id,
                object.score,
                object.mask.width,
                object.mask.height,
                png,
            )
            .map_err(|e| ApiError::Internal(e.to_string()))?;
    }

    let content_type = multipart.content_type();
    let chunks = stream::iter(
        multipart
            .into_chunks()
            .into_iter()
            .map(Ok::<_, Infallible>),
    );

    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from_stream(chunks))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_requested_encoding() {
        let mut headers = HeaderMap::new();
        assert_eq!(requested_encoding(&headers), MaskEncoding::Base64);

        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        assert_eq!(requested_encoding(&headers), MaskEncoding::Base64);

        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("Multipart/Mixed, application/json;q=0.5"),
        );
        assert_eq!(requested_encoding(&headers), MaskEncoding::Binary);
    }
}
