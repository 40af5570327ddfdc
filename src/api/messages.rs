use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};

use crate::convert::{convert_request, ConvertContext, StreamConverter};
use crate::error::{into_axum_response, ProxyError};
use crate::eventstream::FrameRouter;
use crate::observability::token_counter::estimate_request_tokens;
use crate::protocol::anthropic::AnthropicRequest;
use crate::state::AppState;
use crate::stream::{anthropic_sse_stream, collect_response, StreamPipeline};

/// `POST /v1/messages`.
pub async fn handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: bytes::Bytes,
) -> Response {
    match handler_inner(state, headers, body).await {
        Ok(response) => response,
        Err(err) => into_axum_response(&err),
    }
}

async fn handler_inner(
    state: Arc<AppState>,
    headers: HeaderMap,
    body: bytes::Bytes,
) -> Result<Response, ProxyError> {
    state.authenticate(&headers)?;

    let request: AnthropicRequest = serde_json::from_slice(&body)
        .map_err(|e| ProxyError::InvalidRequest(format!("Invalid request body: {e}")))?;

    let request_seq = state.next_request_seq();
    let request_uuid = state.request_uuid(request_seq);
    let message_id = format!("msg_{}", request_uuid.simple());
    let backend_config = &state.config.backend;
    let model_id = backend_config.resolve_model(&request.model);

    let backend_request = convert_request(
        &request,
        &ConvertContext {
            conversation_id: request_uuid.to_string(),
            model_id,
            profile_arn: backend_config.profile_arn.as_deref(),
        },
    )?;
    let payload = serde_json::to_vec(&backend_request)
        .map_err(|e| ProxyError::Internal(format!("Failed to encode backend request: {e}")))?;

    let input_tokens = estimate_request_tokens(&request);
    tracing::debug!(
        request_seq,
        message_id = %message_id,
        model = %request.model,
        backend_model = model_id,
        stream = request.is_stream(),
        messages = request.messages.len(),
        input_tokens,
        "forwarding messages request"
    );

    let response = state.backend.send(bytes::Bytes::from(payload)).await?;

    let stream_config = &state.config.stream;
    let pipeline = StreamPipeline::new(
        FrameRouter::new(
            stream_config.fallback_failure_threshold,
            stream_config.max_frame_bytes,
        ),
        StreamConverter::new(message_id, request.model.as_str(), input_tokens),
    );

    if request.is_stream() {
        let sse = anthropic_sse_stream(response.bytes_stream(), pipeline);
        Ok(sse_ok_response(Body::from_stream(sse)))
    } else {
        let message = collect_response(response.bytes_stream(), pipeline).await;
        Ok(Json(message).into_response())
    }
}

fn sse_ok_response(body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = http::StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        http::header::CACHE_CONTROL,
        http::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        http::header::CONNECTION,
        http::HeaderValue::from_static("keep-alive"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_response_headers() {
        let response = sse_ok_response(Body::empty());
        assert_eq!(response.status(), http::StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[http::header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers[http::header::CACHE_CONTROL], "no-cache");
        assert_eq!(headers[http::header::CONNECTION], "keep-alive");
    }
}
