//! The Responses adapter: accepts POST `/v1/responses`, forwards translated
//! Chat Completions requests upstream, and re-emits the result as the
//! Responses SSE dialect (or a single JSON object for non-stream calls).

mod translate;
mod write;

use std::sync::Arc;

use axum::{
    Router,
    extract::{Request, State},
    http::Method,
    response::{IntoResponse, Response},
    routing::any,
};
use serde_json::Value;

use crate::{
    chat::bool_field,
    decode::{DecodeFailure, decode_json_body, json_for_log, read_body},
    error::{CompatError, forward_upstream_error},
    logfile::CompatLogger,
    upstream::{ChatExecutor, ResponsesChatExecutor, UpstreamOutcome},
};

pub(crate) use translate::responses_to_chat_completions;

pub(crate) struct ResponsesState {
    pub executor: ResponsesChatExecutor,
    pub logger: Arc<CompatLogger>,
}

pub(crate) fn router(state: Arc<ResponsesState>) -> Router {
    Router::new()
        .route("/v1/responses", any(handle_responses))
        .with_state(state)
}

async fn handle_responses(State(state): State<Arc<ResponsesState>>, request: Request) -> Response {
    let logger = &state.logger;
    let (parts, body) = request.into_parts();
    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    };
    logger.log(format!(
        "request method={} path={} content_type={:?} content_encoding={:?} user_agent={:?}",
        parts.method,
        parts.uri.path(),
        header("content-type"),
        header("content-encoding"),
        header("user-agent"),
    ));

    if parts.method != Method::POST {
        return CompatError::MethodNotAllowed.into_response();
    }

    let content_encoding = header("content-encoding").to_string();
    let decoded = match read_body(body).await {
        Ok(bytes) => decode_json_body(Some(content_encoding.as_str()), &bytes),
        Err(error) => Err(DecodeFailure {
            error,
            raw_preview: String::new(),
        }),
    };
    let (req, raw_body) = match decoded {
        Ok(decoded) => decoded,
        Err(failure) => {
            logger.log(format!("raw incoming body={}", failure.raw_preview));
            logger.log(format!("decode request failed: {}", failure.error));
            logger.warn("request decode failed");
            return CompatError::Decode(failure.error).into_response();
        }
    };
    logger.log(format!("raw incoming body={raw_body}"));
    logger.log(format!(
        "decoded responses request={}",
        json_for_log(&Value::Object(req.clone()))
    ));

    let stream = bool_field(&req, "stream");
    let chat_req = responses_to_chat_completions(&req);
    logger.log(format!(
        "mapped chat request(initial)={}",
        json_for_log(&Value::Object(chat_req.clone()))
    ));

    let outcome = match state.executor.execute(&chat_req).await {
        Ok(outcome) => outcome,
        Err(error) => {
            logger.log(format!("{error}"));
            logger.warn("upstream request failed");
            return error.into_response();
        }
    };

    match outcome {
        UpstreamOutcome::ErrorStatus { status, body } => {
            let kind = if stream { "stream" } else { "non-stream" };
            logger.warn(&format!("forward {kind} upstream status {}", status.as_u16()));
            forward_upstream_error(status, &body)
        }
        UpstreamOutcome::Success(upstream) => {
            if stream {
                write::stream_response(state.logger.clone(), upstream)
            } else {
                write::non_stream_response(logger, upstream).await
            }
        }
    }
}
