//! The Anthropic adapter: accepts POST `/v1/messages` (and `/messages`),
//! forwards translated Chat Completions requests upstream, and re-emits the
//! result as Anthropic Messages JSON or the Anthropic SSE event sequence.

mod translate;
mod write;

use std::sync::Arc;

use axum::{
    Router,
    extract::{Request, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
};
use serde_json::Value;

use crate::{
    chat::{bool_field, str_field},
    decode::{DecodeFailure, decode_json_body, json_for_log, read_body},
    error::{AnthropicCompatError, CompatError, anthropic_error},
    logfile::CompatLogger,
    upstream::{AnthropicChatExecutor, ChatExecutor, UpstreamOutcome},
};

pub(crate) use translate::{anthropic_to_chat_completions, chat_to_anthropic_message};

pub(crate) struct AnthropicState {
    pub executor: AnthropicChatExecutor,
    pub logger: Arc<CompatLogger>,
    pub preferred_model: Option<String>,
}

pub(crate) fn router(state: Arc<AnthropicState>) -> Router {
    Router::new()
        .route("/v1/messages", any(handle_messages))
        .route("/messages", any(handle_messages))
        .with_state(state)
}

async fn handle_messages(State(state): State<Arc<AnthropicState>>, request: Request) -> Response {
    let logger = &state.logger;
    let (parts, body) = request.into_parts();
    if parts.method != Method::POST {
        return AnthropicCompatError::from(CompatError::MethodNotAllowed).into_response();
    }

    let content_encoding = parts
        .headers
        .get("content-encoding")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let decoded = match read_body(body).await {
        Ok(bytes) => decode_json_body(Some(content_encoding.as_str()), &bytes),
        Err(error) => Err(DecodeFailure {
            error,
            raw_preview: String::new(),
        }),
    };
    let (req, _raw_body) = match decoded {
        Ok(decoded) => decoded,
        Err(failure) => {
            logger.log(format!(
                "decode request failed: {} raw={}",
                failure.error, failure.raw_preview
            ));
            return anthropic_error(StatusCode::BAD_REQUEST, "invalid json body");
        }
    };
    logger.log(format!(
        "incoming request={}",
        json_for_log(&Value::Object(req.clone()))
    ));

    let mut chat_req = anthropic_to_chat_completions(&req);
    let stream = bool_field(&req, "stream");
    chat_req.insert("stream".into(), Value::Bool(stream));
    if let Some(preferred) = &state.preferred_model {
        let incoming = str_field(&chat_req, "model");
        if incoming != preferred.as_str() {
            logger.log(format!(
                "override chat model incoming={incoming:?} preferred={preferred:?}"
            ));
        }
        chat_req.insert("model".into(), Value::String(preferred.clone()));
    }
    logger.log(format!(
        "mapped chat request={}",
        json_for_log(&Value::Object(chat_req.clone()))
    ));

    let outcome = match state.executor.execute(&chat_req).await {
        Ok(outcome) => outcome,
        Err(error) => {
            logger.log(format!("{error}"));
            return AnthropicCompatError::from(error).into_response();
        }
    };
    let upstream = match outcome {
        UpstreamOutcome::ErrorStatus { status, body } => {
            logger.log(format!(
                "upstream status={} body={}",
                status.as_u16(),
                crate::decode::truncate_for_log(
                    &String::from_utf8_lossy(&body),
                    crate::decode::LOG_PREVIEW_BYTES
                )
            ));
            let text = String::from_utf8_lossy(&body);
            return anthropic_error(status, text.trim());
        }
        UpstreamOutcome::Success(upstream) => upstream,
    };

    let requested_model = str_field(&chat_req, "model").to_string();
    if stream {
        write::stream_response(state.logger.clone(), upstream, requested_model)
    } else {
        write::non_stream_response(logger, upstream, &requested_model).await
    }
}
