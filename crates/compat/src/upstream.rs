//! Upstream Chat Completions calls and the per-adapter retry ladders.
//!
//! Both adapters POST the mapped request to `<upstream>/chat/completions`.
//! What happens on an error status is adapter-specific and lives behind the
//! [`ChatExecutor`] seam: the Responses ladder strips the request down when
//! the gateway rejects its own serialization as "invalid json", and the
//! Anthropic ladder retries case-folded model ids once on "unknown model".

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use reqwest::header::{ACCEPT_ENCODING, AUTHORIZATION, CONTENT_TYPE};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value, json};

use crate::{
    chat::{normalize_content, str_field},
    decode::{LOG_PREVIEW_BYTES, json_for_log, truncate_for_log},
    error::{CompatError, Result},
    http_client::streaming_http_client,
    logfile::CompatLogger,
};

/// Final word from the upstream after any retry policy ran: either a live
/// 2xx response ready for streaming/reading, or a captured error.
pub(crate) enum UpstreamOutcome {
    Success(reqwest::Response),
    ErrorStatus { status: StatusCode, body: Bytes },
}

#[async_trait]
pub(crate) trait ChatExecutor: Send + Sync {
    async fn execute(&self, chat_req: &Map<String, Value>) -> Result<UpstreamOutcome>;
}

pub(crate) struct UpstreamClient {
    base_url: String,
    api_key: Option<SecretString>,
    client: reqwest::Client,
    pub(crate) logger: Arc<CompatLogger>,
}

impl UpstreamClient {
    pub fn new(base_url: &str, api_key: Option<SecretString>, logger: Arc<CompatLogger>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: streaming_http_client(),
            logger,
        }
    }

    pub async fn post_chat_completions(&self, payload: &Value) -> Result<reqwest::Response> {
        let body = serde_json::to_vec(payload).map_err(|error| {
            log::warn!("failed to serialize chat request: {error}");
            CompatError::Internal
        })?;
        let url = format!("{}/chat/completions", self.base_url);
        self.logger.log(format!(
            "upstream POST {url} payload={}",
            truncate_for_log(&String::from_utf8_lossy(&body), LOG_PREVIEW_BYTES)
        ));

        let mut request = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            // SSE is streamed uncompressed so a truncated stream fails as a
            // short read instead of a mid-stream decode error.
            .header(ACCEPT_ENCODING, "identity")
            .body(body);
        if let Some(key) = &self.api_key {
            request = request.header(AUTHORIZATION, format!("Bearer {}", key.expose_secret()));
        }
        request
            .send()
            .await
            .map_err(|error| CompatError::UpstreamTransport(error.to_string()))
    }
}

struct ErrorParts {
    status: StatusCode,
    content_type: String,
    content_encoding: String,
    body: Bytes,
}

async fn read_error_parts(response: reqwest::Response) -> ErrorParts {
    let status = response.status();
    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };
    let content_type = header("content-type");
    let content_encoding = header("content-encoding");
    let body = response.bytes().await.unwrap_or_default();
    ErrorParts {
        status,
        content_type,
        content_encoding,
        body,
    }
}

/// True when the upstream's 400 complains about its own JSON parse; the
/// request is then worth retrying with fewer fields.
pub(crate) fn should_retry_invalid_json(status: StatusCode, body: &[u8]) -> bool {
    if status != StatusCode::BAD_REQUEST {
        return false;
    }
    let text = String::from_utf8_lossy(body);
    let msg = text.trim().to_lowercase();
    if msg.is_empty() {
        return false;
    }
    if msg.contains("invalid json") {
        return true;
    }
    let Ok(decoded) = serde_json::from_slice::<Value>(body) else {
        return false;
    };
    decoded
        .get("error")
        .and_then(Value::as_object)
        .map(|e| str_field(e, "message").to_lowercase().contains("invalid json"))
        .unwrap_or(false)
}

/// Drops tools, tool_choice, and sampling parameters.
pub(crate) fn minimal_chat_request(chat_req: &Map<String, Value>) -> Value {
    json!({
        "model": chat_req.get("model").cloned().unwrap_or(Value::Null),
        "messages": chat_req.get("messages").cloned().unwrap_or(Value::Null),
        "stream": chat_req.get("stream").cloned().unwrap_or(Value::Null),
    })
}

/// Keeps only the most recent user or system message, flattened to text.
pub(crate) fn ultra_minimal_chat_request(chat_req: &Map<String, Value>) -> Value {
    let mut content = String::new();
    if let Some(messages) = chat_req.get("messages").and_then(Value::as_array) {
        for message in messages.iter().rev() {
            let Some(m) = message.as_object() else { continue };
            let role = str_field(m, "role");
            if role != "user" && role != "system" {
                continue;
            }
            let text = normalize_content(m.get("content").unwrap_or(&Value::Null));
            if !text.is_empty() {
                content = text;
                break;
            }
        }
    }
    json!({
        "model": chat_req.get("model").cloned().unwrap_or(Value::Null),
        "messages": [{"role": "user", "content": content}],
        "stream": chat_req.get("stream").cloned().unwrap_or(Value::Null),
    })
}

pub(crate) struct ResponsesChatExecutor {
    pub upstream: UpstreamClient,
}

impl ResponsesChatExecutor {
    fn log_error_parts(&self, stage: &str, parts: &ErrorParts) {
        self.upstream.logger.log(format!(
            "upstream error on {stage} status={} content_type={:?} content_encoding={:?} body={}",
            parts.status.as_u16(),
            parts.content_type,
            parts.content_encoding,
            truncate_for_log(&String::from_utf8_lossy(&parts.body), LOG_PREVIEW_BYTES),
        ));
    }
}

#[async_trait]
impl ChatExecutor for ResponsesChatExecutor {
    async fn execute(&self, chat_req: &Map<String, Value>) -> Result<UpstreamOutcome> {
        let logger = &self.upstream.logger;

        let response = self
            .upstream
            .post_chat_completions(&Value::Object(chat_req.clone()))
            .await?;
        logger.log(format!(
            "upstream status={} on initial mapped request",
            response.status().as_u16()
        ));
        if response.status().as_u16() < 400 {
            return Ok(UpstreamOutcome::Success(response));
        }

        logger.warn(&format!("upstream returned status {}", response.status().as_u16()));
        let parts = read_error_parts(response).await;
        self.log_error_parts("initial mapped request", &parts);
        if !should_retry_invalid_json(parts.status, &parts.body) {
            return Ok(UpstreamOutcome::ErrorStatus {
                status: parts.status,
                body: parts.body,
            });
        }

        logger.log(format!(
            "retrying with minimal chat request due to status={} body={:?}",
            parts.status.as_u16(),
            truncate_for_log(&String::from_utf8_lossy(&parts.body), 240),
        ));
        let minimal = minimal_chat_request(chat_req);
        logger.log(format!("mapped chat request(minimal)={}", json_for_log(&minimal)));
        let response = self.upstream.post_chat_completions(&minimal).await.map_err(|e| {
            logger.log(format!("upstream minimal retry failed: {e}"));
            e
        })?;
        logger.log(format!(
            "upstream status={} on minimal retry",
            response.status().as_u16()
        ));
        if response.status().as_u16() < 400 {
            return Ok(UpstreamOutcome::Success(response));
        }

        let parts = read_error_parts(response).await;
        self.log_error_parts("minimal retry", &parts);
        if !should_retry_invalid_json(parts.status, &parts.body) {
            return Ok(UpstreamOutcome::ErrorStatus {
                status: parts.status,
                body: parts.body,
            });
        }

        logger.log(format!(
            "retrying with ultra-minimal chat request due to status={} body={:?}",
            parts.status.as_u16(),
            truncate_for_log(&String::from_utf8_lossy(&parts.body), 240),
        ));
        let ultra = ultra_minimal_chat_request(chat_req);
        logger.log(format!("mapped chat request(ultra-minimal)={}", json_for_log(&ultra)));
        let response = self.upstream.post_chat_completions(&ultra).await.map_err(|e| {
            logger.log(format!("upstream ultra-minimal retry failed: {e}"));
            e
        })?;
        logger.log(format!(
            "upstream status={} on ultra-minimal retry",
            response.status().as_u16()
        ));
        if response.status().as_u16() >= 400 {
            let parts = read_error_parts(response).await;
            self.log_error_parts("ultra-minimal retry", &parts);
            return Ok(UpstreamOutcome::ErrorStatus {
                status: parts.status,
                body: parts.body,
            });
        }
        Ok(UpstreamOutcome::Success(response))
    }
}

/// Some clients lower-case model ids while some gateways are case-sensitive.
/// Produces the uppercased variant to retry with, or `None` when retrying
/// cannot help (mixed-case input was deliberate).
pub(crate) fn retry_unknown_model_variant(model: &str) -> Option<String> {
    let m = model.trim();
    if m.is_empty() {
        return None;
    }
    if m.to_lowercase() != m {
        return None;
    }
    if let Some(idx) = m.find('/') {
        if idx > 0 && idx < m.len() - 1 {
            return Some(format!("{}{}", &m[..=idx], m[idx + 1..].to_uppercase()));
        }
    }
    Some(m.to_uppercase())
}

pub(crate) struct AnthropicChatExecutor {
    pub upstream: UpstreamClient,
}

#[async_trait]
impl ChatExecutor for AnthropicChatExecutor {
    async fn execute(&self, chat_req: &Map<String, Value>) -> Result<UpstreamOutcome> {
        let response = self
            .upstream
            .post_chat_completions(&Value::Object(chat_req.clone()))
            .await?;
        if response.status().as_u16() < 400 {
            return Ok(UpstreamOutcome::Success(response));
        }

        let status = response.status();
        let body = response.bytes().await.unwrap_or_default();
        let model = str_field(chat_req, "model");
        let lower_body = String::from_utf8_lossy(&body).to_lowercase();
        if model.is_empty() || !lower_body.contains("unknown model") {
            return Ok(UpstreamOutcome::ErrorStatus { status, body });
        }
        let Some(retry_model) = retry_unknown_model_variant(model) else {
            return Ok(UpstreamOutcome::ErrorStatus { status, body });
        };
        if retry_model == model {
            return Ok(UpstreamOutcome::ErrorStatus { status, body });
        }

        self.upstream.logger.log(format!(
            "unknown model from upstream, retrying with variant original={model:?} retry={retry_model:?}"
        ));
        let mut retry_req = chat_req.clone();
        retry_req.insert("model".into(), Value::String(retry_model));
        let response = self
            .upstream
            .post_chat_completions(&Value::Object(retry_req))
            .await?;
        if response.status().as_u16() < 400 {
            Ok(UpstreamOutcome::Success(response))
        } else {
            let status = response.status();
            let body = response.bytes().await.unwrap_or_default();
            Ok(UpstreamOutcome::ErrorStatus { status, body })
        }
    }
}
