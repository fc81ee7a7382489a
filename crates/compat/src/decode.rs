//! Incoming request body decoding.
//!
//! Bodies arrive identity, gzip, or zstd encoded, capped at 8 MiB before and
//! after decompression. Some clients double-encode the payload (a JSON
//! string containing a JSON object), which is recovered here. The raw body
//! text is preserved for the diagnostic log on every path that read it.

use std::io::Read;

use futures::StreamExt;
use serde_json::{Map, Value};

/// Upper bound on the request body, raw and decompressed.
pub(crate) const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Truncation applied to body text before it reaches the log file.
pub(crate) const LOG_PREVIEW_BYTES: usize = 16 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum DecodeError {
    #[error("body exceeds {MAX_BODY_BYTES} bytes")]
    TooLarge,
    #[error("unsupported content-encoding: {0}")]
    UnsupportedEncoding(String),
    #[error("invalid {0} body")]
    InvalidCompression(&'static str),
    #[error("read body failed")]
    ReadFailed,
    #[error("empty body")]
    Empty,
    #[error("malformed object")]
    Malformed,
}

/// A decode failure still carries whatever raw text was recovered, so the
/// handler can log what the client actually sent.
#[derive(Debug)]
pub(crate) struct DecodeFailure {
    pub error: DecodeError,
    pub raw_preview: String,
}

impl DecodeFailure {
    fn bare(error: DecodeError) -> Self {
        Self {
            error,
            raw_preview: String::new(),
        }
    }
}

/// Reads the request body up to the cap. A chunk pushing the total past the
/// cap fails immediately instead of buffering the rest.
pub(crate) async fn read_body(body: axum::body::Body) -> Result<Vec<u8>, DecodeError> {
    let mut stream = body.into_data_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|_| DecodeError::ReadFailed)?;
        if buf.len() + chunk.len() > MAX_BODY_BYTES {
            return Err(DecodeError::TooLarge);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

/// Truncates `s` to at most `n` bytes for logging, marking the cut.
pub(crate) fn truncate_for_log(s: &str, n: usize) -> String {
    if n == 0 || s.len() <= n {
        return s.to_string();
    }
    let mut end = n;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Serializes a value for the log, truncated to the preview cap.
pub(crate) fn json_for_log(v: &Value) -> String {
    let text = serde_json::to_string(v).unwrap_or_else(|_| format!("{v:?}"));
    truncate_for_log(&text, LOG_PREVIEW_BYTES)
}

/// Decodes a request body into a JSON object plus its raw-text preview.
pub(crate) fn decode_json_body(
    content_encoding: Option<&str>,
    body: &[u8],
) -> Result<(Map<String, Value>, String), DecodeFailure> {
    let data = decompress(content_encoding, body)?;
    let trimmed = data.trim_ascii();
    if trimmed.is_empty() {
        return Err(DecodeFailure::bare(DecodeError::Empty));
    }
    let raw_preview = truncate_for_log(&String::from_utf8_lossy(trimmed), LOG_PREVIEW_BYTES);

    if let Ok(Value::Object(object)) = serde_json::from_slice::<Value>(trimmed) {
        return Ok((object, raw_preview));
    }

    // Double-encoded recovery: a JSON string whose content is the object.
    if let Ok(quoted) = serde_json::from_slice::<String>(trimmed) {
        if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(&quoted) {
            return Ok((object, raw_preview));
        }
    }

    Err(DecodeFailure {
        error: DecodeError::Malformed,
        raw_preview,
    })
}

fn decompress(content_encoding: Option<&str>, body: &[u8]) -> Result<Vec<u8>, DecodeFailure> {
    let encoding = content_encoding.unwrap_or("").trim().to_ascii_lowercase();
    match encoding.as_str() {
        "" | "identity" => {
            if body.len() > MAX_BODY_BYTES {
                return Err(DecodeFailure::bare(DecodeError::TooLarge));
            }
            Ok(body.to_vec())
        }
        "gzip" => read_capped(flate2::read::GzDecoder::new(body), "gzip"),
        "zstd" => {
            let decoder = zstd::stream::read::Decoder::new(body)
                .map_err(|_| DecodeFailure::bare(DecodeError::InvalidCompression("zstd")))?;
            read_capped(decoder, "zstd")
        }
        other => Err(DecodeFailure::bare(DecodeError::UnsupportedEncoding(
            other.to_string(),
        ))),
    }
}

fn read_capped(reader: impl Read, codec: &'static str) -> Result<Vec<u8>, DecodeFailure> {
    let mut decoded = Vec::new();
    let mut limited = reader.take(MAX_BODY_BYTES as u64 + 1);
    limited
        .read_to_end(&mut decoded)
        .map_err(|_| DecodeFailure::bare(DecodeError::InvalidCompression(codec)))?;
    if decoded.len() > MAX_BODY_BYTES {
        return Err(DecodeFailure::bare(DecodeError::TooLarge));
    }
    Ok(decoded)
}
