//! Incremental line scanner for upstream streaming bodies.
//!
//! Upstream streams are consumed line by line rather than as strict SSE:
//! besides `data:` frames, some gateways emit bare NDJSON (one JSON object
//! per line, no framing), which a conforming SSE parser would discard.

/// Maximum accepted line length. A line that grows past this without a
/// newline aborts the scan, mirroring a bounded scanner buffer.
pub(crate) const MAX_LINE_BYTES: usize = 2 * 1024 * 1024;

/// Classification of a scanned (trimmed, non-empty) line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StreamLine {
    /// Payload of a `data:` frame, whitespace-trimmed. May be `[DONE]`.
    Data(String),
    /// A bare JSON object line emitted without SSE framing.
    RawJson(String),
}

#[derive(Debug, thiserror::Error)]
#[error("stream line exceeds {MAX_LINE_BYTES} bytes")]
pub(crate) struct LineTooLong;

/// Splits an incoming byte stream into lines across chunk boundaries.
#[derive(Debug, Default)]
pub(crate) struct LineScanner {
    buffer: Vec<u8>,
}

impl LineScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk, returning every complete line it closed. Lines are
    /// decoded lossily; CR before the newline is stripped.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<String>, LineTooLong> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                if self.buffer.last() == Some(&b'\r') {
                    self.buffer.pop();
                }
                lines.push(String::from_utf8_lossy(&self.buffer).into_owned());
                self.buffer.clear();
            } else {
                if self.buffer.len() >= MAX_LINE_BYTES {
                    return Err(LineTooLong);
                }
                self.buffer.push(byte);
            }
        }
        Ok(lines)
    }

    /// Returns the trailing unterminated line, if any. Call once at stream
    /// end; a final NDJSON object often arrives without a newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        Some(line)
    }
}

/// The downstream client dropped its connection; stream writers unwind
/// quietly since there is nobody left to tell.
#[derive(Debug)]
pub(crate) struct ClientGone;

/// Classifies one raw line. Empty lines, SSE comments, `event:` lines, and
/// anything else that is neither a `data:` frame nor a JSON object yield
/// `None` and are skipped.
pub(crate) fn classify_line(raw: &str) -> Option<StreamLine> {
    let line = raw.trim();
    if line.is_empty() {
        return None;
    }
    if let Some(payload) = line.strip_prefix("data:") {
        let payload = payload.trim();
        if payload.is_empty() {
            return None;
        }
        return Some(StreamLine::Data(payload.to_string()));
    }
    if line.starts_with('{') {
        return Some(StreamLine::RawJson(line.to_string()));
    }
    None
}
