//! Shared upstream HTTP client tuned for long-lived SSE streams.

use std::{sync::OnceLock, time::Duration};

use reqwest::Client;

/// Streaming-safe client: no request timeout (LLM streams run arbitrarily
/// long) and no transparent compression, which can surface truncated
/// upstream streams as decode failures before any chunk is parsed.
pub(crate) fn streaming_http_client() -> Client {
    static CLIENT: OnceLock<Client> = OnceLock::new();

    CLIENT
        .get_or_init(|| {
            Client::builder()
                .pool_idle_timeout(Some(Duration::from_secs(5)))
                .tcp_nodelay(true)
                .tcp_keepalive(Some(Duration::from_secs(60)))
                .build()
                .expect("failed to build streaming HTTP client")
        })
        .clone()
}
