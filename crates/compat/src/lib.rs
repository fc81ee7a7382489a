//! Loopback compatibility adapters for coding-agent LLM protocols.
//!
//! A launching process that talks to a single OpenAI-compatible gateway can
//! spawn one of these ephemeral adapters, point a third-party agent binary
//! at its loopback base URL, and have the agent's native wire protocol
//! (OpenAI Responses or Anthropic Messages) translated to Chat Completions
//! on the way up and back into the native SSE dialect on the way down.
//!
//! Each adapter owns its listener, HTTP server, and rolling diagnostic log.
//! The embedding process is responsible for calling [`ResponsesAdapter::close`]
//! / [`AnthropicAdapter::close`] on every exit path; adapter lifetime is
//! bounded by the launch, and nothing persists beyond the log files.

mod anthropic;
mod chat;
mod decode;
mod error;
mod http_client;
mod logfile;
mod responses;
mod sse;
mod upstream;
mod usage;

use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use axum::Router;
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

pub use secrecy::SecretString;

use crate::{
    logfile::{ANTHROPIC_LOG_ENV, CompatLogger, RESPONSES_LOG_ENV, should_quiet_compat_stderr},
    upstream::{AnthropicChatExecutor, ResponsesChatExecutor, UpstreamClient},
};

/// Where translated Chat Completions requests are sent.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base URL of the OpenAI-compatible gateway; a trailing `/` is ignored.
    pub base_url: String,
    /// Bearer token added to upstream calls when present. Never logged.
    pub api_key: Option<SecretString>,
}

struct AdapterHandle {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

async fn spawn_server(router: Router) -> anyhow::Result<AdapterHandle> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .context("failed to bind loopback listener")?;
    let addr = listener.local_addr().context("listener has no local address")?;
    let (shutdown, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
    });
    Ok(AdapterHandle { addr, shutdown, task })
}

async fn shutdown_server(handle: AdapterHandle) {
    let AdapterHandle { shutdown, mut task, .. } = handle;
    let _ = shutdown.send(());
    // Drain in-flight handlers briefly; past the deadline the server task is
    // aborted and open streams drop with it.
    if tokio::time::timeout(Duration::from_secs(2), &mut task).await.is_err() {
        task.abort();
    }
}

/// Ephemeral loopback adapter translating OpenAI Responses calls into Chat
/// Completions. Serves POST `/v1/responses` only.
pub struct ResponsesAdapter {
    base_url: String,
    logger: Arc<CompatLogger>,
    handle: AdapterHandle,
}

impl ResponsesAdapter {
    /// Binds `127.0.0.1` on an OS-assigned port and starts serving.
    pub async fn start(upstream: UpstreamConfig) -> anyhow::Result<Self> {
        let quiet = should_quiet_compat_stderr();
        let logger = Arc::new(
            CompatLogger::open(RESPONSES_LOG_ENV, "responses-compat.log", "compat", quiet)
                .context("failed to open compat log")?,
        );
        let state = Arc::new(responses::ResponsesState {
            executor: ResponsesChatExecutor {
                upstream: UpstreamClient::new(&upstream.base_url, upstream.api_key, logger.clone()),
            },
            logger: logger.clone(),
        });
        let handle = spawn_server(responses::router(state)).await?;
        log::debug!("responses compat adapter listening on {}", handle.addr);
        Ok(Self {
            base_url: format!("http://{}/v1", handle.addr),
            logger,
            handle,
        })
    }

    /// Base URL to hand to the agent binary (includes the `/v1` prefix).
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Current path of the rolling diagnostic log.
    pub fn log_path(&self) -> &Path {
        self.logger.path()
    }

    /// Drains the server with a 2-second deadline and closes the log sink.
    pub async fn close(self) {
        shutdown_server(self.handle).await;
        self.logger.close();
    }
}

/// Ephemeral loopback adapter translating Anthropic Messages calls into
/// Chat Completions. Serves POST `/v1/messages` and `/messages`.
pub struct AnthropicAdapter {
    base_url: String,
    logger: Arc<CompatLogger>,
    handle: AdapterHandle,
}

impl AnthropicAdapter {
    /// Binds `127.0.0.1` on an OS-assigned port and starts serving. When
    /// `preferred_model` is set, every mapped chat request uses it in place
    /// of whatever model the agent asked for.
    pub async fn start(
        upstream: UpstreamConfig,
        preferred_model: Option<String>,
    ) -> anyhow::Result<Self> {
        let quiet = should_quiet_compat_stderr();
        let logger = Arc::new(
            CompatLogger::open(ANTHROPIC_LOG_ENV, "anthropic-compat.log", "anthropic-compat", quiet)
                .context("failed to open anthropic compat log")?,
        );
        let state = Arc::new(anthropic::AnthropicState {
            executor: AnthropicChatExecutor {
                upstream: UpstreamClient::new(&upstream.base_url, upstream.api_key, logger.clone()),
            },
            logger: logger.clone(),
            preferred_model: preferred_model
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty()),
        });
        let handle = spawn_server(anthropic::router(state)).await?;
        log::debug!("anthropic compat adapter listening on {}", handle.addr);
        Ok(Self {
            base_url: format!("http://{}", handle.addr),
            logger,
            handle,
        })
    }

    /// Base URL to hand to the agent binary (no path prefix).
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Current path of the rolling diagnostic log.
    pub fn log_path(&self) -> &Path {
        self.logger.path()
    }

    /// Drains the server with a 2-second deadline and closes the log sink.
    pub async fn close(self) {
        shutdown_server(self.handle).await;
        self.logger.close();
    }
}
