use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tether_core::{CacheControl, ContentBlock, Message, TetherError};

use crate::sse::SseEvent;

/// Tool definition sent to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

/// How the model may choose tools for this request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    Any,
    Named(String),
}

/// Caller-facing knobs; the request builder derives the wire-level limits
/// from these plus the model family.
#[derive(Debug, Clone)]
pub struct RequestParams {
    pub model: String,
    pub use_thinking: bool,
    pub use_cache: bool,
    pub cache_tools: bool,
    pub cache_system: bool,
    pub cache_messages: bool,
    pub tool_choice: ToolChoice,
}

/// A fully assembled outgoing request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub thinking_budget: Option<u32>,
    pub system: Vec<ContentBlock>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: ToolChoice,
    pub stream: bool,
}

/// Transport seam. One implementation talks HTTP; tests script turns.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Provider name for logging.
    fn name(&self) -> &str;

    /// Stream one response through `tx`. The cancellation token is consulted
    /// on every read; cancelling must abort within one read.
    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<SseEvent>,
        cancel: CancellationToken,
    ) -> Result<(), ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl From<ProviderError> for TetherError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Http(e) => TetherError::Transport {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                body: e.to_string(),
            },
            ProviderError::Api { status, message } => TetherError::Transport {
                status,
                body: message,
            },
            ProviderError::RateLimited { retry_after_ms } => {
                TetherError::RateLimited { retry_after_ms }
            }
            ProviderError::Parse(detail) => TetherError::Protocol(detail),
            ProviderError::Cancelled => TetherError::Cancelled,
        }
    }
}
