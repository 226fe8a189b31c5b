use thiserror::Error;

#[derive(Debug, Error)]
pub enum TetherError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transport error ({status}): {body}")]
    Transport { status: u16, body: String },

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Tool handler error ({tool}): {reason}")]
    Handler { tool: String, reason: String },

    #[error("Tool not permitted: {tool}")]
    Permission { tool: String },

    #[error("Tool pair expired: {tool_use_id}")]
    PairExpired { tool_use_id: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TetherError {
    /// Short error code string surfaced on the UI event bus.
    pub fn code(&self) -> &'static str {
        match self {
            TetherError::Config(_) => "CONFIG_ERROR",
            TetherError::Validation(_) => "VALIDATION_ERROR",
            TetherError::Transport { .. } => "TRANSPORT_ERROR",
            TetherError::RateLimited { .. } => "RATE_LIMITED",
            TetherError::Protocol(_) => "PROTOCOL_ERROR",
            TetherError::Handler { .. } => "HANDLER_ERROR",
            TetherError::Permission { .. } => "PERMISSION_DENIED",
            TetherError::PairExpired { .. } => "PAIR_EXPIRED",
            TetherError::Cancelled => "CANCELLED",
            TetherError::Database(_) => "DATABASE_ERROR",
            TetherError::Serialization(_) => "SERIALIZATION_ERROR",
            TetherError::Io(_) => "IO_ERROR",
            TetherError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, TetherError>;
