use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimerError {
    /// The timer was disposed; every call except `stop` is rejected.
    #[error("timer disposed")]
    Disposed,

    /// Zero-length intervals would complete on every scan.
    #[error("invalid interval: {0}")]
    InvalidInterval(String),
}

pub type Result<T> = std::result::Result<T, TimerError>;
