//! Error types for Rettelse.

use thiserror::Error;

/// Library-level error type for Rettelse operations.
#[derive(Error, Debug)]
pub enum RettelseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chunk {chunk_id} is locked by {held_by}")]
    LockConflict { chunk_id: i64, held_by: String },

    #[error("Chunk {chunk_id} is not locked by {user_id}")]
    LockNotHeld { chunk_id: i64, user_id: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("OpenAI API error: {0}")]
    OpenAI(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl RettelseError {
    /// Whether this error is an expected outcome of lock arbitration rather than a fault.
    pub fn is_lock_contention(&self) -> bool {
        matches!(
            self,
            RettelseError::LockConflict { .. } | RettelseError::LockNotHeld { .. }
        )
    }
}

/// Result type alias for Rettelse operations.
pub type Result<T> = std::result::Result<T, RettelseError>;
