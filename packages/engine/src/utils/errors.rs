// packages/engine/src/utils/errors.rs
//! Engine error type
//!
//! Every fallible operation in the engine returns [`Result`]. Errors coming
//! from foreign crates are mapped at the call site into one of the variants
//! below with a short description of what was being attempted.

use thiserror::Error;

/// Crate-wide error
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Recording failed: {0}")]
    RecordingFailed(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Corrupt frame at offset {offset}: {reason}")]
    CorruptFrame { offset: u64, reason: String },

    #[error("Truncated frame at offset {offset} did not complete")]
    TruncatedFrame { offset: u64 },

    #[error("Storage failed: {0}")]
    StorageFailed(String),

    #[error("Index operation failed: {0}")]
    IndexFailed(String),

    #[error("Reader failed: {0}")]
    ReaderFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Sink is closed")]
    SinkClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether this error ends a reader: structural corruption of the stream,
    /// or a failing source or index the tree cannot progress without
    pub fn is_fatal_to_reader(&self) -> bool {
        matches!(
            self,
            EngineError::CorruptFrame { .. }
                | EngineError::TruncatedFrame { .. }
                | EngineError::Io(_)
                | EngineError::ReaderFailed(_)
                | EngineError::IndexFailed(_)
        )
    }
}

/// Engine result alias
pub type Result<T> = std::result::Result<T, EngineError>;
