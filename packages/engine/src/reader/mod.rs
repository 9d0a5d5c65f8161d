// packages/engine/src/reader/mod.rs
//! Log reading
//!
//! A [`LogReader`] consumes a frame stream (a file, possibly still being
//! written, or any async byte stream) on a background task and feeds every
//! frame to a [`TreeAssembler`](crate::tree::TreeAssembler).
//!
//! ```text
//! Source ──read──▶ FrameCodec ──Frame──▶ TreeAssembler ──▶ Index
//!    │                                        │
//!    └──────────── PayloadStore ◀── CallRecord views
//! ```

pub mod log_reader;
pub mod payload;

pub use log_reader::LogReader;
pub use payload::{load_record, FilePayloadStore, MemoryPayloadStore, MmapPayloadStore, PayloadStore};

use crate::utils::errors::{EngineError, Result};
use serde::Deserialize;
use std::time::Duration;

/// Reader configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Keep tailing the source after reaching its current end
    pub follow: bool,

    /// Wait between reads that returned no data (milliseconds)
    pub poll_interval_ms: u64,

    /// Polls a partial frame may stay incomplete before it counts as truncated
    pub tail_retries: u32,

    /// Bytes requested per read
    pub read_buffer_size: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            follow: false,
            poll_interval_ms: 1000,
            tail_retries: 30,
            read_buffer_size: 64 * 1024,
        }
    }
}

impl ReaderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(EngineError::ConfigError(
                "reader.poll_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.read_buffer_size == 0 {
            return Err(EngineError::ConfigError(
                "reader.read_buffer_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Progress of the reader feeding an assembler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderStatus {
    Running,
    /// End of a finite source, or the reader was closed
    Finished,
    /// Stopped on a terminal error
    Failed(String),
}

impl ReaderStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ReaderStatus::Running)
    }
}
