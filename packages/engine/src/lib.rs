// packages/engine/src/lib.rs
//! Calltrace Engine Library
//!
//! Records method call trees of running threads into a framed binary log
//! and rebuilds navigable call trees from that log, live or after the fact.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **memory**: Fixed page pool and paged byte buffers
//! - **wire**: Binary primitives, frames, call record chunks, tables
//! - **model**: Types, methods, metadata and call records
//! - **objects**: Value recording and decoding
//! - **recording**: Per-thread sessions, chunk writing and sinks
//! - **reader**: Tails a log and feeds frames to the tree assembler
//! - **index**: Call state storage (memory or SQLite)
//! - **tree**: Call tree reconstruction, navigation and export
//! - **observability**: Metrics, tracing, and logging
//! - **utils**: Configuration and errors

pub mod index;
pub mod memory;
pub mod model;
pub mod objects;
pub mod observability;
pub mod reader;
pub mod recording;
pub mod tree;
pub mod utils;
pub mod wire;

// Re-export commonly used types
pub use index::{Index, IndexBackend};
pub use model::{CallId, Method, ProcessMetadata, RecordingMetadata, Type, TypeTrait};
pub use objects::{HostObject, ObjectRecord, Value};
pub use reader::{LogReader, ReaderConfig, ReaderStatus};
pub use recording::{CallOutcome, EnterOutcome, ExitOutcome, Recorder, RecorderConfig, RecordingSession};
pub use tree::{CallRecord, ExportFormat, Recording, TreeAssembler, TreeExporter};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
