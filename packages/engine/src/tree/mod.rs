// packages/engine/src/tree/mod.rs
//! Call tree reconstruction
//!
//! - **TreeAssembler**: applies frames to the index, tracks completeness
//! - **Recording** / **CallRecord**: snapshot views, payloads decoded on demand
//! - **TreeExporter**: JSON output

pub mod assembler;
pub mod export;
pub mod recording;

pub use assembler::{Catalog, TreeAssembler};
pub use export::{ExportFormat, ExportedCall, ExportedRecording, TreeExporter};
pub use recording::{CallRecord, Calls, Recording};
