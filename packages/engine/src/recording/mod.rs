// packages/engine/src/recording/mod.rs
//! Call recording
//!
//! - **Recorder**: process-wide catalogs, page pool and sink
//! - **RecordingSession**: per-thread enter/exit recording state machine
//! - **ChunkWriter**: builds CallRecordChunk frames in pool pages
//! - **Sink**: file, memory and background-thread destinations
//! - **Policy**: decides where recordings may start
//!
//! # Architecture
//!
//! ```text
//! enter/exit → RecordingSession → ChunkWriter (pool pages)
//!                                      ↓ flush (bytes, records or age)
//!                         Recorder::submit_chunk (+ metadata, tables)
//!                                      ↓
//!                                    Sink → log file
//! ```

pub mod chunk_writer;
pub mod policy;
pub mod recorder;
pub mod session;
pub mod sink;

pub use chunk_writer::{ChunkWriter, FlushLimits};
pub use policy::{parse_policy, AlwaysEnabled, DelayBased, Disabled, Overridable, StartMethods, StartRecordingPolicy};
pub use recorder::{Recorder, RecorderConfig, RecorderStats};
pub use session::{CallOutcome, EnterOutcome, ExitOutcome, RecordingSession, SessionPhase, SkipReason};
pub use sink::{BackgroundSink, ChunkBatch, FileSink, MemorySink, Sink, SinkStats};
