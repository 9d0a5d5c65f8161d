// packages/engine/src/wire/mod.rs
//! Wire format
//!
//! The log is a plain sequence of frames. Everything is little-endian.
//!
//! ```text
//! ProcessMetadata | (RecordingMetadata TypeTable? MethodTable? CallRecordChunk)*
//! ```
//!
//! Frames for different recordings interleave freely; a recording may span
//! any number of chunks.

pub mod binary;
pub mod chunk;
pub mod frame;
pub mod tables;

pub use binary::{BinaryOutput, ByteReader};
pub use chunk::{Chunk, RawEnter, RawExit, RawRecord};
pub use frame::{
    encode_frame, frames, Frame, FrameAddress, FrameCodec, FrameKind, FrameWriter, FRAME_HEADER_LEN,
    MAX_FRAME_PAYLOAD,
};
