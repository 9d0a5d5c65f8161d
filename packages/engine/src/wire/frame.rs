// packages/engine/src/wire/frame.rs
//! Self-describing length-prefixed frames
//!
//! ```text
//! [kind: u32 LE][payload length: u32 LE][payload ...]
//! ```
//!
//! Writers open a frame inside a [`PagedBuffer`], append the payload and
//! patch the length on commit. Readers decode frames with [`FrameCodec`],
//! which returns `Ok(None)` while a frame is still incomplete so a live tail
//! can wait for more bytes. Unknown kinds decode fine and are skipped by the
//! consumer using the length header alone.

use crate::memory::{PageAddress, PagedBuffer};
use crate::utils::errors::{EngineError, Result};
use crate::wire::binary::BinaryOutput;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the frame header
pub const FRAME_HEADER_LEN: usize = 8;

/// Largest accepted payload; anything bigger is treated as corruption
pub const MAX_FRAME_PAYLOAD: usize = 1 << 30;

/// Frame kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    ProcessMetadata,
    RecordingMetadata,
    TypeTable,
    MethodTable,
    CallRecordChunk,
    /// A kind this reader does not know; skippable
    Unknown(u32),
}

impl FrameKind {
    pub fn tag(self) -> u32 {
        match self {
            FrameKind::ProcessMetadata => 1,
            FrameKind::RecordingMetadata => 2,
            FrameKind::TypeTable => 3,
            FrameKind::MethodTable => 4,
            FrameKind::CallRecordChunk => 5,
            FrameKind::Unknown(tag) => tag,
        }
    }

    /// Map a tag read from the wire; tag 0 is never valid
    pub fn from_tag(tag: u32) -> Option<Self> {
        let kind = match tag {
            0 => return None,
            1 => FrameKind::ProcessMetadata,
            2 => FrameKind::RecordingMetadata,
            3 => FrameKind::TypeTable,
            4 => FrameKind::MethodTable,
            5 => FrameKind::CallRecordChunk,
            other => FrameKind::Unknown(other),
        };
        Some(kind)
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,

    /// Absolute stream offset of the frame header
    pub offset: u64,

    pub payload: Bytes,
}

impl Frame {
    /// Absolute stream offset of the first payload byte
    pub fn payload_offset(&self) -> u64 {
        self.offset + FRAME_HEADER_LEN as u64
    }
}

/// Location of a committed frame inside a paged buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameAddress {
    /// Where the header starts
    pub start: PageAddress,

    /// Logical position of the header in the buffer
    pub position: usize,

    /// Payload length
    pub len: u32,
}

/// Write a frame header with a zero length placeholder; returns the header position
pub fn open_frame(buffer: &mut PagedBuffer, kind: FrameKind) -> usize {
    let start = buffer.len();
    buffer.write_u32(kind.tag());
    buffer.write_u32(0);
    start
}

/// Patch the length of a frame opened at `start`
pub fn close_frame(buffer: &mut PagedBuffer, start: usize) -> Result<FrameAddress> {
    let len = buffer.len() - start - FRAME_HEADER_LEN;
    if len > MAX_FRAME_PAYLOAD {
        return Err(EngineError::EncodingFailed(format!(
            "Frame payload of {} bytes exceeds the {} byte limit",
            len, MAX_FRAME_PAYLOAD
        )));
    }
    buffer.patch(start + 4, &(len as u32).to_le_bytes());
    Ok(FrameAddress {
        start: buffer.address_of(start),
        position: start,
        len: len as u32,
    })
}

/// Read a committed frame back by its address without scanning
pub fn read_frame(buffer: &PagedBuffer, address: FrameAddress) -> Result<Frame> {
    let position = buffer.position_of(address.start);
    let header = buffer
        .read_at(position, FRAME_HEADER_LEN)
        .ok_or_else(|| EngineError::DecodingFailed(format!("No frame at position {}", position)))?;
    let (kind, len) = parse_header(&header, position as u64)?;
    let payload = buffer
        .read_at(position + FRAME_HEADER_LEN, len)
        .ok_or(EngineError::TruncatedFrame { offset: position as u64 })?;
    Ok(Frame {
        kind,
        offset: position as u64,
        payload: Bytes::from(payload),
    })
}

/// Frame under construction inside a paged buffer
pub struct FrameWriter<'a> {
    buffer: &'a mut PagedBuffer,
    start: usize,
}

impl<'a> FrameWriter<'a> {
    pub fn begin(buffer: &'a mut PagedBuffer, kind: FrameKind) -> Self {
        let start = open_frame(buffer, kind);
        Self { buffer, start }
    }

    /// Finish the frame and return its address
    pub fn commit(self) -> Result<FrameAddress> {
        close_frame(self.buffer, self.start)
    }
}

impl BinaryOutput for FrameWriter<'_> {
    fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.append(data);
    }

    /// Position within the payload
    fn position(&self) -> usize {
        self.buffer.len() - self.start - FRAME_HEADER_LEN
    }
}

/// Append a complete frame to any output
pub fn encode_frame<O: BinaryOutput + ?Sized>(kind: FrameKind, payload: &[u8], out: &mut O) {
    out.write_u32(kind.tag());
    out.write_u32(payload.len() as u32);
    out.write_bytes(payload);
}

fn parse_header(header: &[u8], offset: u64) -> Result<(FrameKind, usize)> {
    let mut tag = [0u8; 4];
    tag.copy_from_slice(&header[0..4]);
    let mut len = [0u8; 4];
    len.copy_from_slice(&header[4..8]);

    let tag = u32::from_le_bytes(tag);
    let len = u32::from_le_bytes(len) as usize;

    let kind = FrameKind::from_tag(tag).ok_or_else(|| EngineError::CorruptFrame {
        offset,
        reason: format!("invalid frame kind {}", tag),
    })?;
    if len > MAX_FRAME_PAYLOAD {
        return Err(EngineError::CorruptFrame {
            offset,
            reason: format!("payload length {} exceeds limit", len),
        });
    }
    Ok((kind, len))
}

/// Streaming frame decoder
///
/// Tracks the absolute offset of everything consumed so decoded frames carry
/// their stream position.
#[derive(Debug, Default)]
pub struct FrameCodec {
    offset: u64,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start decoding at a known stream offset
    pub fn with_offset(offset: u64) -> Self {
        Self { offset }
    }

    /// Offset of the next frame to be decoded
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = EngineError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let (kind, len) = parse_header(&src[..FRAME_HEADER_LEN], self.offset)?;
        if src.len() < FRAME_HEADER_LEN + len {
            src.reserve(FRAME_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(len).freeze();
        let frame = Frame {
            kind,
            offset: self.offset,
            payload,
        };
        self.offset += (FRAME_HEADER_LEN + len) as u64;
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = EngineError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        if frame.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(EngineError::EncodingFailed(format!(
                "Frame payload of {} bytes exceeds the limit",
                frame.payload.len()
            )));
        }
        dst.reserve(FRAME_HEADER_LEN + frame.payload.len());
        dst.put_u32_le(frame.kind.tag());
        dst.put_u32_le(frame.payload.len() as u32);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

/// Finite iteration over the frames of a closed byte stream
///
/// A dangling partial frame at the end yields `TruncatedFrame` once.
pub fn frames(data: &[u8]) -> FrameIter {
    FrameIter {
        buffer: BytesMut::from(data),
        codec: FrameCodec::new(),
        done: false,
    }
}

pub struct FrameIter {
    buffer: BytesMut,
    codec: FrameCodec,
    done: bool,
}

impl Iterator for FrameIter {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.codec.decode(&mut self.buffer) {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                if self.buffer.is_empty() {
                    None
                } else {
                    Some(Err(EngineError::TruncatedFrame {
                        offset: self.codec.offset(),
                    }))
                }
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
