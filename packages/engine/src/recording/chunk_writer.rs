// packages/engine/src/recording/chunk_writer.rs
//! Accumulates one session's records into a CallRecordChunk frame
//!
//! The frame header and chunk header are written when the buffer is created;
//! records are appended as they happen and the lengths are patched when the
//! chunk is taken. Taking a chunk before the recording finishes immediately
//! opens a continuation buffer under the same recording id.

use crate::memory::{PagePool, PagedBuffer};
use crate::model::CallId;
use crate::utils::errors::Result;
use crate::wire::binary::BinaryOutput;
use crate::wire::chunk;
use crate::wire::frame::{close_frame, open_frame, FrameKind, FRAME_HEADER_LEN};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// When a chunk is flushed, whichever limit is hit first
#[derive(Debug, Clone, Copy)]
pub struct FlushLimits {
    pub max_bytes: usize,
    pub max_age: Duration,
    pub max_records: Option<u32>,
}

pub struct ChunkWriter {
    pool: Arc<PagePool>,
    spin_attempts: u32,
    limits: FlushLimits,
    recording_id: i32,
    buffer: PagedBuffer,
    frame_start: usize,
    record_count: u32,
    created: Instant,
    chunks_taken: u32,
}

impl ChunkWriter {
    pub fn new(pool: Arc<PagePool>, spin_attempts: u32, limits: FlushLimits, recording_id: i32) -> Self {
        let (buffer, frame_start) = Self::open_buffer(&pool, spin_attempts, recording_id);
        Self {
            pool,
            spin_attempts,
            limits,
            recording_id,
            buffer,
            frame_start,
            record_count: 0,
            created: Instant::now(),
            chunks_taken: 0,
        }
    }

    fn open_buffer(pool: &Arc<PagePool>, spin_attempts: u32, recording_id: i32) -> (PagedBuffer, usize) {
        let mut buffer = PagedBuffer::new(Arc::clone(pool), spin_attempts);
        let frame_start = open_frame(&mut buffer, FrameKind::CallRecordChunk);
        buffer.write_i32(recording_id);
        // record count, patched on take
        buffer.write_u32(0);
        (buffer, frame_start)
    }

    pub fn recording_id(&self) -> i32 {
        self.recording_id
    }

    /// Records in the current buffer
    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    /// Chunks taken so far
    pub fn chunks_taken(&self) -> u32 {
        self.chunks_taken
    }

    /// Bytes of the current buffer, headers included
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn write_enter(
        &mut self,
        call_id: CallId,
        method_id: u64,
        timestamp_nanos: Option<i64>,
        callee: &[u8],
        args: &[Vec<u8>],
    ) {
        chunk::write_enter(&mut self.buffer, call_id, method_id, timestamp_nanos, callee, args);
        self.record_count += 1;
    }

    pub fn write_exit(&mut self, call_id: CallId, thrown: bool, timestamp_nanos: Option<i64>, value: &[u8]) {
        chunk::write_exit(&mut self.buffer, call_id, thrown, timestamp_nanos, value);
        self.record_count += 1;
    }

    /// Whether the byte, record or age limit has been reached
    pub fn should_flush(&self) -> bool {
        if self.is_empty() {
            return false;
        }
        self.buffer.len() >= self.limits.max_bytes
            || self
                .limits
                .max_records
                .map_or(false, |max| self.record_count >= max)
            || self.is_stale()
    }

    /// Whether the age limit alone has been reached
    pub fn is_stale(&self) -> bool {
        !self.is_empty() && self.created.elapsed() >= self.limits.max_age
    }

    /// Finish the current chunk and start a continuation buffer
    pub fn take_chunk(&mut self) -> Result<PagedBuffer> {
        let (next, frame_start) = Self::open_buffer(&self.pool, self.spin_attempts, self.recording_id);
        let full = std::mem::replace(&mut self.buffer, next);
        let count = std::mem::replace(&mut self.record_count, 0);
        let start = std::mem::replace(&mut self.frame_start, frame_start);
        self.created = Instant::now();
        self.chunks_taken += 1;
        Self::seal(full, start, count)
    }

    /// Finish the last chunk of the recording
    pub fn finish(self) -> Result<PagedBuffer> {
        Self::seal(self.buffer, self.frame_start, self.record_count)
    }

    fn seal(mut buffer: PagedBuffer, frame_start: usize, record_count: u32) -> Result<PagedBuffer> {
        buffer.patch(frame_start + FRAME_HEADER_LEN + 4, &record_count.to_le_bytes());
        close_frame(&mut buffer, frame_start)?;
        Ok(buffer)
    }
}
