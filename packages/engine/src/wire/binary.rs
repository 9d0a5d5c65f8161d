// packages/engine/src/wire/binary.rs
//! Little-endian primitive encoding
//!
//! [`BinaryOutput`] is implemented for every buffer the engine writes into
//! (plain vectors, paged buffers and `BytesMut`), so encoders are written once
//! against the trait. [`ByteReader`] is the checked counterpart used by
//! decoders: every read that would run past the end fails with
//! `DecodingFailed` instead of panicking.

use crate::memory::PagedBuffer;
use crate::utils::errors::{EngineError, Result};
use bytes::{BufMut, BytesMut};

/// Sink for encoded primitives
pub trait BinaryOutput {
    /// Append raw bytes
    fn write_bytes(&mut self, data: &[u8]);

    /// Number of bytes written so far
    fn position(&self) -> usize;

    fn write_u8(&mut self, value: u8) {
        self.write_bytes(&[value]);
    }

    fn write_bool(&mut self, value: bool) {
        self.write_u8(value as u8);
    }

    fn write_u32(&mut self, value: u32) {
        self.write_bytes(&value.to_le_bytes());
    }

    fn write_i32(&mut self, value: i32) {
        self.write_bytes(&value.to_le_bytes());
    }

    fn write_u64(&mut self, value: u64) {
        self.write_bytes(&value.to_le_bytes());
    }

    fn write_i64(&mut self, value: i64) {
        self.write_bytes(&value.to_le_bytes());
    }

    fn write_f64(&mut self, value: f64) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Length-prefixed UTF-8 string
    fn write_str(&mut self, value: &str) {
        self.write_blob(value.as_bytes());
    }

    /// Length-prefixed byte blob
    fn write_blob(&mut self, value: &[u8]) {
        self.write_u32(value.len() as u32);
        self.write_bytes(value);
    }
}

impl BinaryOutput for Vec<u8> {
    fn write_bytes(&mut self, data: &[u8]) {
        self.extend_from_slice(data);
    }

    fn position(&self) -> usize {
        self.len()
    }
}

impl BinaryOutput for BytesMut {
    fn write_bytes(&mut self, data: &[u8]) {
        self.put_slice(data);
    }

    fn position(&self) -> usize {
        self.len()
    }
}

impl BinaryOutput for PagedBuffer {
    fn write_bytes(&mut self, data: &[u8]) {
        self.append(data);
    }

    fn position(&self) -> usize {
        self.len()
    }
}

/// Checked cursor over an encoded byte slice
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Borrow the next `len` bytes
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(EngineError::DecodingFailed(format!(
                "Need {} bytes at position {}, only {} left",
                len,
                self.position,
                self.remaining()
            )));
        }
        let slice = &self.data[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(EngineError::DecodingFailed(format!("Invalid bool byte {}", other))),
        }
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.read_array()?))
    }

    /// Length-prefixed byte blob
    pub fn read_blob(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }

    /// Length-prefixed UTF-8 string
    pub fn read_str(&mut self) -> Result<String> {
        let raw = self.read_blob()?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| EngineError::DecodingFailed(format!("Invalid UTF-8 string: {}", e)))
    }
}
