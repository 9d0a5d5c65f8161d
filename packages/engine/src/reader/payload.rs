// packages/engine/src/reader/payload.rs
//! Random access to bytes already consumed by a reader
//!
//! The index keeps only stream offsets; call records read their enter and
//! exit bodies back through a [`PayloadStore`] when they are materialized.

use crate::utils::errors::{EngineError, Result};
use crate::wire::binary::ByteReader;
use crate::wire::chunk::{parse_record, RawRecord, RECORD_HEADER_LEN};
use bytes::Bytes;
use memmap2::{Mmap, MmapOptions};
use parking_lot::{Mutex, RwLock};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::debug;

/// Byte-addressed view of a log
pub trait PayloadStore: Send + Sync {
    /// `len` bytes starting at absolute stream offset `offset`
    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes>;
}

/// Read and parse the record whose tag byte is at `address`
pub fn load_record(store: &dyn PayloadStore, address: u64) -> Result<RawRecord> {
    let header = store.read_at(address, RECORD_HEADER_LEN)?;
    let mut reader = ByteReader::new(&header);
    reader.read_u8()?;
    let len = reader.read_u32()? as usize;
    let record = store.read_at(address, RECORD_HEADER_LEN + len)?;
    parse_record(&record, address)
}

fn unavailable(offset: u64, len: usize) -> EngineError {
    EngineError::StorageFailed(format!("Payload at offset {} ({} bytes) is not available", offset, len))
}

/// Keeps a copy of the whole stream, for sources that cannot be re-read
#[derive(Debug, Default)]
pub struct MemoryPayloadStore {
    bytes: RwLock<Vec<u8>>,
}

impl MemoryPayloadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, data: &[u8]) {
        self.bytes.write().extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.bytes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PayloadStore for MemoryPayloadStore {
    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        let bytes = self.bytes.read();
        let start = usize::try_from(offset).map_err(|_| unavailable(offset, len))?;
        let end = start.checked_add(len).ok_or_else(|| unavailable(offset, len))?;
        bytes
            .get(start..end)
            .map(Bytes::copy_from_slice)
            .ok_or_else(|| unavailable(offset, len))
    }
}

/// Reads back from a log file that may still be growing
pub struct FilePayloadStore {
    file: Mutex<File>,
}

impl FilePayloadStore {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| EngineError::StorageFailed(format!("Failed to open {:?}: {}", path, e)))?;
        Ok(Self { file: Mutex::new(file) })
    }
}

impl PayloadStore for FilePayloadStore {
    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).map_err(|e| {
            EngineError::StorageFailed(format!("Failed to read {} bytes at offset {}: {}", len, offset, e))
        })?;
        Ok(Bytes::from(buf))
    }
}

/// Memory-mapped view of a finished log file
pub struct MmapPayloadStore {
    mmap: Mmap,
}

impl MmapPayloadStore {
    /// Map the file as it is now; bytes appended later are not visible
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| EngineError::StorageFailed(format!("Failed to open {:?}: {}", path, e)))?;
        // SAFETY: the log is append-only; mapped bytes are never rewritten
        let mmap = unsafe {
            MmapOptions::new()
                .map(&file)
                .map_err(|e| EngineError::StorageFailed(format!("Failed to create memory map: {}", e)))?
        };
        debug!("Mapped {:?} ({} bytes)", path, mmap.len());
        Ok(Self { mmap })
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }
}

impl PayloadStore for MmapPayloadStore {
    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        let start = usize::try_from(offset).map_err(|_| unavailable(offset, len))?;
        let end = start.checked_add(len).ok_or_else(|| unavailable(offset, len))?;
        self.mmap
            .get(start..end)
            .map(Bytes::copy_from_slice)
            .ok_or_else(|| unavailable(offset, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CallId;
    use crate::wire::chunk::write_exit;
    use std::io::Write;

    fn exit_record() -> Vec<u8> {
        let mut out = Vec::new();
        write_exit(&mut out, CallId(3), true, Some(99), &[]);
        out
    }

    #[test]
    fn test_memory_store_bounds() {
        let store = MemoryPayloadStore::new();
        store.append(b"abcdef");
        assert_eq!(&store.read_at(2, 3).unwrap()[..], b"cde");
        assert!(store.read_at(4, 3).is_err());
        assert!(store.read_at(u64::MAX, 1).is_err());
    }

    #[test]
    fn test_load_record_from_each_store() {
        let mut bytes = b"prefix".to_vec();
        bytes.extend(exit_record());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.bin");
        std::fs::File::create(&path).unwrap().write_all(&bytes).unwrap();

        let memory = MemoryPayloadStore::new();
        memory.append(&bytes);
        let stores: Vec<Box<dyn PayloadStore>> = vec![
            Box::new(memory),
            Box::new(FilePayloadStore::open(&path).unwrap()),
            Box::new(MmapPayloadStore::open(&path).unwrap()),
        ];

        for store in &stores {
            match load_record(store.as_ref(), 6).unwrap() {
                RawRecord::Exit(exit) => {
                    assert_eq!(exit.call_id, CallId(3));
                    assert!(exit.thrown);
                    assert_eq!(exit.timestamp_nanos, Some(99));
                    assert_eq!(exit.address, 6);
                }
                other => panic!("expected exit, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_file_store_sees_appended_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.bin");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"one").unwrap();

        let store = FilePayloadStore::open(&path).unwrap();
        assert!(store.read_at(3, 3).is_err());
        file.write_all(b"two").unwrap();
        assert_eq!(&store.read_at(3, 3).unwrap()[..], b"two");
    }
}
