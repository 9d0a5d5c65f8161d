// packages/engine/src/recording/sink.rs
//! Chunk sinks
//!
//! A sink receives flushed chunks together with the frames that must precede
//! them (recording metadata, pending type and method tables). Dropping a
//! batch returns its pages to the pool, so whoever persists the batch is the
//! page deallocator.

use crate::memory::PagedBuffer;
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info};

/// Frames ready to be appended to the log
#[derive(Debug)]
pub struct ChunkBatch {
    /// Complete frames that precede the chunk
    pub prelude: Bytes,

    /// The CallRecordChunk frame, still in pool pages
    pub chunk: PagedBuffer,
}

impl ChunkBatch {
    pub fn len(&self) -> usize {
        self.prelude.len() + self.chunk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.prelude)?;
        self.chunk.write_to(writer)
    }
}

/// Destination of recorded bytes
pub trait Sink: Send + Sync {
    /// Append one batch; frames must land whole and in submission order
    fn submit(&self, batch: ChunkBatch) -> Result<()>;

    /// Make everything submitted so far visible to readers
    fn flush(&self) -> Result<()>;
}

/// Appends to a log file
pub struct FileSink {
    writer: Mutex<BufWriter<File>>,
}

impl FileSink {
    /// Create (or truncate) the log file
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .map_err(|e| EngineError::StorageFailed(format!("Failed to create {:?}: {}", path, e)))?;
        info!("Recording to {:?}", path);
        Ok(Self::from_file(file))
    }

    /// Append to an existing log file
    pub fn append(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| EngineError::StorageFailed(format!("Failed to open {:?}: {}", path, e)))?;
        Ok(Self::from_file(file))
    }

    fn from_file(file: File) -> Self {
        Self {
            writer: Mutex::new(BufWriter::with_capacity(256 * 1024, file)),
        }
    }
}

impl Sink for FileSink {
    fn submit(&self, batch: ChunkBatch) -> Result<()> {
        let mut writer = self.writer.lock();
        batch
            .write_to(&mut *writer)
            .and_then(|_| writer.flush())
            .map_err(|e| EngineError::StorageFailed(format!("Failed to append chunk: {}", e)))
    }

    fn flush(&self) -> Result<()> {
        self.writer
            .lock()
            .flush()
            .map_err(|e| EngineError::StorageFailed(format!("Failed to flush log: {}", e)))
    }
}

/// Keeps the log in memory
#[derive(Default)]
pub struct MemorySink {
    bytes: Mutex<Vec<u8>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Sink for MemorySink {
    fn submit(&self, batch: ChunkBatch) -> Result<()> {
        let mut bytes = self.bytes.lock();
        batch.write_to(&mut *bytes)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

enum Command {
    Batch(ChunkBatch),
    Flush(Sender<()>),
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
    backpressure: AtomicU64,
}

/// Background sink statistics
#[derive(Debug, Clone)]
pub struct SinkStats {
    /// Batches handed to the sink
    pub submitted: u64,

    /// Batches the inner sink accepted
    pub written: u64,

    /// Batches the inner sink rejected
    pub failed: u64,

    /// Submissions that found the queue full and had to wait
    pub backpressure: u64,

    /// Batches waiting in the queue
    pub queued: usize,

    pub capacity: usize,
}

impl SinkStats {
    pub fn fill_percentage(&self) -> f64 {
        (self.queued as f64 / self.capacity as f64) * 100.0
    }
}

/// Persists batches on a dedicated worker thread
///
/// Application threads only pay for a channel send; pages go back to the
/// pool on the worker once the inner sink has written them.
pub struct BackgroundSink {
    sender: Option<Sender<Command>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
    capacity: usize,
}

impl BackgroundSink {
    pub fn new(inner: Arc<dyn Sink>, capacity: usize) -> Result<Self> {
        let (sender, receiver) = bounded(capacity);
        let counters = Arc::new(Counters::default());

        let worker_counters = Arc::clone(&counters);
        let worker = std::thread::Builder::new()
            .name("calltrace-sink".to_string())
            .spawn(move || Self::run(inner, receiver, worker_counters))
            .map_err(|e| EngineError::StorageFailed(format!("Failed to spawn sink worker: {}", e)))?;

        Ok(Self {
            sender: Some(sender),
            worker: Mutex::new(Some(worker)),
            counters,
            capacity,
        })
    }

    fn run(inner: Arc<dyn Sink>, receiver: Receiver<Command>, counters: Arc<Counters>) {
        debug!("Sink worker started");
        for command in receiver.iter() {
            match command {
                Command::Batch(batch) => match inner.submit(batch) {
                    Ok(()) => {
                        counters.written.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        error!("Failed to persist chunk: {}", e);
                    }
                },
                Command::Flush(ack) => {
                    if let Err(e) = inner.flush() {
                        error!("Failed to flush sink: {}", e);
                    }
                    let _ = ack.send(());
                }
            }
        }
        if let Err(e) = inner.flush() {
            error!("Failed to flush sink on shutdown: {}", e);
        }
        debug!("Sink worker stopped");
    }

    fn send(&self, command: Command) -> Result<()> {
        let sender = self.sender.as_ref().ok_or(EngineError::SinkClosed)?;
        match sender.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(command)) => {
                self.counters.backpressure.fetch_add(1, Ordering::Relaxed);
                sender.send(command).map_err(|_| EngineError::SinkClosed)
            }
            Err(TrySendError::Disconnected(_)) => Err(EngineError::SinkClosed),
        }
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            backpressure: self.counters.backpressure.load(Ordering::Relaxed),
            queued: self.sender.as_ref().map(Sender::len).unwrap_or(0),
            capacity: self.capacity,
        }
    }
}

impl Sink for BackgroundSink {
    fn submit(&self, batch: ChunkBatch) -> Result<()> {
        self.send(Command::Batch(batch))?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Wait until every batch submitted so far is persisted
    fn flush(&self) -> Result<()> {
        let (ack, done) = bounded(1);
        self.send(Command::Flush(ack))?;
        done.recv().map_err(|_| EngineError::SinkClosed)
    }
}

impl Drop for BackgroundSink {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("Sink worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PagePool;
    use crate::wire::binary::BinaryOutput;

    fn batch(pool: &Arc<PagePool>, prelude: &'static [u8], chunk: &[u8]) -> ChunkBatch {
        let mut buffer = PagedBuffer::new(Arc::clone(pool), 0);
        buffer.write_bytes(chunk);
        ChunkBatch {
            prelude: Bytes::from_static(prelude),
            chunk: buffer,
        }
    }

    #[test]
    fn test_memory_sink_keeps_order() {
        let pool = PagePool::new(64, 4).unwrap();
        let sink = MemorySink::new();
        sink.submit(batch(&pool, b"ab", b"cd")).unwrap();
        sink.submit(batch(&pool, b"", b"ef")).unwrap();

        assert_eq!(sink.contents(), b"abcdef".to_vec());
        assert_eq!(pool.stats().pages_in_use, 0);
    }

    #[test]
    fn test_file_sink_flushes_each_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.bin");
        let pool = PagePool::new(64, 4).unwrap();

        let sink = FileSink::create(&path).unwrap();
        sink.submit(batch(&pool, b"head", &[1u8; 100])).unwrap();

        // visible without an explicit flush
        assert_eq!(std::fs::read(&path).unwrap().len(), 104);
    }

    #[test]
    fn test_background_sink_drains_and_returns_pages() {
        let pool = PagePool::new(64, 16).unwrap();
        let memory = Arc::new(MemorySink::new());
        let sink = BackgroundSink::new(memory.clone(), 2).unwrap();

        for _ in 0..10 {
            sink.submit(batch(&pool, b"p", &[7u8; 70])).unwrap();
        }
        sink.flush().unwrap();

        let stats = sink.stats();
        assert_eq!(stats.submitted, 10);
        assert_eq!(stats.written, 10);
        assert_eq!(stats.failed, 0);
        assert_eq!(memory.len(), 10 * 71);
        assert_eq!(pool.stats().pages_in_use, 0);
    }

    #[test]
    fn test_background_sink_drop_persists_pending() {
        let pool = PagePool::new(64, 16).unwrap();
        let memory = Arc::new(MemorySink::new());
        {
            let sink = BackgroundSink::new(memory.clone(), 8).unwrap();
            sink.submit(batch(&pool, b"", b"tail")).unwrap();
        }
        assert_eq!(memory.contents(), b"tail".to_vec());
    }
}
