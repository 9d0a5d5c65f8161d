// packages/engine/src/reader/log_reader.rs
//! Background log reader
//!
//! One tokio task per source reads bytes, cuts them into frames with
//! [`FrameCodec`] and applies each frame to a [`TreeAssembler`] before
//! reading again. Cancellation is only observed while waiting for data, so
//! closing a reader never leaves a frame half applied.

use crate::index::Index;
use crate::model::ProcessMetadata;
use crate::reader::payload::{FilePayloadStore, MemoryPayloadStore, MmapPayloadStore, PayloadStore};
use crate::reader::{ReaderConfig, ReaderStatus};
use crate::tree::{Recording, TreeAssembler};
use crate::utils::errors::{EngineError, Result};
use crate::wire::frame::FrameCodec;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Reads one log and exposes the recordings found in it
pub struct LogReader {
    assembler: TreeAssembler,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LogReader {
    /// Read a log file
    ///
    /// Without `follow` the file is read up to its length at open time.
    /// With `follow` the reader keeps tailing it until closed.
    pub async fn open_file(path: &Path, config: ReaderConfig, index: Arc<dyn Index>) -> Result<Self> {
        config.validate()?;
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| EngineError::ReaderFailed(format!("Failed to open {:?}: {}", path, e)))?;

        if config.follow {
            info!("Following {:?}", path);
            let store = Arc::new(FilePayloadStore::open(path)?);
            return Ok(Self::spawn(file, config, index, store, None));
        }

        let len = file
            .metadata()
            .await
            .map_err(|e| EngineError::ReaderFailed(format!("Failed to stat {:?}: {}", path, e)))?
            .len();
        info!("Reading {:?} ({} bytes)", path, len);
        let store: Arc<dyn PayloadStore> = if len == 0 {
            Arc::new(FilePayloadStore::open(path)?)
        } else {
            Arc::new(MmapPayloadStore::open(path)?)
        };
        Ok(Self::spawn(file.take(len), config, index, store, None))
    }

    /// Read any byte stream; its bytes are kept in memory for payload access
    ///
    /// End of stream ends the reader regardless of `follow`.
    pub fn open_stream<R>(source: R, config: ReaderConfig, index: Arc<dyn Index>) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        config.validate()?;
        let config = ReaderConfig {
            follow: false,
            ..config
        };
        let store = Arc::new(MemoryPayloadStore::new());
        Ok(Self::spawn(source, config, index, store.clone(), Some(store)))
    }

    fn spawn<R>(
        source: R,
        config: ReaderConfig,
        index: Arc<dyn Index>,
        store: Arc<dyn PayloadStore>,
        copy: Option<Arc<MemoryPayloadStore>>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let assembler = TreeAssembler::new(index, store);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(source, config, assembler.clone(), copy, cancel.clone()));

        Self {
            assembler,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn assembler(&self) -> &TreeAssembler {
        &self.assembler
    }

    pub fn process_metadata(&self) -> Option<ProcessMetadata> {
        self.assembler.process_metadata()
    }

    /// Recordings seen so far, complete or not
    pub fn recordings(&self) -> Vec<Recording> {
        self.assembler.recordings()
    }

    pub fn recording(&self, id: i32) -> Option<Recording> {
        self.assembler.recording(id)
    }

    pub fn status(&self) -> ReaderStatus {
        self.assembler.status()
    }

    /// Wait for the reader to stop, at most `timeout`
    ///
    /// `Ok(true)` once the source is exhausted (or the reader was closed),
    /// `Ok(false)` on timeout, an error if the reader failed.
    pub async fn await_finished(&self, timeout: Duration) -> Result<bool> {
        let mut status = self.assembler.subscribe_status();
        let stopped = tokio::time::timeout(timeout, async {
            status
                .wait_for(|status| !status.is_running())
                .await
                .map(|status| status.clone())
        })
        .await;

        match stopped {
            Ok(Ok(ReaderStatus::Failed(reason))) => Err(EngineError::ReaderFailed(reason)),
            Ok(Ok(_)) => Ok(true),
            Ok(Err(_)) => Err(EngineError::ReaderFailed("Reader status channel closed".to_string())),
            Err(_) => Ok(false),
        }
    }

    /// Stop reading; recordings stay queryable
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Reader task ended abnormally: {}", e);
            }
        }
        self.assembler.finish();
    }
}

impl Drop for LogReader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run<R: AsyncRead + Unpin>(
    mut source: R,
    config: ReaderConfig,
    assembler: TreeAssembler,
    copy: Option<Arc<MemoryPayloadStore>>,
    cancel: CancellationToken,
) {
    match read_frames(&mut source, &config, &assembler, copy.as_deref(), &cancel).await {
        Ok(()) => {
            debug!("Reader finished after {} frames", assembler.frame_count());
            assembler.finish();
        }
        Err(e) => {
            error!("Reader stopped: {}", e);
            assembler.fail(e.to_string());
        }
    }
}

async fn read_frames<R: AsyncRead + Unpin>(
    source: &mut R,
    config: &ReaderConfig,
    assembler: &TreeAssembler,
    copy: Option<&MemoryPayloadStore>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut codec = FrameCodec::new();
    let mut buffer = BytesMut::with_capacity(config.read_buffer_size);
    let mut stalled_polls = 0u32;

    loop {
        while let Some(frame) = codec.decode(&mut buffer)? {
            if let Err(e) = assembler.apply_frame(&frame) {
                if e.is_fatal_to_reader() {
                    return Err(e);
                }
                warn!("Skipping frame at offset {}: {}", frame.offset, e);
            }
        }

        buffer.reserve(config.read_buffer_size);
        let before = buffer.len();
        let read = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Reader closed at offset {}", codec.offset());
                return Ok(());
            }
            read = source.read_buf(&mut buffer) => {
                read.map_err(|e| EngineError::ReaderFailed(format!("Failed to read source: {}", e)))?
            }
        };

        if read > 0 {
            if let Some(copy) = copy {
                copy.append(&buffer[before..]);
            }
            stalled_polls = 0;
            continue;
        }

        if !config.follow {
            if !buffer.is_empty() {
                warn!(
                    "Discarding {} bytes of incomplete frame at offset {}",
                    buffer.len(),
                    codec.offset()
                );
            }
            return Ok(());
        }

        if !buffer.is_empty() {
            stalled_polls += 1;
            if stalled_polls > config.tail_retries {
                return Err(EngineError::TruncatedFrame { offset: codec.offset() });
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Reader closed at offset {}", codec.offset());
                return Ok(());
            }
            _ = tokio::time::sleep(config.poll_interval()) => {}
        }
    }
}
