// packages/engine/src/recording/recorder.rs
//! Process-level recorder
//!
//! Owns everything sessions share: the page pool, the sink, the method and
//! type catalogs, the start policy and the recording id generator. Sessions
//! are created per thread with [`Recorder::attach_thread`] and never share
//! mutable state with each other; the only synchronization point is
//! [`Recorder::submit_chunk`], which keeps frames of different sessions in a
//! consistent order on the wire.

use crate::memory::{PagePool, PagedBuffer, PoolStats};
use crate::model::types::{BUILTIN_TYPES, FIRST_USER_TYPE_ID};
use crate::model::{Method, ProcessMetadata, RecordingMetadata, Type, TypeTrait};
use crate::observability::CHUNKS_FLUSHED;
use crate::recording::chunk_writer::{ChunkWriter, FlushLimits};
use crate::recording::policy::{parse_policy, Overridable, StartRecordingPolicy};
use crate::recording::session::RecordingSession;
use crate::recording::sink::{ChunkBatch, Sink};
use crate::utils::errors::{EngineError, Result};
use crate::wire::frame::{encode_frame, FrameKind};
use crate::wire::tables;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Recorder configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Size of one pool page in bytes
    pub page_size: usize,

    /// Number of pool pages (power of two)
    pub page_count: usize,

    /// Flush a chunk once it holds this many bytes
    pub chunk_max_bytes: usize,

    /// Flush a chunk once it is this old (milliseconds)
    pub chunk_max_age_ms: u64,

    /// Flush a chunk once it holds this many records
    pub chunk_max_records: Option<u32>,

    /// Record enter and exit timestamps
    pub timestamps_enabled: bool,

    /// Elements recorded from each collection or map
    pub max_collection_elements: usize,

    /// Pool allocation retries before growing with a heap page
    pub alloc_spin_attempts: u32,

    /// Capture the stack trace at which each recording starts
    pub capture_stack_traces: bool,

    /// `default`, `api` or `delay:<seconds>`
    pub start_policy: String,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            page_size: 64 * 1024,
            page_count: 256,
            chunk_max_bytes: 32 * 1024 * 1024,
            chunk_max_age_ms: 100,
            chunk_max_records: None,
            timestamps_enabled: false,
            max_collection_elements: 3,
            alloc_spin_attempts: 64,
            capture_stack_traces: true,
            start_policy: "default".to_string(),
        }
    }
}

impl RecorderConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.page_count.is_power_of_two() {
            return Err(EngineError::ConfigError(format!(
                "recorder.page_count must be a power of two, but was {}",
                self.page_count
            )));
        }
        if self.page_size < crate::memory::page_pool::MIN_PAGE_SIZE {
            return Err(EngineError::ConfigError(format!(
                "recorder.page_size must be at least 64 bytes, but was {}",
                self.page_size
            )));
        }
        if self.chunk_max_bytes == 0 || self.chunk_max_age_ms == 0 || self.chunk_max_records == Some(0) {
            return Err(EngineError::ConfigError("Chunk flush thresholds must be non-zero".to_string()));
        }
        parse_policy(&self.start_policy)?;
        Ok(())
    }

    pub fn flush_limits(&self) -> FlushLimits {
        FlushLimits {
            max_bytes: self.chunk_max_bytes,
            max_age: Duration::from_millis(self.chunk_max_age_ms),
            max_records: self.chunk_max_records,
        }
    }
}

/// Methods and types, plus what has not been written to the log yet
#[derive(Default)]
struct PendingTables {
    methods: Vec<Method>,
    types: Vec<Arc<Type>>,
    emitted_types: HashSet<u64>,
}

#[derive(Default)]
struct Counters {
    recordings_started: AtomicU64,
    recordings_finished: AtomicU64,
    calls_recorded: AtomicU64,
    chunks_flushed: AtomicU64,
    bytes_submitted: AtomicU64,
    values_degraded: AtomicU64,
}

/// Recorder statistics
#[derive(Debug, Clone, Default)]
pub struct RecorderStats {
    pub recordings_started: u64,
    pub recordings_finished: u64,
    pub calls_recorded: u64,
    pub chunks_flushed: u64,
    pub bytes_submitted: u64,
    pub values_degraded: u64,
    pub pool: Option<PoolStats>,
}

impl RecorderStats {
    pub fn avg_chunk_bytes(&self) -> u64 {
        if self.chunks_flushed == 0 {
            0
        } else {
            self.bytes_submitted / self.chunks_flushed
        }
    }
}

/// Process-wide recorder
pub struct Recorder {
    config: RecorderConfig,
    pool: Arc<PagePool>,
    sink: Arc<dyn Sink>,
    policy: Overridable,
    methods: DashMap<u64, Method>,
    types: DashMap<u64, Arc<Type>>,
    pending: Mutex<PendingTables>,
    next_method_id: AtomicU64,
    next_type_id: AtomicU64,
    next_recording_id: AtomicI32,
    next_thread_id: AtomicU64,
    counters: Counters,
}

impl Recorder {
    /// Create a recorder with the start policy named in the configuration
    pub fn new(config: RecorderConfig, sink: Arc<dyn Sink>) -> Result<Arc<Self>> {
        let policy = parse_policy(&config.start_policy)?;
        Self::build(config, sink, policy)
    }

    /// Create a recorder with a custom start policy
    pub fn with_policy(
        config: RecorderConfig,
        sink: Arc<dyn Sink>,
        policy: impl StartRecordingPolicy + 'static,
    ) -> Result<Arc<Self>> {
        Self::build(config, sink, Overridable::new(policy))
    }

    fn build(config: RecorderConfig, sink: Arc<dyn Sink>, policy: Overridable) -> Result<Arc<Self>> {
        config.validate()?;
        let pool = PagePool::new(config.page_size, config.page_count)?;

        let recorder = Arc::new(Self {
            config,
            pool,
            sink,
            policy,
            methods: DashMap::new(),
            types: DashMap::new(),
            pending: Mutex::new(PendingTables::default()),
            next_method_id: AtomicU64::new(1),
            next_type_id: AtomicU64::new(FIRST_USER_TYPE_ID),
            next_recording_id: AtomicI32::new(0),
            next_thread_id: AtomicU64::new(1),
            counters: Counters::default(),
        });

        for ty in BUILTIN_TYPES.all() {
            recorder.types.insert(ty.id, ty);
        }

        recorder.write_process_metadata(&ProcessMetadata::current())?;
        info!(
            "Recorder initialized ({} pages of {} bytes)",
            recorder.config.page_count, recorder.config.page_size
        );
        Ok(recorder)
    }

    fn write_process_metadata(&self, metadata: &ProcessMetadata) -> Result<()> {
        let mut payload = Vec::new();
        tables::encode_process_metadata(metadata, &mut payload);
        let mut prelude = BytesMut::new();
        encode_frame(FrameKind::ProcessMetadata, &payload, &mut prelude);

        self.sink.submit(ChunkBatch {
            prelude: prelude.freeze(),
            chunk: PagedBuffer::new(Arc::clone(&self.pool), 0),
        })
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<PagePool> {
        &self.pool
    }

    /// Switch recording on regardless of the configured policy
    pub fn enable_recording(&self) {
        self.policy.enable();
    }

    /// Switch recording off regardless of the configured policy
    pub fn disable_recording(&self) {
        self.policy.disable();
    }

    pub(crate) fn can_start_recording(&self, method: &Method) -> bool {
        self.policy.can_start_recording(method)
    }

    /// Register a method; ids are unique within the process
    pub fn register_method(
        &self,
        name: impl Into<String>,
        declaring_type: &Type,
        is_static: bool,
        is_constructor: bool,
        returns_something: bool,
    ) -> Method {
        let method = Method {
            id: self.next_method_id.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            declaring_type_id: declaring_type.id,
            is_static,
            is_constructor,
            returns_something,
        };
        debug!("Registered method {}", method);

        let mut pending = self.pending.lock();
        self.methods.insert(method.id, method.clone());
        pending.methods.push(method.clone());
        method
    }

    /// Register a type; ids are unique within the process
    pub fn register_type(
        &self,
        name: impl Into<String>,
        traits: impl IntoIterator<Item = TypeTrait>,
        super_type_names: impl IntoIterator<Item = String>,
    ) -> Arc<Type> {
        let id = self.next_type_id.fetch_add(1, Ordering::Relaxed);
        let ty = Arc::new(Type::new(id, name, traits, super_type_names));

        let mut pending = self.pending.lock();
        self.types.insert(id, Arc::clone(&ty));
        pending.emitted_types.insert(id);
        pending.types.push(Arc::clone(&ty));
        ty
    }

    pub fn method(&self, id: u64) -> Option<Method> {
        self.methods.get(&id).map(|m| m.value().clone())
    }

    pub fn type_by_id(&self, id: u64) -> Option<Arc<Type>> {
        self.types.get(&id).map(|t| Arc::clone(t.value()))
    }

    /// Create the session handle for a thread
    pub fn attach_thread(self: &Arc<Self>, thread_name: impl Into<String>) -> RecordingSession {
        let thread_id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        RecordingSession::new(Arc::clone(self), thread_id, thread_name.into())
    }

    /// Session handle named after the current OS thread
    pub fn session_for_current_thread(self: &Arc<Self>) -> RecordingSession {
        let current = std::thread::current();
        let name = current
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{:?}", current.id()));
        self.attach_thread(name)
    }

    pub(crate) fn next_recording_id(&self) -> i32 {
        self.next_recording_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn chunk_writer(&self, recording_id: i32) -> ChunkWriter {
        ChunkWriter::new(
            Arc::clone(&self.pool),
            self.config.alloc_spin_attempts,
            self.config.flush_limits(),
            recording_id,
        )
    }

    /// Hand a finished chunk to the sink, preceded by recording metadata and
    /// any type or method table entries not written yet
    pub(crate) fn submit_chunk(
        &self,
        metadata: &RecordingMetadata,
        new_types: Vec<Arc<Type>>,
        chunk: PagedBuffer,
    ) -> Result<()> {
        let mut pending = self.pending.lock();

        for ty in new_types {
            if pending.emitted_types.insert(ty.id) {
                pending.types.push(ty);
            }
        }

        let mut prelude = BytesMut::new();
        let mut payload = Vec::new();
        tables::encode_recording_metadata(metadata, &mut payload);
        encode_frame(FrameKind::RecordingMetadata, &payload, &mut prelude);

        if !pending.types.is_empty() {
            payload.clear();
            tables::encode_type_table(pending.types.iter().map(|t| t.as_ref()), &mut payload);
            encode_frame(FrameKind::TypeTable, &payload, &mut prelude);
        }
        if !pending.methods.is_empty() {
            payload.clear();
            tables::encode_method_table(pending.methods.iter(), &mut payload);
            encode_frame(FrameKind::MethodTable, &payload, &mut prelude);
        }

        let batch = ChunkBatch {
            prelude: Bytes::from(prelude),
            chunk,
        };
        let size = batch.len() as u64;

        // submit under the lock so tables always precede the chunks using them
        self.sink.submit(batch)?;
        pending.types.clear();
        pending.methods.clear();
        drop(pending);

        self.counters.chunks_flushed.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_submitted.fetch_add(size, Ordering::Relaxed);
        metrics::counter!(CHUNKS_FLUSHED).increment(1);
        debug!("Flushed chunk of recording {} ({} bytes)", metadata.id, size);
        Ok(())
    }

    pub(crate) fn note_recording_started(&self) {
        self.counters.recordings_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_recording_finished(&self) {
        self.counters.recordings_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_call_recorded(&self) {
        self.counters.calls_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_values_degraded(&self, count: u64) {
        self.counters.values_degraded.fetch_add(count, Ordering::Relaxed);
    }

    /// Make everything submitted so far visible to readers
    pub fn flush(&self) -> Result<()> {
        self.sink.flush()
    }

    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            recordings_started: self.counters.recordings_started.load(Ordering::Relaxed),
            recordings_finished: self.counters.recordings_finished.load(Ordering::Relaxed),
            calls_recorded: self.counters.calls_recorded.load(Ordering::Relaxed),
            chunks_flushed: self.counters.chunks_flushed.load(Ordering::Relaxed),
            bytes_submitted: self.counters.bytes_submitted.load(Ordering::Relaxed),
            values_degraded: self.counters.values_degraded.load(Ordering::Relaxed),
            pool: Some(self.pool.stats()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::sink::MemorySink;
    use crate::wire::frame::frames;

    fn small_config() -> RecorderConfig {
        RecorderConfig {
            page_size: 256,
            page_count: 16,
            ..Default::default()
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(RecorderConfig::default().validate().is_ok());
        let bad = RecorderConfig {
            page_count: 100,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(EngineError::ConfigError(_))));
        let bad = RecorderConfig {
            chunk_max_records: Some(0),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = RecorderConfig {
            start_policy: "whenever".into(),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_process_metadata_written_first() {
        let sink = Arc::new(MemorySink::new());
        let _recorder = Recorder::new(small_config(), sink.clone()).unwrap();

        let bytes = sink.contents();
        let frame = frames(&bytes).next().unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::ProcessMetadata);
        let metadata = tables::decode_process_metadata(&frame.payload).unwrap();
        assert_eq!(metadata.pid, std::process::id());
    }

    #[test]
    fn test_catalog_ids_are_unique() {
        let recorder = Recorder::new(small_config(), Arc::new(MemorySink::new())).unwrap();
        let a = recorder.register_type("app.A", [TypeTrait::ConcreteClass], []);
        let b = recorder.register_type("app.B", [TypeTrait::ConcreteClass], []);
        assert!(a.id >= FIRST_USER_TYPE_ID);
        assert_ne!(a.id, b.id);

        let m1 = recorder.register_method("run", &a, false, false, false);
        let m2 = recorder.register_method("run", &b, false, false, false);
        assert_ne!(m1.id, m2.id);
        assert_eq!(recorder.method(m2.id).unwrap().declaring_type_id, b.id);
        assert_eq!(recorder.type_by_id(BUILTIN_TYPES.string.id).unwrap().name, "string");
    }

    #[test]
    fn test_sessions_get_distinct_thread_ids() {
        let recorder = Recorder::new(small_config(), Arc::new(MemorySink::new())).unwrap();
        let named = std::thread::Builder::new()
            .name("worker-7".into())
            .spawn({
                let recorder = Arc::clone(&recorder);
                move || {
                    let session = recorder.session_for_current_thread();
                    (session.thread_id(), session.thread_name().to_string())
                }
            })
            .unwrap()
            .join()
            .unwrap();
        let main = recorder.attach_thread("main");

        assert_eq!(named.1, "worker-7");
        assert_ne!(named.0, main.thread_id());
    }

    #[test]
    fn test_recording_ids_start_at_zero() {
        let recorder = Recorder::new(small_config(), Arc::new(MemorySink::new())).unwrap();
        assert_eq!(recorder.next_recording_id(), 0);
        assert_eq!(recorder.next_recording_id(), 1);
    }

    #[test]
    fn test_tables_precede_chunk_once() {
        let sink = Arc::new(MemorySink::new());
        let recorder = Recorder::new(small_config(), sink.clone()).unwrap();
        let ty = recorder.register_type("app.A", [TypeTrait::ConcreteClass], []);
        recorder.register_method("run", &ty, true, false, false);

        let metadata = RecordingMetadata {
            id: 0,
            thread_id: 1,
            thread_name: "main".into(),
            start_stack_trace: vec![],
            start_time_millis: 0,
            complete_time_millis: None,
        };
        let writer = recorder.chunk_writer(0);
        recorder
            .submit_chunk(&metadata, vec![Arc::clone(&ty)], writer.finish().unwrap())
            .unwrap();
        let writer = recorder.chunk_writer(0);
        recorder.submit_chunk(&metadata, vec![], writer.finish().unwrap()).unwrap();

        let kinds: Vec<FrameKind> = frames(&sink.contents()).map(|f| f.unwrap().kind).collect();
        assert_eq!(
            kinds,
            vec![
                FrameKind::ProcessMetadata,
                FrameKind::RecordingMetadata,
                FrameKind::TypeTable,
                FrameKind::MethodTable,
                FrameKind::CallRecordChunk,
                FrameKind::RecordingMetadata,
                FrameKind::CallRecordChunk,
            ]
        );
        assert_eq!(recorder.stats().chunks_flushed, 2);
    }
}
