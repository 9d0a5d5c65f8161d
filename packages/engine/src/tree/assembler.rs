// packages/engine/src/tree/assembler.rs
//! Turns flat enter / exit records into call trees
//!
//! Frames are applied one at a time. A CallRecordChunk is staged in memory
//! and written to the index in one [`Index::put_all`], so a frame is either
//! fully visible to tree consumers or not at all.
//!
//! Parent links come from a per-recording stack of open calls built purely
//! from arrival order: an enter becomes a child of the current top, an exit
//! pops it. Records of one recording always arrive in the order the owning
//! thread produced them, even when they span several chunks.

use crate::index::{CallState, Index, IndexKey};
use crate::model::{CallId, Method, ProcessMetadata, RecordingMetadata, Type};
use crate::objects::TypeResolver;
use crate::observability::{READER_DATA_LOSS, READER_FRAMES};
use crate::reader::{PayloadStore, ReaderStatus};
use crate::tree::recording::{Progress, Recording, RecordingState};
use crate::utils::errors::Result;
use crate::wire::chunk::{Chunk, RawEnter, RawExit, RawRecord};
use crate::wire::frame::{Frame, FrameKind};
use crate::wire::tables;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Types and methods announced by the log
#[derive(Debug, Default)]
pub struct Catalog {
    types: DashMap<u64, Arc<Type>>,
    methods: DashMap<u64, Method>,
}

impl Catalog {
    pub fn method(&self, id: u64) -> Option<Method> {
        self.methods.get(&id).map(|m| m.value().clone())
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }
}

impl TypeResolver for Catalog {
    fn resolve_type(&self, id: u64) -> Option<Arc<Type>> {
        self.types.get(&id).map(|t| Arc::clone(t.value()))
    }
}

/// State shared between the assembler and the views it hands out
pub(crate) struct Shared {
    pub(crate) index: Arc<dyn Index>,
    pub(crate) store: Arc<dyn PayloadStore>,
    pub(crate) catalog: Catalog,
    pub(crate) status: watch::Sender<ReaderStatus>,
    process: RwLock<Option<ProcessMetadata>>,
    recordings: DashMap<i32, Arc<RecordingState>>,
    frames: AtomicU64,
}

/// Frame consumer building [`Recording`]s
#[derive(Clone)]
pub struct TreeAssembler {
    shared: Arc<Shared>,
}

impl TreeAssembler {
    pub fn new(index: Arc<dyn Index>, store: Arc<dyn PayloadStore>) -> Self {
        let (status, _) = watch::channel(ReaderStatus::Running);
        Self {
            shared: Arc::new(Shared {
                index,
                store,
                catalog: Catalog::default(),
                status,
                process: RwLock::new(None),
                recordings: DashMap::new(),
                frames: AtomicU64::new(0),
            }),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.shared.catalog
    }

    pub fn process_metadata(&self) -> Option<ProcessMetadata> {
        self.shared.process.read().clone()
    }

    /// Recordings seen so far, by id
    pub fn recordings(&self) -> Vec<Recording> {
        let mut states: Vec<Arc<RecordingState>> = self
            .shared
            .recordings
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        states.sort_by_key(|state| state.id);
        states
            .into_iter()
            .map(|state| Recording::new(state, Arc::clone(&self.shared)))
            .collect()
    }

    pub fn recording(&self, id: i32) -> Option<Recording> {
        self.shared
            .recordings
            .get(&id)
            .map(|state| Recording::new(Arc::clone(state.value()), Arc::clone(&self.shared)))
    }

    /// Frames applied so far
    pub fn frame_count(&self) -> u64 {
        self.shared.frames.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> ReaderStatus {
        self.shared.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ReaderStatus> {
        self.shared.status.subscribe()
    }

    /// No more frames will arrive
    pub fn finish(&self) {
        self.shared.status.send_if_modified(|status| {
            if status.is_running() {
                *status = ReaderStatus::Finished;
                true
            } else {
                false
            }
        });
    }

    /// The source failed; waiters get `reason` as their error
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.shared.status.send_if_modified(|status| {
            if status.is_running() {
                *status = ReaderStatus::Failed(reason);
                true
            } else {
                false
            }
        });
    }

    /// Dispatch one frame by kind
    ///
    /// Undecodable content is logged and skipped; only index failures are
    /// returned, since they leave the tree unable to progress.
    pub fn apply_frame(&self, frame: &Frame) -> Result<()> {
        self.shared.frames.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(READER_FRAMES).increment(1);
        trace!("Frame {:?} at offset {} ({} bytes)", frame.kind, frame.offset, frame.payload.len());

        match frame.kind {
            FrameKind::ProcessMetadata => {
                match tables::decode_process_metadata(&frame.payload) {
                    Ok(metadata) => {
                        debug!("Log written by process {} ({})", metadata.pid, metadata.main_name);
                        *self.shared.process.write() = Some(metadata);
                    }
                    Err(e) => warn!("Skipping process metadata at offset {}: {}", frame.offset, e),
                }
                Ok(())
            }
            FrameKind::RecordingMetadata => {
                match tables::decode_recording_metadata(&frame.payload) {
                    Ok(metadata) => self.on_recording_metadata(metadata),
                    Err(e) => warn!("Skipping recording metadata at offset {}: {}", frame.offset, e),
                }
                Ok(())
            }
            FrameKind::TypeTable => {
                match tables::decode_type_table(&frame.payload) {
                    Ok(types) => {
                        for ty in types {
                            self.shared.catalog.types.insert(ty.id, Arc::new(ty));
                        }
                    }
                    Err(e) => warn!("Skipping type table at offset {}: {}", frame.offset, e),
                }
                Ok(())
            }
            FrameKind::MethodTable => {
                match tables::decode_method_table(&frame.payload) {
                    Ok(methods) => {
                        for method in methods {
                            self.shared.catalog.methods.insert(method.id, method);
                        }
                    }
                    Err(e) => warn!("Skipping method table at offset {}: {}", frame.offset, e),
                }
                Ok(())
            }
            FrameKind::CallRecordChunk => match Chunk::decode(frame) {
                Ok(chunk) => self.on_chunk(&chunk),
                Err(e) => {
                    warn!("Skipping call record chunk at offset {}: {}", frame.offset, e);
                    metrics::counter!(READER_DATA_LOSS).increment(1);
                    Ok(())
                }
            },
            FrameKind::Unknown(tag) => {
                debug!("Skipping frame of unknown kind {} at offset {}", tag, frame.offset);
                Ok(())
            }
        }
    }

    fn recording_state(&self, id: i32) -> Arc<RecordingState> {
        let entry = self.shared.recordings.entry(id).or_insert_with(|| {
            debug!("New recording {}", id);
            Arc::new(RecordingState::new(id))
        });
        Arc::clone(entry.value())
    }

    fn on_recording_metadata(&self, metadata: RecordingMetadata) {
        let state = self.recording_state(metadata.id);
        let mut slot = state.metadata.write();
        match slot.as_mut() {
            Some(existing) => existing.merge(&metadata),
            None => *slot = Some(metadata),
        }
    }

    fn on_chunk(&self, chunk: &Chunk) -> Result<()> {
        let state = self.recording_state(chunk.recording_id);
        let mut progress = state.progress.lock();
        let mut staged = Staged {
            index: self.shared.index.as_ref(),
            recording_id: chunk.recording_id,
            states: HashMap::new(),
            data_loss: false,
        };
        let mut completed = false;

        for record in chunk.records() {
            match record {
                Ok(RawRecord::Enter(enter)) => staged.enter(&mut progress, &enter)?,
                Ok(RawRecord::Exit(exit)) => completed |= staged.exit(&mut progress, &exit)?,
                Err(e) => {
                    warn!("Skipping record of recording {}: {}", chunk.recording_id, e);
                    staged.data_loss = true;
                }
            }
        }

        let data_loss = staged.data_loss;
        let entries: Vec<(IndexKey, CallState)> = staged
            .states
            .into_iter()
            .map(|(call_id, call)| (IndexKey::new(chunk.recording_id, call_id), call))
            .collect();
        self.shared.index.put_all(&entries)?;
        drop(progress);

        trace!(
            "Applied {} records to recording {}",
            chunk.record_count,
            chunk.recording_id
        );
        if data_loss {
            state.mark_data_loss();
        }
        if completed {
            state.mark_complete();
        }
        Ok(())
    }
}

/// Call states touched by the chunk being applied
struct Staged<'a> {
    index: &'a dyn Index,
    recording_id: i32,
    states: HashMap<CallId, CallState>,
    data_loss: bool,
}

impl Staged<'_> {
    fn load(&mut self, call_id: CallId) -> Result<Option<&mut CallState>> {
        if !self.states.contains_key(&call_id) {
            match self.index.get(self.recording_id, call_id)? {
                Some(state) => {
                    self.states.insert(call_id, state);
                }
                None => return Ok(None),
            }
        }
        Ok(self.states.get_mut(&call_id))
    }

    fn enter(&mut self, progress: &mut Progress, enter: &RawEnter) -> Result<()> {
        let call_id = enter.call_id;
        if self.load(call_id)?.is_some() {
            warn!(
                "Duplicate enter of call {} in recording {} rejected",
                call_id, self.recording_id
            );
            return Ok(());
        }

        let expected = progress.last_call_id.next();
        if call_id != expected {
            warn!(
                "Call id gap in recording {}: expected {}, got {}",
                self.recording_id, expected, call_id
            );
            metrics::counter!(READER_DATA_LOSS).increment(1);
            self.data_loss = true;
        }
        progress.last_call_id = progress.last_call_id.max(call_id);

        let parent = progress.open_calls.last().copied();
        match parent {
            Some(parent_id) => match self.load(parent_id)? {
                Some(parent) => parent.child_call_ids.push(call_id),
                None => {
                    warn!(
                        "Open call {} of recording {} is missing from the index",
                        parent_id, self.recording_id
                    );
                    self.data_loss = true;
                }
            },
            None if !call_id.is_root() => {
                warn!(
                    "Call {} of recording {} entered with no open parent",
                    call_id, self.recording_id
                );
                metrics::counter!(READER_DATA_LOSS).increment(1);
                self.data_loss = true;
            }
            None => {}
        }

        self.states.insert(
            call_id,
            CallState::new(call_id, parent, enter.method_id, enter.address),
        );
        progress.open_calls.push(call_id);
        Ok(())
    }

    /// Returns whether the exit completed the recording
    fn exit(&mut self, progress: &mut Progress, exit: &RawExit) -> Result<bool> {
        let call_id = exit.call_id;
        let recording_id = self.recording_id;
        let Some(state) = self.load(call_id)? else {
            warn!("Exit of unknown call {} in recording {} ignored", call_id, recording_id);
            metrics::counter!(READER_DATA_LOSS).increment(1);
            self.data_loss = true;
            return Ok(false);
        };
        if state.has_exit {
            warn!("Duplicate exit of call {} in recording {} rejected", call_id, recording_id);
            return Ok(false);
        }
        state.has_exit = true;
        state.exit_offset = Some(exit.address);

        match progress.open_calls.iter().rposition(|open| *open == call_id) {
            Some(position) if position + 1 == progress.open_calls.len() => {
                progress.open_calls.pop();
            }
            Some(position) => {
                warn!(
                    "Call {} of recording {} exited while {} inner calls were open",
                    call_id,
                    recording_id,
                    progress.open_calls.len() - position - 1
                );
                progress.open_calls.remove(position);
            }
            None => {}
        }
        Ok(call_id.is_root())
    }
}
