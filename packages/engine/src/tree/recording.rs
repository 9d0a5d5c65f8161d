// packages/engine/src/tree/recording.rs
//! Read views over assembled recordings
//!
//! Views are snapshots: a [`CallRecord`] copies its call state out of the
//! index when created, so iterating children never races with the assembler
//! appending new ones. Enter and exit payloads are decoded lazily, once.

use crate::index::CallState;
use crate::model::{CallId, EnterRecord, ExitRecord, ExitValue, Method, RecordingMetadata};
use crate::objects::{ObjectRecord, TypeResolver};
use crate::observability::READER_DATA_LOSS;
use crate::reader::{load_record, ReaderStatus};
use crate::tree::assembler::Shared;
use crate::utils::errors::{EngineError, Result};
use crate::wire::chunk::RawRecord;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Arrival-order bookkeeping of one recording
#[derive(Debug)]
pub(crate) struct Progress {
    pub(crate) open_calls: Vec<CallId>,
    pub(crate) last_call_id: CallId,
}

pub(crate) struct RecordingState {
    pub(crate) id: i32,
    pub(crate) metadata: RwLock<Option<RecordingMetadata>>,
    pub(crate) progress: Mutex<Progress>,
    data_loss: AtomicBool,
    complete: watch::Sender<bool>,
}

impl RecordingState {
    pub(crate) fn new(id: i32) -> Self {
        let (complete, _) = watch::channel(false);
        Self {
            id,
            metadata: RwLock::new(None),
            progress: Mutex::new(Progress {
                open_calls: Vec::new(),
                last_call_id: CallId(0),
            }),
            data_loss: AtomicBool::new(false),
            complete,
        }
    }

    pub(crate) fn mark_data_loss(&self) {
        if !self.data_loss.swap(true, Ordering::Relaxed) {
            debug!("Recording {} has lost data", self.id);
        }
    }

    /// Completion never reverts
    pub(crate) fn mark_complete(&self) {
        self.complete.send_if_modified(|complete| {
            let changed = !*complete;
            *complete = true;
            changed
        });
    }
}

/// One recording, complete or still being written
#[derive(Clone)]
pub struct Recording {
    state: Arc<RecordingState>,
    shared: Arc<Shared>,
}

impl Recording {
    pub(crate) fn new(state: Arc<RecordingState>, shared: Arc<Shared>) -> Self {
        Self { state, shared }
    }

    pub fn id(&self) -> i32 {
        self.state.id
    }

    /// Latest metadata, if a metadata frame has been seen
    pub fn metadata(&self) -> Option<RecordingMetadata> {
        self.state.metadata.read().clone()
    }

    /// Whether the root call's exit has arrived
    pub fn is_complete(&self) -> bool {
        *self.state.complete.borrow()
    }

    /// Whether a call id gap, an unknown exit or an undecodable record was seen
    pub fn has_data_loss(&self) -> bool {
        self.state.data_loss.load(Ordering::Relaxed)
    }

    /// Calls stored so far
    pub fn call_count(&self) -> Result<usize> {
        self.shared.index.call_count(self.state.id)
    }

    /// Wait until the recording is complete, at most `timeout`
    ///
    /// Returns `Ok(false)` on timeout or when the reader finished without
    /// the root call exiting; the recording stays queryable as partial
    /// either way. A reader failure is returned as an error.
    pub async fn await_complete(&self, timeout: Duration) -> Result<bool> {
        let mut complete = self.state.complete.subscribe();
        let mut status = self.shared.status.subscribe();

        let wait = async {
            loop {
                if *complete.borrow_and_update() {
                    return Ok(true);
                }
                let current = status.borrow_and_update().clone();
                match current {
                    ReaderStatus::Failed(reason) => return Err(EngineError::ReaderFailed(reason)),
                    ReaderStatus::Finished => return Ok(*complete.borrow()),
                    ReaderStatus::Running => {}
                }
                tokio::select! {
                    changed = complete.changed() => {
                        if changed.is_err() {
                            return Ok(*complete.borrow());
                        }
                    }
                    changed = status.changed() => {
                        if changed.is_err() {
                            return Ok(*complete.borrow());
                        }
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Timed out waiting for recording {} to complete", self.state.id);
                Ok(false)
            }
        }
    }

    /// The root call, once its enter has arrived
    pub fn root(&self) -> Result<Option<CallRecord>> {
        Ok(self
            .shared
            .index
            .get(self.state.id, CallId::ROOT)?
            .map(|state| CallRecord::new(self.state.id, state, 0, Arc::clone(&self.shared))))
    }

    /// Any call of the recording
    pub fn call(&self, call_id: CallId) -> Result<Option<CallRecord>> {
        let Some(state) = self.shared.index.get(self.state.id, call_id)? else {
            return Ok(None);
        };

        let mut depth = 0;
        let mut parent = state.parent_call_id;
        while let Some(parent_id) = parent {
            depth += 1;
            parent = self
                .shared
                .index
                .get(self.state.id, parent_id)?
                .and_then(|p| p.parent_call_id);
        }
        Ok(Some(CallRecord::new(self.state.id, state, depth, Arc::clone(&self.shared))))
    }

    /// Every call reachable from the root, in pre-order
    pub fn calls(&self) -> Result<Calls> {
        Ok(Calls {
            stack: self.root()?.into_iter().collect(),
            pending: None,
        })
    }
}

impl fmt::Debug for Recording {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recording")
            .field("id", &self.state.id)
            .field("complete", &self.is_complete())
            .field("data_loss", &self.has_data_loss())
            .finish()
    }
}

/// Pre-order traversal of a recording
pub struct Calls {
    stack: Vec<CallRecord>,
    pending: Option<EngineError>,
}

impl Iterator for Calls {
    type Item = Result<CallRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending.take() {
            return Some(Err(e));
        }
        let call = self.stack.pop()?;
        match call.children() {
            Ok(children) => self.stack.extend(children.into_iter().rev()),
            Err(e) => self.pending = Some(e),
        }
        Some(Ok(call))
    }
}

/// One call of a recording
#[derive(Clone)]
pub struct CallRecord {
    recording_id: i32,
    state: CallState,
    depth: usize,
    shared: Arc<Shared>,
    enter: OnceCell<EnterRecord>,
    exit: OnceCell<ExitRecord>,
}

impl CallRecord {
    fn new(recording_id: i32, state: CallState, depth: usize, shared: Arc<Shared>) -> Self {
        Self {
            recording_id,
            state,
            depth,
            shared,
            enter: OnceCell::new(),
            exit: OnceCell::new(),
        }
    }

    pub fn recording_id(&self) -> i32 {
        self.recording_id
    }

    pub fn call_id(&self) -> CallId {
        self.state.call_id
    }

    pub fn parent_call_id(&self) -> Option<CallId> {
        self.state.parent_call_id
    }

    pub fn method_id(&self) -> u64 {
        self.state.method_id
    }

    /// Method from the log's method table
    pub fn method(&self) -> Option<Method> {
        self.shared.catalog.method(self.state.method_id)
    }

    /// `Type.method`, or the raw id when the method table lacks it
    pub fn method_name(&self) -> String {
        match self.method() {
            Some(method) => method.to_short_string(&self.shared.catalog.type_name(method.declaring_type_id)),
            None => format!("method#{}", self.state.method_id),
        }
    }

    /// Distance from the root
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Whether this call's own exit arrived; children are not considered
    pub fn is_fully_recorded(&self) -> bool {
        self.state.has_exit
    }

    pub fn child_count(&self) -> usize {
        self.state.child_call_ids.len()
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    fn enter_record(&self) -> Result<&EnterRecord> {
        self.enter.get_or_try_init(|| {
            match load_record(self.shared.store.as_ref(), self.state.payload_offset)? {
                RawRecord::Enter(raw) => Ok(raw.decode(self.recording_id, &self.shared.catalog)),
                RawRecord::Exit(_) => Err(EngineError::DecodingFailed(format!(
                    "Expected enter record of call {} at offset {}",
                    self.state.call_id, self.state.payload_offset
                ))),
            }
        })
    }

    fn exit_record(&self) -> Result<Option<&ExitRecord>> {
        let Some(offset) = self.state.exit_offset else {
            return Ok(None);
        };
        self.exit
            .get_or_try_init(|| match load_record(self.shared.store.as_ref(), offset)? {
                RawRecord::Exit(raw) => Ok(raw.decode(self.recording_id, &self.shared.catalog)),
                RawRecord::Enter(_) => Err(EngineError::DecodingFailed(format!(
                    "Expected exit record of call {} at offset {}",
                    self.state.call_id, offset
                ))),
            })
            .map(Some)
    }

    /// Receiver of the call; `Null` for static methods
    pub fn callee(&self) -> Result<ObjectRecord> {
        Ok(self.enter_record()?.callee.clone())
    }

    pub fn args(&self) -> Result<Vec<ObjectRecord>> {
        Ok(self.enter_record()?.args.clone())
    }

    /// How the call ended, if its exit arrived
    pub fn exit_value(&self) -> Result<Option<ExitValue>> {
        Ok(self.exit_record()?.map(|exit| exit.value.clone()))
    }

    /// Returned value; `None` while running or if the call threw
    pub fn return_value(&self) -> Result<Option<ObjectRecord>> {
        Ok(match self.exit_record()? {
            Some(ExitRecord {
                value: ExitValue::Returned(record),
                ..
            }) => Some(record.clone()),
            _ => None,
        })
    }

    /// Thrown error; `None` while running or if the call returned
    pub fn thrown(&self) -> Result<Option<ObjectRecord>> {
        Ok(match self.exit_record()? {
            Some(ExitRecord {
                value: ExitValue::Thrown(record),
                ..
            }) => Some(record.clone()),
            _ => None,
        })
    }

    pub fn has_thrown(&self) -> Result<bool> {
        Ok(self.exit_record()?.map_or(false, |exit| exit.value.is_thrown()))
    }

    pub fn enter_timestamp(&self) -> Result<Option<i64>> {
        Ok(self.enter_record()?.timestamp_nanos)
    }

    pub fn exit_timestamp(&self) -> Result<Option<i64>> {
        Ok(self.exit_record()?.and_then(|exit| exit.timestamp_nanos))
    }

    /// Children in call order, as currently indexed
    pub fn children(&self) -> Result<Vec<CallRecord>> {
        let mut children = Vec::with_capacity(self.state.child_call_ids.len());
        for &child_id in &self.state.child_call_ids {
            match self.shared.index.get(self.recording_id, child_id)? {
                Some(state) => children.push(CallRecord::new(
                    self.recording_id,
                    state,
                    self.depth + 1,
                    Arc::clone(&self.shared),
                )),
                None => {
                    warn!(
                        "Child {} of call {} in recording {} is missing from the index",
                        child_id, self.state.call_id, self.recording_id
                    );
                    metrics::counter!(READER_DATA_LOSS).increment(1);
                }
            }
        }
        Ok(children)
    }

    /// This call plus all its descendants
    pub fn subtree_size(&self) -> Result<usize> {
        let mut size = 0;
        let mut stack = vec![self.clone()];
        while let Some(call) = stack.pop() {
            size += 1;
            stack.extend(call.children()?);
        }
        Ok(size)
    }
}

impl fmt::Debug for CallRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRecord")
            .field("recording_id", &self.recording_id)
            .field("call_id", &self.state.call_id)
            .field("method_id", &self.state.method_id)
            .field("depth", &self.depth)
            .field("fully_recorded", &self.state.has_exit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::Value;
    use crate::tree::assembler::tests::{assemble, log_bytes, Event};
    use crate::tree::TreeAssembler;
    use crate::wire::frame::frames;

    fn nested() -> Vec<Event> {
        vec![
            Event::Enter(1, 1, vec![]),
            Event::Enter(2, 2, vec![Value::Int(4)]),
            Event::Enter(3, 3, vec![]),
            Event::Exit(3, Value::Bool(true)),
            Event::Exit(2, Value::Int(8)),
            Event::Enter(4, 2, vec![]),
            Event::Exit(4, Value::Null),
            Event::Exit(1, Value::Null),
        ]
    }

    #[test]
    fn test_call_lookup_and_depth() {
        let recording = assemble(&log_bytes(0, &nested(), 3)).recording(0).unwrap();
        let call = recording.call(CallId(3)).unwrap().unwrap();
        assert_eq!(call.depth(), 2);
        assert_eq!(call.parent_call_id(), Some(CallId(2)));
        assert_eq!(call.return_value().unwrap(), Some(ObjectRecord::Bool { value: true }));
        assert!(recording.call(CallId(40)).unwrap().is_none());

        let depths: Vec<usize> = recording.calls().unwrap().map(|c| c.unwrap().depth()).collect();
        assert_eq!(depths, vec![0, 1, 2, 1]);
    }

    #[test]
    fn test_subtree_sizes() {
        let recording = assemble(&log_bytes(0, &nested(), 100)).recording(0).unwrap();
        let root = recording.root().unwrap().unwrap();
        assert_eq!(root.subtree_size().unwrap(), 4);
        assert_eq!(recording.call(CallId(2)).unwrap().unwrap().subtree_size().unwrap(), 2);
        assert_eq!(root.child_count(), 2);
    }

    #[test]
    fn test_snapshot_is_stable_while_assembling() {
        let bytes = log_bytes(0, &nested(), 2);
        let all: Vec<_> = frames(&bytes).map(|f| f.unwrap()).collect();

        let store = Arc::new(crate::reader::MemoryPayloadStore::new());
        store.append(&bytes);
        let assembler = TreeAssembler::new(Arc::new(crate::index::InMemoryIndex::new()), store);

        // tables + first chunk: enter 1, enter 2
        for frame in &all[..3] {
            assembler.apply_frame(frame).unwrap();
        }
        let recording = assembler.recording(0).unwrap();
        let early_root = recording.root().unwrap().unwrap();
        assert_eq!(early_root.child_count(), 1);

        for frame in &all[3..] {
            assembler.apply_frame(frame).unwrap();
        }
        assert_eq!(early_root.child_count(), 1);
        assert_eq!(recording.root().unwrap().unwrap().child_count(), 2);
        assert!(recording.is_complete());
    }

    #[tokio::test]
    async fn test_await_complete_times_out_then_succeeds() {
        let bytes = log_bytes(0, &[Event::Enter(1, 1, vec![]), Event::Exit(1, Value::Null)], 1);
        let all: Vec<_> = frames(&bytes).map(|f| f.unwrap()).collect();
        let store = Arc::new(crate::reader::MemoryPayloadStore::new());
        store.append(&bytes);
        let assembler = TreeAssembler::new(Arc::new(crate::index::InMemoryIndex::new()), store);

        for frame in &all[..all.len() - 1] {
            assembler.apply_frame(frame).unwrap();
        }
        let recording = assembler.recording(0).unwrap();
        assert!(!recording.await_complete(Duration::from_millis(20)).await.unwrap());

        let waiter = {
            let recording = recording.clone();
            tokio::spawn(async move { recording.await_complete(Duration::from_secs(5)).await })
        };
        assembler.apply_frame(&all[all.len() - 1]).unwrap();
        assert!(waiter.await.unwrap().unwrap());
        assert!(recording.is_complete());
    }

    #[tokio::test]
    async fn test_await_complete_surfaces_reader_failure() {
        let bytes = log_bytes(0, &[Event::Enter(1, 1, vec![])], 10);
        let assembler = assemble(&bytes);
        let recording = assembler.recording(0).unwrap();
        // finished without the root exiting
        assert!(!recording.await_complete(Duration::from_secs(5)).await.unwrap());

        let store = Arc::new(crate::reader::MemoryPayloadStore::new());
        store.append(&bytes);
        let failing = TreeAssembler::new(Arc::new(crate::index::InMemoryIndex::new()), store);
        for frame in frames(&bytes) {
            failing.apply_frame(&frame.unwrap()).unwrap();
        }
        failing.fail("corrupt frame");
        let result = failing
            .recording(0)
            .unwrap()
            .await_complete(Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(EngineError::ReaderFailed(ref reason)) if reason == "corrupt frame"));
    }
}
