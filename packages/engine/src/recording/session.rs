// packages/engine/src/recording/session.rs
//! Thread-scoped recording session
//!
//! ```text
//!            enter (policy allows)          root exit
//!   Idle ─────────────────────────▶ Active ───────────▶ Draining ──▶ Idle
//! ```
//!
//! A [`RecordingSession`] is created once per application thread through
//! [`Recorder::attach_thread`] and is not shared between threads. Its entry
//! points take `&self` and never fail: anything that goes wrong is logged and
//! reported as [`SkipReason`], so tracing can never disrupt the traced code.
//!
//! While an enter or exit is being recorded the session is borrowed; a nested
//! call on the same session (for example from a value being rendered) finds
//! it busy and is skipped as reentrant.

use crate::model::{CallId, Method, RecordingMetadata};
use crate::objects::{ObjectRecorderRegistry, Value};
use crate::observability::{CALLS_RECORDED, RECORDINGS_FINISHED, RECORDINGS_STARTED};
use crate::recording::chunk_writer::ChunkWriter;
use crate::recording::recorder::Recorder;
use crate::utils::errors::{EngineError, Result};
use std::cell::{Cell, RefCell};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Active,
    Draining,
}

/// Why an enter or exit was not recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No recording is active and none was started
    NotRecording,
    /// Recording is temporarily disabled on this thread
    Disabled,
    /// The session is busy recording another event on this thread
    Reentrant,
    /// The method id was never registered
    UnknownMethod,
    /// The exit does not match any call entered in this recording
    UnknownCall,
    /// Recording failed internally
    Failed,
}

/// Result of [`RecordingSession::on_method_enter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnterOutcome {
    Recorded(CallId),
    Skipped(SkipReason),
}

impl EnterOutcome {
    /// Raw value handed back to instrumentation when nothing was recorded
    pub const NOT_RECORDING: i64 = -1;

    pub fn call_id(self) -> Option<CallId> {
        match self {
            EnterOutcome::Recorded(call_id) => Some(call_id),
            EnterOutcome::Skipped(_) => None,
        }
    }

    /// Call id, or `-1` if the call is not recorded
    pub fn as_raw(self) -> i64 {
        match self {
            EnterOutcome::Recorded(call_id) => call_id.0 as i64,
            EnterOutcome::Skipped(_) => Self::NOT_RECORDING,
        }
    }
}

/// Result of [`RecordingSession::on_method_exit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Recorded,
    /// The root call exited and the recording was flushed
    Finished { recording_id: i32 },
    Skipped(SkipReason),
}

/// How an instrumented call ended
#[derive(Debug, Clone, Copy)]
pub enum CallOutcome<'a> {
    Returned(&'a Value),
    Thrown(&'a Value),
}

struct ActiveRecording {
    metadata: RecordingMetadata,
    next_call_id: CallId,
    writer: ChunkWriter,
}

struct SessionState {
    phase: SessionPhase,
    active: Option<ActiveRecording>,
    registry: ObjectRecorderRegistry,
    reported_degraded: u64,
    callee: Vec<u8>,
    args: Vec<Vec<u8>>,
    value: Vec<u8>,
}

/// Per-thread recording handle
pub struct RecordingSession {
    recorder: Arc<Recorder>,
    thread_id: u64,
    thread_name: String,
    disabled: Cell<bool>,
    state: RefCell<SessionState>,
}

impl RecordingSession {
    pub(crate) fn new(recorder: Arc<Recorder>, thread_id: u64, thread_name: String) -> Self {
        let registry = ObjectRecorderRegistry::new(recorder.config().max_collection_elements);
        Self {
            recorder,
            thread_id,
            thread_name,
            disabled: Cell::new(false),
            state: RefCell::new(SessionState {
                phase: SessionPhase::Idle,
                active: None,
                registry,
                reported_degraded: 0,
                callee: Vec::new(),
                args: Vec::new(),
                value: Vec::new(),
            }),
        }
    }

    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    /// Current phase; a session observed mid-event reports `Active`
    pub fn phase(&self) -> SessionPhase {
        self.state
            .try_borrow()
            .map(|state| state.phase)
            .unwrap_or(SessionPhase::Active)
    }

    pub fn current_recording_id(&self) -> Option<i32> {
        self.state
            .try_borrow()
            .ok()
            .and_then(|state| state.active.as_ref().map(|active| active.metadata.id))
    }

    /// Whether events on this thread are currently recorded
    pub fn is_recording(&self) -> bool {
        !self.disabled.get() && self.phase() == SessionPhase::Active
    }

    /// Suppress recording on this thread without ending the recording
    pub fn disable(&self) {
        self.disabled.set(true);
    }

    /// Resume exactly where [`disable`](Self::disable) left off
    pub fn enable(&self) {
        self.disabled.set(false);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.get()
    }

    /// Record a method entry
    ///
    /// Starts a recording if the session is idle and the start policy allows
    /// it; the first recorded call of a recording is always [`CallId::ROOT`].
    pub fn on_method_enter(&self, method_id: u64, callee: Option<&Value>, args: &[Value]) -> EnterOutcome {
        if self.disabled.get() {
            return EnterOutcome::Skipped(SkipReason::Disabled);
        }
        let Ok(mut state) = self.state.try_borrow_mut() else {
            return EnterOutcome::Skipped(SkipReason::Reentrant);
        };

        match self.enter(&mut state, method_id, callee, args) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Failed to record enter of method {}: {}", method_id, e);
                EnterOutcome::Skipped(SkipReason::Failed)
            }
        }
    }

    /// Record a method exit
    ///
    /// The exit of the root call finishes the recording: the last chunk is
    /// flushed with the completion time and the session returns to idle.
    pub fn on_method_exit(&self, call_id: CallId, outcome: CallOutcome<'_>) -> ExitOutcome {
        if self.disabled.get() {
            return ExitOutcome::Skipped(SkipReason::Disabled);
        }
        let Ok(mut state) = self.state.try_borrow_mut() else {
            return ExitOutcome::Skipped(SkipReason::Reentrant);
        };

        match self.exit(&mut state, call_id, outcome) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Failed to record exit of call {}: {}", call_id, e);
                ExitOutcome::Skipped(SkipReason::Failed)
            }
        }
    }

    /// Flush the current chunk if it exceeded its age limit
    ///
    /// Hosts call this from the owning thread when it may stay inside one
    /// long call for a while. Returns whether a chunk was flushed.
    pub fn flush_if_stale(&self) -> bool {
        let Ok(mut state) = self.state.try_borrow_mut() else {
            return false;
        };
        let SessionState { active, registry, .. } = &mut *state;
        match active {
            Some(active) if active.writer.is_stale() => {
                if let Err(e) = self.flush_partial(registry, active) {
                    warn!("Failed to flush stale chunk of recording {}: {}", active.metadata.id, e);
                }
                true
            }
            _ => false,
        }
    }

    fn enter(
        &self,
        state: &mut SessionState,
        method_id: u64,
        callee: Option<&Value>,
        args: &[Value],
    ) -> Result<EnterOutcome> {
        if state.phase == SessionPhase::Idle {
            let Some(method) = self.recorder.method(method_id) else {
                warn!("Enter of unregistered method {} ignored", method_id);
                return Ok(EnterOutcome::Skipped(SkipReason::UnknownMethod));
            };
            if !self.recorder.can_start_recording(&method) {
                return Ok(EnterOutcome::Skipped(SkipReason::NotRecording));
            }
            self.start(state, &method);
        }

        let SessionState {
            active,
            registry,
            callee: callee_buf,
            args: arg_bufs,
            ..
        } = &mut *state;
        let active = active
            .as_mut()
            .ok_or_else(|| EngineError::RecordingFailed("Active session without a recording".to_string()))?;

        callee_buf.clear();
        match callee {
            Some(value) => encode_value(registry, value, callee_buf),
            None => registry.encode_null(callee_buf),
        }
        if arg_bufs.len() < args.len() {
            arg_bufs.resize_with(args.len(), Vec::new);
        }
        for (buf, arg) in arg_bufs.iter_mut().zip(args) {
            buf.clear();
            encode_value(registry, arg, buf);
        }

        let call_id = active.next_call_id;
        active.next_call_id = call_id.next();
        active
            .writer
            .write_enter(call_id, method_id, self.timestamp(), callee_buf, &arg_bufs[..args.len()]);

        self.recorder.note_call_recorded();
        metrics::counter!(CALLS_RECORDED).increment(1);
        self.report_degraded(state);

        let SessionState { active, registry, .. } = &mut *state;
        if let Some(active) = active {
            if active.writer.should_flush() {
                if let Err(e) = self.flush_partial(registry, active) {
                    warn!("Failed to flush chunk of recording {}: {}", active.metadata.id, e);
                }
            }
        }
        Ok(EnterOutcome::Recorded(call_id))
    }

    fn exit(&self, state: &mut SessionState, call_id: CallId, outcome: CallOutcome<'_>) -> Result<ExitOutcome> {
        let SessionState {
            active: active_slot,
            registry,
            value: value_buf,
            ..
        } = &mut *state;
        let Some(active) = active_slot.as_mut() else {
            return Ok(ExitOutcome::Skipped(SkipReason::NotRecording));
        };
        if call_id.0 == 0 || call_id >= active.next_call_id {
            warn!(
                "Exit of call {} which was never entered in recording {}",
                call_id, active.metadata.id
            );
            return Ok(ExitOutcome::Skipped(SkipReason::UnknownCall));
        }

        let (value, thrown) = match outcome {
            CallOutcome::Returned(value) => (value, false),
            CallOutcome::Thrown(value) => (value, true),
        };
        value_buf.clear();
        encode_value(registry, value, value_buf);
        active.writer.write_exit(call_id, thrown, self.timestamp(), value_buf);

        if !call_id.is_root() {
            if active.writer.should_flush() {
                if let Err(e) = self.flush_partial(registry, active) {
                    warn!("Failed to flush chunk of recording {}: {}", active.metadata.id, e);
                }
            }
            self.report_degraded(state);
            return Ok(ExitOutcome::Recorded);
        }

        state.phase = SessionPhase::Draining;
        let finished = state.active.take();
        let recording_id = self.drain(state, finished);
        state.phase = SessionPhase::Idle;
        self.report_degraded(state);
        Ok(ExitOutcome::Finished { recording_id })
    }

    fn start(&self, state: &mut SessionState, method: &Method) {
        let recording_id = self.recorder.next_recording_id();
        let start_stack_trace = if self.recorder.config().capture_stack_traces {
            capture_stack_trace()
        } else {
            Vec::new()
        };

        state.active = Some(ActiveRecording {
            metadata: RecordingMetadata {
                id: recording_id,
                thread_id: self.thread_id,
                thread_name: self.thread_name.clone(),
                start_stack_trace,
                start_time_millis: chrono::Utc::now().timestamp_millis(),
                complete_time_millis: None,
            },
            next_call_id: CallId::ROOT,
            writer: self.recorder.chunk_writer(recording_id),
        });
        state.phase = SessionPhase::Active;

        self.recorder.note_recording_started();
        metrics::counter!(RECORDINGS_STARTED).increment(1);
        debug!(
            "Started recording {} on thread {} at method {}",
            recording_id, self.thread_name, method
        );
    }

    /// Final flush of a recording whose root call exited
    fn drain(&self, state: &mut SessionState, finished: Option<ActiveRecording>) -> i32 {
        let Some(ActiveRecording {
            metadata,
            next_call_id,
            writer,
        }) = finished
        else {
            return -1;
        };

        let metadata = metadata.with_complete_time(chrono::Utc::now().timestamp_millis());
        let submitted = writer
            .finish()
            .and_then(|chunk| {
                self.recorder
                    .submit_chunk(&metadata, state.registry.take_new_types(), chunk)
            });
        if let Err(e) = submitted {
            error!("Failed to flush final chunk of recording {}: {}", metadata.id, e);
        }

        self.recorder.note_recording_finished();
        metrics::counter!(RECORDINGS_FINISHED).increment(1);
        debug!(
            "Finished recording {} on thread {}, recorded {} calls",
            metadata.id,
            self.thread_name,
            next_call_id.0 - 1
        );
        metadata.id
    }

    fn flush_partial(&self, registry: &mut ObjectRecorderRegistry, active: &mut ActiveRecording) -> Result<()> {
        let chunk = active.writer.take_chunk()?;
        self.recorder
            .submit_chunk(&active.metadata, registry.take_new_types(), chunk)
    }

    fn report_degraded(&self, state: &mut SessionState) {
        let degraded = state.registry.degraded();
        if degraded > state.reported_degraded {
            self.recorder.note_values_degraded(degraded - state.reported_degraded);
            state.reported_degraded = degraded;
        }
    }

    fn timestamp(&self) -> Option<i64> {
        if self.recorder.config().timestamps_enabled {
            chrono::Utc::now().timestamp_nanos_opt()
        } else {
            None
        }
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let SessionState { active, registry, .. } = state;
        if let Some(active) = active {
            debug!(
                "Session of thread {} dropped while recording {} is unfinished",
                self.thread_name, active.metadata.id
            );
            if !active.writer.is_empty() {
                let flushed = active.writer.take_chunk().and_then(|chunk| {
                    self.recorder
                        .submit_chunk(&active.metadata, registry.take_new_types(), chunk)
                });
                if let Err(e) = flushed {
                    warn!("Failed to flush chunk of abandoned recording {}: {}", active.metadata.id, e);
                }
            }
        }
    }
}

fn encode_value(registry: &mut ObjectRecorderRegistry, value: &Value, out: &mut Vec<u8>) {
    if let Err(e) = registry.encode(value, out) {
        debug!("Value not recorded: {}", e);
        out.clear();
    }
}

/// Frames of the current stack, outermost engine frames removed
fn capture_stack_trace() -> Vec<String> {
    let trace = std::backtrace::Backtrace::force_capture().to_string();
    trace
        .lines()
        .filter_map(|line| {
            let (index, frame) = line.trim().split_once(": ")?;
            index.parse::<usize>().ok()?;
            Some(frame.to_string())
        })
        .filter(|frame| !frame.starts_with("std::backtrace") && !frame.starts_with("calltrace_engine::recording"))
        .collect()
}
