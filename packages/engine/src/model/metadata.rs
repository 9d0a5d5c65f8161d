// packages/engine/src/model/metadata.rs
//! Process and recording metadata

use serde::{Deserialize, Serialize};

/// Describes the recorded process; written once at the head of a log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessMetadata {
    pub pid: u32,
    pub main_name: String,
    pub args: Vec<String>,
    pub start_time_millis: i64,
}

impl ProcessMetadata {
    /// Metadata of the current process
    pub fn current() -> Self {
        let mut args = std::env::args();
        let main_name = args.next().unwrap_or_default();
        Self {
            pid: std::process::id(),
            main_name,
            args: args.collect(),
            start_time_millis: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Describes one recording session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingMetadata {
    pub id: i32,
    pub thread_id: u64,
    pub thread_name: String,
    pub start_stack_trace: Vec<String>,
    pub start_time_millis: i64,
    pub complete_time_millis: Option<i64>,
}

impl RecordingMetadata {
    pub fn is_complete(&self) -> bool {
        self.complete_time_millis.is_some()
    }

    pub fn with_complete_time(mut self, complete_time_millis: i64) -> Self {
        self.complete_time_millis = Some(complete_time_millis);
        self
    }

    /// Merge a later copy of the same recording's metadata
    ///
    /// The completion time is set at most once; later copies never clear it.
    pub fn merge(&mut self, newer: &RecordingMetadata) {
        if self.complete_time_millis.is_none() {
            self.complete_time_millis = newer.complete_time_millis;
        }
        if self.start_stack_trace.is_empty() {
            self.start_stack_trace = newer.start_stack_trace.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> RecordingMetadata {
        RecordingMetadata {
            id: 42,
            thread_id: 4343,
            thread_name: "Thread-1".to_string(),
            start_stack_trace: vec![],
            start_time_millis: 90,
            complete_time_millis: None,
        }
    }

    #[test]
    fn test_merge_sets_completion_once() {
        let mut current = metadata();
        current.merge(&metadata().with_complete_time(100));
        assert_eq!(current.complete_time_millis, Some(100));

        current.merge(&metadata().with_complete_time(200));
        assert_eq!(current.complete_time_millis, Some(100));

        current.merge(&metadata());
        assert!(current.is_complete());
    }

    #[test]
    fn test_current_process() {
        let process = ProcessMetadata::current();
        assert_eq!(process.pid, std::process::id());
        assert!(process.start_time_millis > 0);
    }
}
