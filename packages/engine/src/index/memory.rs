// packages/engine/src/index/memory.rs
//! In-memory index backed by a concurrent map

use crate::index::{CallState, Index, IndexKey};
use crate::model::CallId;
use crate::utils::errors::Result;
use dashmap::DashMap;
use std::collections::BTreeSet;

#[derive(Debug, Default)]
pub struct InMemoryIndex {
    states: DashMap<IndexKey, CallState>,
    calls_per_recording: DashMap<i32, usize>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl Index for InMemoryIndex {
    fn get(&self, recording_id: i32, call_id: CallId) -> Result<Option<CallState>> {
        Ok(self
            .states
            .get(&IndexKey::new(recording_id, call_id))
            .map(|state| state.value().clone()))
    }

    fn put(&self, recording_id: i32, call_id: CallId, state: &CallState) -> Result<()> {
        let previous = self
            .states
            .insert(IndexKey::new(recording_id, call_id), state.clone());
        if previous.is_none() {
            *self.calls_per_recording.entry(recording_id).or_insert(0) += 1;
        }
        Ok(())
    }

    fn recording_ids(&self) -> Result<Vec<i32>> {
        let ids: BTreeSet<i32> = self.calls_per_recording.iter().map(|entry| *entry.key()).collect();
        Ok(ids.into_iter().collect())
    }

    fn call_count(&self, recording_id: i32) -> Result<usize> {
        Ok(self
            .calls_per_recording
            .get(&recording_id)
            .map(|count| *count)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_overwrite() {
        let index = InMemoryIndex::new();
        let mut state = CallState::new(CallId(1), None, 7, 10);
        index.put(0, CallId(1), &state).unwrap();

        state.has_exit = true;
        index.put(0, CallId(1), &state).unwrap();

        assert!(index.get(0, CallId(1)).unwrap().unwrap().has_exit);
        assert!(index.get(0, CallId(2)).unwrap().is_none());
        assert_eq!(index.call_count(0).unwrap(), 1);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_recording_ids_sorted() {
        let index = InMemoryIndex::new();
        for recording in [5, 1, 3, 1] {
            index
                .put(recording, CallId(1), &CallState::new(CallId(1), None, 1, 0))
                .unwrap();
        }
        assert_eq!(index.recording_ids().unwrap(), vec![1, 3, 5]);
    }
}
