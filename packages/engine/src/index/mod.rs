// packages/engine/src/index/mod.rs
//! Call state index
//!
//! Stores the structural position of every call (parent, children, whether
//! its exit arrived) keyed by `(recording id, call id)`. The tree assembler
//! only talks to the [`Index`] trait; which backend is used is configuration.
//!
//! - **InMemoryIndex**: concurrent hash map, for short recordings and live debugging
//! - **SqliteIndex**: embedded SQLite table, spills large recordings to disk

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryIndex;
pub use sqlite::SqliteIndex;

use crate::model::CallId;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Structural record of one call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallState {
    pub call_id: CallId,

    /// `None` for the root call
    pub parent_call_id: Option<CallId>,

    pub method_id: u64,

    /// Children in enter order
    pub child_call_ids: Vec<CallId>,

    /// Set once, when the exit record arrives
    pub has_exit: bool,

    /// Stream offset of the enter record
    pub payload_offset: u64,

    /// Stream offset of the exit record
    pub exit_offset: Option<u64>,
}

impl CallState {
    pub fn new(call_id: CallId, parent_call_id: Option<CallId>, method_id: u64, payload_offset: u64) -> Self {
        Self {
            call_id,
            parent_call_id,
            method_id,
            child_call_ids: Vec::new(),
            has_exit: false,
            payload_offset,
            exit_offset: None,
        }
    }
}

/// Composite index key
///
/// Encoded as 16 big-endian bytes so byte order equals `(recording, call)`
/// order for non-negative ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexKey {
    pub recording_id: i32,
    pub call_id: CallId,
}

impl IndexKey {
    pub const LEN: usize = 16;

    pub fn new(recording_id: i32, call_id: CallId) -> Self {
        Self { recording_id, call_id }
    }

    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let mut bytes = [0u8; Self::LEN];
        bytes[..8].copy_from_slice(&(self.recording_id as i64).to_be_bytes());
        bytes[8..].copy_from_slice(&self.call_id.0.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::LEN {
            return Err(EngineError::IndexFailed(format!(
                "Index key must be {} bytes, got {}",
                Self::LEN,
                bytes.len()
            )));
        }
        let mut recording = [0u8; 8];
        let mut call = [0u8; 8];
        recording.copy_from_slice(&bytes[..8]);
        call.copy_from_slice(&bytes[8..]);

        let recording_id = i32::try_from(i64::from_be_bytes(recording))
            .map_err(|e| EngineError::IndexFailed(format!("Recording id out of range: {}", e)))?;
        Ok(Self {
            recording_id,
            call_id: CallId(u64::from_be_bytes(call)),
        })
    }
}

/// Call state store
///
/// Implementations must be safe to share between the reader task and
/// consumers querying trees.
pub trait Index: Send + Sync {
    fn get(&self, recording_id: i32, call_id: CallId) -> Result<Option<CallState>>;

    fn put(&self, recording_id: i32, call_id: CallId, state: &CallState) -> Result<()>;

    /// Store several states at once; backends with transactions apply all or none
    fn put_all(&self, entries: &[(IndexKey, CallState)]) -> Result<()> {
        for (key, state) in entries {
            self.put(key.recording_id, key.call_id, state)?;
        }
        Ok(())
    }

    /// Recording ids with at least one call, ascending
    fn recording_ids(&self) -> Result<Vec<i32>>;

    /// Number of calls stored for a recording
    fn call_count(&self, recording_id: i32) -> Result<usize>;
}

/// Which index implementation to use
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum IndexBackend {
    #[default]
    Memory,
    Sqlite {
        path: PathBuf,
    },
}

impl IndexBackend {
    pub fn build(&self) -> Result<Arc<dyn Index>> {
        match self {
            IndexBackend::Memory => Ok(Arc::new(InMemoryIndex::new())),
            IndexBackend::Sqlite { path } => {
                info!("Using SQLite call index at {:?}", path);
                Ok(Arc::new(SqliteIndex::open(path)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let key = IndexKey::new(3, CallId(258));
        let bytes = key.to_bytes();
        assert_eq!(&bytes[..8], &[0, 0, 0, 0, 0, 0, 0, 3]);
        assert_eq!(&bytes[8..], &[0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(IndexKey::from_bytes(&bytes).unwrap(), key);
        assert!(IndexKey::from_bytes(&bytes[..15]).is_err());
    }

    #[test]
    fn test_key_bytes_sort_like_ids() {
        let a = IndexKey::new(1, CallId(300)).to_bytes();
        let b = IndexKey::new(2, CallId(1)).to_bytes();
        let c = IndexKey::new(2, CallId(2)).to_bytes();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_serialized_state_is_small() {
        let mut state = CallState::new(CallId(7), Some(CallId(1)), 42, 1_000_000);
        state.child_call_ids = (8..16).map(CallId).collect();
        let bytes = serde_json::to_vec(&state).unwrap();
        assert!(bytes.len() < 300);
    }

    #[test]
    fn test_backend_from_config() {
        let backend: IndexBackend = serde_json::from_str(r#"{"backend":"sqlite","path":"/tmp/x.db"}"#).unwrap();
        assert_eq!(
            backend,
            IndexBackend::Sqlite {
                path: PathBuf::from("/tmp/x.db")
            }
        );
        assert!(IndexBackend::default().build().is_ok());
    }
}
