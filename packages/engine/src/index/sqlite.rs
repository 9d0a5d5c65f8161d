// packages/engine/src/index/sqlite.rs
//! SQLite-backed index
//!
//! One table keyed by the 16-byte [`IndexKey`]; values are JSON-serialized
//! [`CallState`]s. The recording id is duplicated into its own column so
//! listing recordings does not have to decode keys.

use crate::index::{CallState, Index, IndexKey};
use crate::model::CallId;
use crate::utils::errors::{EngineError, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::{debug, info};

pub struct SqliteIndex {
    db: Mutex<Connection>,
}

impl SqliteIndex {
    /// Open (or create) an index database file
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| EngineError::IndexFailed(format!("Failed to open index database: {}", e)))?;
        let index = Self::from_connection(conn)?;
        info!("Call index opened at {:?}", path);
        Ok(index)
    }

    /// Index that lives only as long as this value
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::IndexFailed(format!("Failed to open index database: {}", e)))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        // the index can always be rebuilt from the log
        conn.pragma_update(None, "synchronous", "OFF")
            .map_err(|e| EngineError::IndexFailed(format!("Failed to configure database: {}", e)))?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS call_states (
                key BLOB PRIMARY KEY,
                recording_id INTEGER NOT NULL,
                value BLOB NOT NULL
            )
            "#,
            [],
        )
        .map_err(|e| EngineError::IndexFailed(format!("Schema creation failed: {}", e)))?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_recording_id ON call_states(recording_id)",
            [],
        )
        .map_err(|e| EngineError::IndexFailed(format!("Index creation failed: {}", e)))?;

        Ok(Self { db: Mutex::new(conn) })
    }

    fn upsert(conn: &Connection, key: IndexKey, state: &CallState) -> Result<()> {
        let value = serde_json::to_vec(state)
            .map_err(|e| EngineError::IndexFailed(format!("Failed to serialize call state: {}", e)))?;
        conn.execute(
            "INSERT OR REPLACE INTO call_states (key, recording_id, value) VALUES (?1, ?2, ?3)",
            params![&key.to_bytes()[..], key.recording_id, value],
        )
        .map_err(|e| EngineError::IndexFailed(format!("Failed to store call state: {}", e)))?;
        Ok(())
    }
}

impl Index for SqliteIndex {
    fn get(&self, recording_id: i32, call_id: CallId) -> Result<Option<CallState>> {
        let key = IndexKey::new(recording_id, call_id);
        let db = self.db.lock();
        let value: Option<Vec<u8>> = db
            .query_row(
                "SELECT value FROM call_states WHERE key = ?1",
                params![&key.to_bytes()[..]],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| EngineError::IndexFailed(format!("Failed to load call state: {}", e)))?;
        drop(db);

        value
            .map(|bytes| {
                serde_json::from_slice(&bytes)
                    .map_err(|e| EngineError::IndexFailed(format!("Corrupt call state for {:?}: {}", key, e)))
            })
            .transpose()
    }

    fn put(&self, recording_id: i32, call_id: CallId, state: &CallState) -> Result<()> {
        let db = self.db.lock();
        Self::upsert(&db, IndexKey::new(recording_id, call_id), state)
    }

    fn put_all(&self, entries: &[(IndexKey, CallState)]) -> Result<()> {
        let mut db = self.db.lock();
        let tx = db
            .transaction()
            .map_err(|e| EngineError::IndexFailed(format!("Failed to begin transaction: {}", e)))?;
        for (key, state) in entries {
            Self::upsert(&tx, *key, state)?;
        }
        tx.commit()
            .map_err(|e| EngineError::IndexFailed(format!("Failed to commit call states: {}", e)))?;
        debug!("Stored {} call states", entries.len());
        Ok(())
    }

    fn recording_ids(&self) -> Result<Vec<i32>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare("SELECT DISTINCT recording_id FROM call_states ORDER BY recording_id")
            .map_err(|e| EngineError::IndexFailed(format!("Query preparation failed: {}", e)))?;

        let ids = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| EngineError::IndexFailed(format!("Query execution failed: {}", e)))?
            .collect::<std::result::Result<Vec<i32>, _>>()
            .map_err(|e| EngineError::IndexFailed(format!("Result collection failed: {}", e)))?;
        Ok(ids)
    }

    fn call_count(&self, recording_id: i32) -> Result<usize> {
        let db = self.db.lock();
        let count: i64 = db
            .query_row(
                "SELECT COUNT(*) FROM call_states WHERE recording_id = ?1",
                params![recording_id],
                |row| row.get(0),
            )
            .map_err(|e| EngineError::IndexFailed(format!("Failed to count calls: {}", e)))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");

        let mut root = CallState::new(CallId(1), None, 3, 16);
        root.child_call_ids = vec![CallId(2), CallId(3)];
        {
            let index = SqliteIndex::open(&path).unwrap();
            index.put(4, CallId(1), &root).unwrap();
        }

        let index = SqliteIndex::open(&path).unwrap();
        assert_eq!(index.get(4, CallId(1)).unwrap(), Some(root));
        assert_eq!(index.get(4, CallId(2)).unwrap(), None);
    }

    #[test]
    fn test_put_all_and_listing() {
        let index = SqliteIndex::in_memory().unwrap();
        let entries: Vec<(IndexKey, CallState)> = [(2, 1), (0, 1), (0, 2), (2, 2), (2, 3)]
            .into_iter()
            .map(|(rec, call)| {
                (
                    IndexKey::new(rec, CallId(call)),
                    CallState::new(CallId(call), None, 1, call * 10),
                )
            })
            .collect();
        index.put_all(&entries).unwrap();

        assert_eq!(index.recording_ids().unwrap(), vec![0, 2]);
        assert_eq!(index.call_count(2).unwrap(), 3);
        assert_eq!(index.call_count(7).unwrap(), 0);

        let mut updated = index.get(0, CallId(2)).unwrap().unwrap();
        updated.has_exit = true;
        index.put(0, CallId(2), &updated).unwrap();
        assert!(index.get(0, CallId(2)).unwrap().unwrap().has_exit);
        assert_eq!(index.call_count(0).unwrap(), 2);
    }
}
