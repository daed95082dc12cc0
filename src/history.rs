//! Conversation history archive
//!
//! Completed exchanges are kept as a bounded, expiring JSON list under one
//! storage key. Storage trouble never blocks a turn: writes degrade by evicting
//! old records and at worst report a [`PersistenceError`].

mod preferences;
mod storage;

pub use preferences::{Preferences, SETTINGS_KEY};
pub use storage::{KeyValueStore, MemoryStore, SqliteStore, StorageError, StorageResult};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const HISTORY_KEY: &str = "agentChatHistory";

/// One archived user/agent exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub session_id: String,
    /// Milliseconds since the epoch
    pub timestamp: i64,
    pub user: String,
    pub agent: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryConfig {
    pub max_records: usize,
    pub max_age: Duration,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_records: 100,
            max_age: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Error)]
#[error("History write abandoned: {source}")]
pub struct PersistenceError {
    #[from]
    pub source: StorageError,
}

pub struct HistoryStore {
    store: Arc<dyn KeyValueStore>,
    config: HistoryConfig,
}

impl HistoryStore {
    pub fn new(store: Arc<dyn KeyValueStore>, config: HistoryConfig) -> Self {
        Self { store, config }
    }

    /// Archive a record, dropping the oldest beyond the count bound
    pub fn record(&self, record: HistoryRecord) -> Result<(), PersistenceError> {
        let mut records = self.read_all();
        records.push(record);
        records.sort_by_key(|r| r.timestamp);
        if records.len() > self.config.max_records {
            let excess = records.len() - self.config.max_records;
            records.drain(..excess);
        }
        self.write_all(records)
    }

    /// Non-expired records, newest first. Expired records are deleted.
    pub fn load(&self, now: DateTime<Utc>) -> Vec<HistoryRecord> {
        let mut records = self.read_all();
        let max_age_ms = i64::try_from(self.config.max_age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now.timestamp_millis().saturating_sub(max_age_ms);

        let before = records.len();
        records.retain(|r| r.timestamp >= cutoff);
        if records.len() != before {
            tracing::info!(expired = before - records.len(), "Pruned expired history");
            if let Err(e) = self.write_all(records.clone()) {
                tracing::warn!(error = %e, "Failed to persist pruned history");
            }
        }

        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records
    }

    /// Delete by index into the newest-first list
    pub fn delete(&self, index: usize) -> Result<Option<HistoryRecord>, PersistenceError> {
        let mut records = self.read_all();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if index >= records.len() {
            return Ok(None);
        }
        let removed = records.remove(index);
        records.reverse();
        self.write_all(records)?;
        Ok(Some(removed))
    }

    pub fn clear(&self) -> Result<(), PersistenceError> {
        self.store.remove(HISTORY_KEY)?;
        Ok(())
    }

    /// Swap the agent text of the session's latest record.
    ///
    /// Returns false when the session has no record.
    pub fn replace_latest_agent_message(
        &self,
        session_id: &str,
        content: &str,
    ) -> Result<bool, PersistenceError> {
        let mut records = self.read_all();
        let Some(latest) = records
            .iter_mut()
            .filter(|r| r.session_id == session_id)
            .max_by_key(|r| r.timestamp)
        else {
            return Ok(false);
        };
        latest.agent = content.to_string();
        self.write_all(records)?;
        Ok(true)
    }

    /// Stored records, oldest first. Unreadable data resets the store.
    fn read_all(&self) -> Vec<HistoryRecord> {
        let raw = match self.store.get(HISTORY_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read history");
                return Vec::new();
            }
        };
        match serde_json::from_str::<Vec<HistoryRecord>>(&raw) {
            Ok(mut records) => {
                records.sort_by_key(|r| r.timestamp);
                records
            }
            Err(e) => {
                tracing::warn!(error = %e, "Discarding corrupt history");
                if let Err(e) = self.store.remove(HISTORY_KEY) {
                    tracing::warn!(error = %e, "Failed to reset corrupt history");
                }
                Vec::new()
            }
        }
    }

    /// Write oldest-first; on failure evict the oldest half and retry once
    fn write_all(&self, mut records: Vec<HistoryRecord>) -> Result<(), PersistenceError> {
        let first = match self.store.set(HISTORY_KEY, &encode(&records)) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        let evict = records.len() / 2;
        tracing::warn!(error = %first, evict, "History write failed, evicting oldest records");
        records.drain(..evict);

        self.store.set(HISTORY_KEY, &encode(&records)).map_err(|e| {
            tracing::warn!(error = %e, "History write abandoned");
            PersistenceError::from(e)
        })
    }
}

fn encode(records: &[HistoryRecord]) -> String {
    // Serializing plain strings and integers cannot fail
    serde_json::to_string(records).unwrap_or_else(|_| "[]".to_string())
}
