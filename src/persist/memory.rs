//! Volatile storage for tests and hosts that opt out of on-disk durability.

use std::collections::BTreeMap;

use hashbrown::HashMap;

use crate::types::RecordId;

use super::{DurableStorage, PersistResult, StoredRow};

/// In-memory [`DurableStorage`]; contents die with the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    rows: BTreeMap<RecordId, StoredRow>,
    quarantined: BTreeMap<RecordId, StoredRow>,
    counters: HashMap<String, u64>,
    next_id: RecordId,
}

impl MemoryStorage {
    /// Empty store.
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    /// Inserts raw bytes as if a previous process had written them.
    pub fn insert_raw(&mut self, bytes: Vec<u8>) -> RecordId {
        let id = self.take_id();
        self.rows.insert(
            id,
            StoredRow {
                id,
                attempts: 0,
                bytes,
            },
        );
        id
    }

    /// Rows set aside so far.
    pub fn quarantined_len(&self) -> usize {
        self.quarantined.len()
    }

    fn take_id(&mut self) -> RecordId {
        let id = self.next_id.max(1);
        self.next_id = id + 1;
        id
    }
}

impl DurableStorage for MemoryStorage {
    fn append(&mut self, bytes: &[u8]) -> PersistResult<RecordId> {
        Ok(self.insert_raw(bytes.to_vec()))
    }

    fn read_all(&self) -> PersistResult<Vec<StoredRow>> {
        Ok(self.rows.values().cloned().collect())
    }

    fn delete(&mut self, ids: &[RecordId]) -> PersistResult<usize> {
        Ok(ids
            .iter()
            .filter(|id| self.rows.remove(id).is_some())
            .count())
    }

    fn record_attempt(&mut self, ids: &[RecordId]) -> PersistResult<()> {
        for id in ids {
            if let Some(row) = self.rows.get_mut(id) {
                row.attempts = row.attempts.saturating_add(1);
            }
        }
        Ok(())
    }

    fn quarantine(&mut self, ids: &[RecordId]) -> PersistResult<()> {
        for id in ids {
            if let Some(row) = self.rows.remove(id) {
                self.quarantined.insert(*id, row);
            }
        }
        Ok(())
    }

    fn read_counter(&self, name: &str) -> PersistResult<Option<u64>> {
        Ok(self.counters.get(name).copied())
    }

    fn write_counter(&mut self, name: &str, value: u64) -> PersistResult<()> {
        self.counters.insert(name.to_string(), value);
        Ok(())
    }
}
