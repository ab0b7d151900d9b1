/// Volatile storage backend.
pub mod memory;
/// SQLite storage backend.
pub mod sqlite;

use thiserror::Error;

use crate::types::RecordId;

/// Storage backend failure.
#[derive(Debug, Error)]
pub enum PersistError {
    /// SQLite reported an error.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result alias for storage operations.
pub type PersistResult<T> = Result<T, PersistError>;

/// Row as read back from durable storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    /// Storage-assigned id.
    pub id: RecordId,
    /// Persisted failed-attempt counter.
    pub attempts: u32,
    /// Encoded payload envelope.
    pub bytes: Vec<u8>,
}

/// Crash-safe backing store owned exclusively by the persistent queue.
pub trait DurableStorage: Send {
    /// Appends one record; the returned id is greater than every earlier id.
    fn append(&mut self, bytes: &[u8]) -> PersistResult<RecordId>;
    /// All live (non-quarantined) rows, ordered by id.
    fn read_all(&self) -> PersistResult<Vec<StoredRow>>;
    /// Deletes rows in one batch; unknown ids are ignored.
    fn delete(&mut self, ids: &[RecordId]) -> PersistResult<usize>;
    /// Bumps the attempt counter of each row.
    fn record_attempt(&mut self, _ids: &[RecordId]) -> PersistResult<()> {
        Ok(())
    }
    /// Sets rows aside so they are never read back. Defaults to deleting them.
    fn quarantine(&mut self, ids: &[RecordId]) -> PersistResult<()> {
        self.delete(ids).map(|_| ())
    }
    /// Reads a named counter.
    fn read_counter(&self, name: &str) -> PersistResult<Option<u64>>;
    /// Writes a named counter durably.
    fn write_counter(&mut self, name: &str, value: u64) -> PersistResult<()>;
    /// Pushes buffered writes to stable storage.
    fn flush(&mut self) -> PersistResult<()> {
        Ok(())
    }
}
