//! SQLite-backed durable record store.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, params};

use crate::types::RecordId;

use super::{DurableStorage, PersistResult, StoredRow};

/// SQLite implementation of [`crate::persist::DurableStorage`].
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Opens or creates a SQLite-backed store at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens an in-memory SQLite store.
    pub fn open_in_memory() -> PersistResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> PersistResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self { conn })
    }

    /// Number of rows set aside as undeliverable.
    pub fn quarantined_count(&self) -> PersistResult<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM records WHERE quarantined = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn update_ids(&mut self, sql: &str, ids: &[RecordId]) -> PersistResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(sql)?;
            for id in ids {
                changed += stmt.execute(params![*id as i64])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }
}

impl DurableStorage for SqliteStorage {
    fn append(&mut self, bytes: &[u8]) -> PersistResult<RecordId> {
        self.conn.execute(
            "INSERT INTO records(ts_ms, payload) VALUES (?1, ?2)",
            params![now_ms() as i64, bytes],
        )?;
        Ok(self.conn.last_insert_rowid() as RecordId)
    }

    fn read_all(&self) -> PersistResult<Vec<StoredRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, attempts, payload FROM records WHERE quarantined = 0 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: i64 = row.get(0)?;
            let attempts: i64 = row.get(1)?;
            let bytes: Vec<u8> = row.get(2)?;
            Ok(StoredRow {
                id: id as RecordId,
                attempts: attempts.clamp(0, i64::from(u32::MAX)) as u32,
                bytes,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn delete(&mut self, ids: &[RecordId]) -> PersistResult<usize> {
        self.update_ids("DELETE FROM records WHERE id = ?1", ids)
    }

    fn record_attempt(&mut self, ids: &[RecordId]) -> PersistResult<()> {
        self.update_ids(
            "UPDATE records SET attempts = attempts + 1 WHERE id = ?1",
            ids,
        )
        .map(|_| ())
    }

    fn quarantine(&mut self, ids: &[RecordId]) -> PersistResult<()> {
        self.update_ids("UPDATE records SET quarantined = 1 WHERE id = ?1", ids)
            .map(|_| ())
    }

    fn read_counter(&self, name: &str) -> PersistResult<Option<u64>> {
        let value: Option<i64> = self
            .conn
            .query_row(
                "SELECT value FROM counters WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.map(|v| v as u64))
    }

    fn write_counter(&mut self, name: &str, value: u64) -> PersistResult<()> {
        self.conn.execute(
            "INSERT INTO counters(name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            params![name, value as i64],
        )?;
        Ok(())
    }

    fn flush(&mut self) -> PersistResult<()> {
        self.conn
            .query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))?;
        Ok(())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
