use std::collections::BTreeMap;

use thiserror::Error;

use crate::{
    persist::{DurableStorage, PersistError},
    record::{DeliveryState, Payload, QueueRecord, StoredPayloadEnvelope},
    types::{RecordId, SeqNo},
};

/// Counter name under which the reserved sequence ceiling is persisted.
pub const SEQUENCE_COUNTER: &str = "sequence_ceiling";

/// Queue operation failure.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The backing store failed.
    #[error("storage: {0}")]
    Persist(#[from] PersistError),
    /// The payload could not be encoded for storage.
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Outcome of [`PersistentQueue::open`] beyond the queue itself.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OpenReport {
    /// Rows loaded as PENDING.
    pub loaded: usize,
    /// Rows set aside because they could not be decoded.
    pub quarantined: Vec<RecordId>,
}

/// Durable FIFO of pending events and profile mutations.
///
/// The in-memory map mirrors the live rows of the backing store; every
/// mutation is written through before it is applied here.
pub struct PersistentQueue {
    storage: Box<dyn DurableStorage>,
    records: BTreeMap<RecordId, QueueRecord>,
    in_flight: usize,
    quarantined: usize,
}

impl PersistentQueue {
    /// Loads every live row as PENDING. Rows that fail to decode are quarantined.
    pub fn open(storage: Box<dyn DurableStorage>) -> Result<(Self, OpenReport), QueueError> {
        let mut queue = Self {
            storage,
            records: BTreeMap::new(),
            in_flight: 0,
            quarantined: 0,
        };

        let mut report = OpenReport::default();
        for row in queue.storage.read_all()? {
            match StoredPayloadEnvelope::decode(&row.bytes) {
                Ok(payload) => {
                    queue.records.insert(
                        row.id,
                        QueueRecord {
                            id: row.id,
                            payload,
                            state: DeliveryState::Pending,
                            attempts: row.attempts,
                        },
                    );
                    report.loaded += 1;
                }
                Err(err) => {
                    tracing::warn!(record_id = row.id, error = %err, "quarantining undecodable record");
                    report.quarantined.push(row.id);
                }
            }
        }
        if !report.quarantined.is_empty() {
            queue.storage.quarantine(&report.quarantined)?;
        }
        Ok((queue, report))
    }

    /// Durably appends `payload`; returns once the store has accepted it.
    pub fn enqueue(&mut self, payload: Payload) -> Result<RecordId, QueueError> {
        let bytes = StoredPayloadEnvelope::encode(&payload)?;
        let id = self.storage.append(&bytes)?;
        tracing::debug!(record_id = id, kind = payload.kind(), seq = payload.seq(), "enqueued");
        self.records.insert(
            id,
            QueueRecord {
                id,
                payload,
                state: DeliveryState::Pending,
                attempts: 0,
            },
        );
        Ok(id)
    }

    /// Up to `max` PENDING records, oldest first.
    pub fn peek_batch(&self, max: usize) -> Vec<&QueueRecord> {
        self.records
            .values()
            .filter(|r| r.state == DeliveryState::Pending)
            .take(max)
            .collect()
    }

    /// Moves PENDING records to IN_FLIGHT; other ids are ignored.
    pub fn mark_in_flight(&mut self, ids: &[RecordId]) -> usize {
        let mut moved = 0;
        for id in ids {
            if let Some(rec) = self.records.get_mut(id) {
                if rec.state == DeliveryState::Pending {
                    rec.state = DeliveryState::InFlight;
                    moved += 1;
                }
            }
        }
        self.in_flight += moved;
        moved
    }

    /// Removes acknowledged records permanently. Repeated acks are no-ops.
    pub fn mark_delivered(&mut self, ids: &[RecordId]) -> Result<usize, QueueError> {
        let known: Vec<RecordId> = ids
            .iter()
            .copied()
            .filter(|id| self.records.contains_key(id))
            .collect();
        if known.is_empty() {
            return Ok(0);
        }

        if let Err(err) = self.storage.delete(&known) {
            self.release_in_flight(&known);
            return Err(err.into());
        }
        for id in &known {
            if let Some(rec) = self.records.remove(id) {
                if rec.state == DeliveryState::InFlight {
                    self.in_flight -= 1;
                }
            }
        }
        Ok(known.len())
    }

    /// Returns IN_FLIGHT records to PENDING and bumps their attempt counters.
    ///
    /// Records keep their ids, so they sort ahead of anything enqueued since.
    pub fn mark_failed(&mut self, ids: &[RecordId]) -> Result<usize, QueueError> {
        let failed: Vec<RecordId> = ids
            .iter()
            .copied()
            .filter(|id| {
                self.records
                    .get(id)
                    .is_some_and(|r| r.state == DeliveryState::InFlight)
            })
            .collect();
        if failed.is_empty() {
            return Ok(0);
        }

        let persisted = self.storage.record_attempt(&failed);
        for id in &failed {
            if let Some(rec) = self.records.get_mut(id) {
                rec.state = DeliveryState::Pending;
                rec.attempts = rec.attempts.saturating_add(1);
            }
        }
        self.in_flight -= failed.len();
        persisted?;
        Ok(failed.len())
    }

    /// Sets records aside so they are never resubmitted.
    pub fn quarantine(&mut self, ids: &[RecordId]) -> Result<usize, QueueError> {
        let targets: Vec<RecordId> = ids
            .iter()
            .copied()
            .filter(|id| self.records.contains_key(id))
            .collect();
        if targets.is_empty() {
            return Ok(0);
        }

        if let Err(err) = self.storage.quarantine(&targets) {
            self.release_in_flight(&targets);
            return Err(err.into());
        }
        for id in &targets {
            if let Some(rec) = self.records.remove(id) {
                if rec.state == DeliveryState::InFlight {
                    self.in_flight -= 1;
                }
            }
        }
        self.quarantined += targets.len();
        Ok(targets.len())
    }

    /// Drops the oldest PENDING records until at most `capacity` remain.
    ///
    /// IN_FLIGHT records count toward the bound but are never evicted.
    pub fn evict_oldest_if_over_capacity(&mut self, capacity: usize) -> Result<Vec<RecordId>, QueueError> {
        let excess = self.records.len().saturating_sub(capacity);
        if excess == 0 {
            return Ok(Vec::new());
        }

        let victims: Vec<RecordId> = self
            .records
            .values()
            .filter(|r| r.state == DeliveryState::Pending)
            .take(excess)
            .map(|r| r.id)
            .collect();
        if victims.is_empty() {
            return Ok(victims);
        }

        self.storage.delete(&victims)?;
        for id in &victims {
            self.records.remove(id);
        }
        tracing::warn!(evicted = victims.len(), capacity, "queue over capacity, dropped oldest pending records");
        Ok(victims)
    }

    /// Reserves `block` sequence numbers and persists the new ceiling.
    ///
    /// Returns the first number of the block. Numbers from a block that was
    /// never used up are skipped after a restart, never reused.
    pub fn reserve_sequence_block(&mut self, block: u64) -> Result<SeqNo, QueueError> {
        let start = self
            .storage
            .read_counter(SEQUENCE_COUNTER)?
            .unwrap_or(0)
            .saturating_add(1);
        let ceiling = start.saturating_add(block.max(1)).saturating_sub(1);
        self.storage.write_counter(SEQUENCE_COUNTER, ceiling)?;
        Ok(start)
    }

    /// Record by id, if still owned by the queue.
    pub fn get(&self, id: RecordId) -> Option<&QueueRecord> {
        self.records.get(&id)
    }

    /// Records still owned by the queue (PENDING and IN_FLIGHT).
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true when the queue owns no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records waiting to be batched.
    pub fn pending_len(&self) -> usize {
        self.records.len() - self.in_flight
    }

    /// Records in a batch currently on the wire.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight
    }

    /// Records quarantined by this process.
    pub fn quarantined_len(&self) -> usize {
        self.quarantined
    }

    /// Returns IN_FLIGHT records to PENDING without counting an attempt.
    ///
    /// Used when storage rejects a removal, so the records stay deliverable
    /// and evictable instead of sitting in flight until restart.
    fn release_in_flight(&mut self, ids: &[RecordId]) {
        for id in ids {
            if let Some(rec) = self.records.get_mut(id) {
                if rec.state == DeliveryState::InFlight {
                    rec.state = DeliveryState::Pending;
                    self.in_flight -= 1;
                }
            }
        }
    }

    /// Flushes the backing store.
    pub fn flush(&mut self) -> Result<(), QueueError> {
        self.storage.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    use super::*;
    use crate::{
        event::Event,
        persist::memory::MemoryStorage,
    };

    fn payload(seq: SeqNo) -> Payload {
        Payload::Event(Event {
            seq,
            event_id: format!("e{seq}"),
            categories: Default::default(),
            label: None,
            cost_time: 0,
            location: None,
            ts_ms: seq,
            attributes: Default::default(),
            session_id: None,
            user_id: None,
        })
    }

    fn open_empty() -> PersistentQueue {
        PersistentQueue::open(Box::new(MemoryStorage::new()))
            .expect("open")
            .0
    }

    #[test]
    fn failed_records_re_enter_in_front_of_newer_ones() {
        let mut q = open_empty();
        let a = q.enqueue(payload(1)).expect("a");
        let b = q.enqueue(payload(2)).expect("b");
        q.mark_in_flight(&[a, b]);
        let c = q.enqueue(payload(3)).expect("c");

        q.mark_failed(&[a, b]).expect("fail");
        let order: Vec<RecordId> = q.peek_batch(10).iter().map(|r| r.id).collect();
        assert_eq!(order, vec![a, b, c]);
        assert_eq!(q.get(a).map(|r| r.attempts), Some(1));
    }

    #[test]
    fn in_flight_records_are_not_peeked() {
        let mut q = open_empty();
        let a = q.enqueue(payload(1)).expect("a");
        let b = q.enqueue(payload(2)).expect("b");
        q.mark_in_flight(&[a]);
        let ids: Vec<RecordId> = q.peek_batch(10).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![b]);
        assert_eq!(q.pending_len(), 1);
        assert_eq!(q.in_flight_len(), 1);
    }

    #[test]
    fn mark_failed_ignores_pending_records() {
        let mut q = open_empty();
        let a = q.enqueue(payload(1)).expect("a");
        assert_eq!(q.mark_failed(&[a]).expect("fail"), 0);
        assert_eq!(q.get(a).map(|r| r.attempts), Some(0));
    }

    #[test]
    fn repeated_failures_keep_records_pending() {
        let mut q = open_empty();
        let a = q.enqueue(payload(1)).expect("a");
        for _ in 0..3 {
            q.mark_in_flight(&[a]);
            assert_eq!(q.mark_failed(&[a]).expect("fail"), 1);
        }
        let rec = q.get(a).expect("still queued");
        assert_eq!(rec.state, DeliveryState::Pending);
        assert_eq!(rec.attempts, 3);
    }

    #[test]
    fn ack_removes_exactly_once() {
        let mut q = open_empty();
        let a = q.enqueue(payload(1)).expect("a");
        let b = q.enqueue(payload(2)).expect("b");
        q.mark_in_flight(&[a]);
        assert_eq!(q.mark_delivered(&[a]).expect("ack"), 1);
        assert_eq!(q.mark_delivered(&[a]).expect("re-ack"), 0);
        assert_eq!(q.len(), 1);
        assert!(q.get(b).is_some());
    }

    #[test]
    fn eviction_skips_in_flight_and_newer_records() {
        let mut q = open_empty();
        let a = q.enqueue(payload(1)).expect("a");
        let b = q.enqueue(payload(2)).expect("b");
        let c = q.enqueue(payload(3)).expect("c");
        let d = q.enqueue(payload(4)).expect("d");
        q.mark_in_flight(&[a]);

        let evicted = q.evict_oldest_if_over_capacity(2).expect("evict");
        assert_eq!(evicted, vec![b, c]);
        assert!(q.get(a).is_some());
        assert!(q.get(d).is_some());
        assert!(q.evict_oldest_if_over_capacity(2).expect("evict").is_empty());
    }

    /// Storage whose removals fail while the shared flag is set.
    struct FailingRemovals {
        inner: MemoryStorage,
        fail_removals: Arc<AtomicBool>,
    }

    impl DurableStorage for FailingRemovals {
        fn append(&mut self, bytes: &[u8]) -> crate::persist::PersistResult<RecordId> {
            self.inner.append(bytes)
        }

        fn read_all(&self) -> crate::persist::PersistResult<Vec<crate::persist::StoredRow>> {
            self.inner.read_all()
        }

        fn delete(&mut self, ids: &[RecordId]) -> crate::persist::PersistResult<usize> {
            if self.fail_removals.load(Ordering::SeqCst) {
                return Err(rusqlite::Error::InvalidQuery.into());
            }
            self.inner.delete(ids)
        }

        fn quarantine(&mut self, ids: &[RecordId]) -> crate::persist::PersistResult<()> {
            if self.fail_removals.load(Ordering::SeqCst) {
                return Err(rusqlite::Error::InvalidQuery.into());
            }
            self.inner.quarantine(ids)
        }

        fn read_counter(&self, name: &str) -> crate::persist::PersistResult<Option<u64>> {
            self.inner.read_counter(name)
        }

        fn write_counter(&mut self, name: &str, value: u64) -> crate::persist::PersistResult<()> {
            self.inner.write_counter(name, value)
        }
    }

    fn open_failing() -> (PersistentQueue, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(true));
        let storage = FailingRemovals {
            inner: MemoryStorage::new(),
            fail_removals: Arc::clone(&flag),
        };
        (PersistentQueue::open(Box::new(storage)).expect("open").0, flag)
    }

    #[test]
    fn failed_ack_returns_records_to_pending() {
        let (mut q, _) = open_failing();
        let a = q.enqueue(payload(1)).expect("a");
        let b = q.enqueue(payload(2)).expect("b");
        q.mark_in_flight(&[a, b]);

        assert!(q.mark_delivered(&[a, b]).is_err());
        assert_eq!(q.in_flight_len(), 0);
        assert_eq!(q.get(a).map(|r| (r.state, r.attempts)), Some((DeliveryState::Pending, 0)));
        let ids: Vec<RecordId> = q.peek_batch(10).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn failed_quarantine_keeps_records_evictable() {
        let (mut q, fail_removals) = open_failing();
        let a = q.enqueue(payload(1)).expect("a");
        let b = q.enqueue(payload(2)).expect("b");
        q.mark_in_flight(&[a, b]);

        assert!(q.quarantine(&[a]).is_err());
        assert_eq!(q.quarantined_len(), 0);
        assert_eq!(q.get(a).map(|r| r.state), Some(DeliveryState::Pending));
        assert_eq!(q.in_flight_len(), 1);

        fail_removals.store(false, Ordering::SeqCst);
        assert_eq!(q.evict_oldest_if_over_capacity(1).expect("evict"), vec![a]);
        assert_eq!(q.get(b).map(|r| r.state), Some(DeliveryState::InFlight));
    }

    #[test]
    fn sequence_blocks_never_overlap() {
        let mut q = open_empty();
        let first = q.reserve_sequence_block(10).expect("block");
        let second = q.reserve_sequence_block(10).expect("block");
        assert_eq!(first, 1);
        assert_eq!(second, 11);
    }

    #[test]
    fn quarantine_removes_from_delivery() {
        let mut q = open_empty();
        let a = q.enqueue(payload(1)).expect("a");
        q.mark_in_flight(&[a]);
        assert_eq!(q.quarantine(&[a]).expect("quarantine"), 1);
        assert!(q.is_empty());
        assert_eq!(q.in_flight_len(), 0);
        assert_eq!(q.quarantined_len(), 1);
    }
}
