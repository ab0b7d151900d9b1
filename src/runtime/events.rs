//! Runtime event stream payloads.

use crate::{
    core::builder::Rejection,
    types::{RecordId, SeqNo},
    upload::transport::TransportError,
};

/// Events broadcast by the tracker and its upload scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    /// A record was durably queued.
    Queued {
        /// Queue record id.
        record_id: RecordId,
        /// Sequence number stamped on it.
        seq: SeqNo,
    },
    /// A tracking call was dropped by policy.
    Rejected {
        /// Why it was dropped.
        reason: Rejection,
    },
    /// Oldest pending records were dropped under capacity pressure.
    Evicted {
        /// Dropped record ids.
        ids: Vec<RecordId>,
    },
    /// Records could not be encoded and were set aside.
    Quarantined {
        /// Quarantined record ids.
        ids: Vec<RecordId>,
    },
    /// A batch was acknowledged by the collector.
    Delivered {
        /// Acknowledged record ids.
        ids: Vec<RecordId>,
    },
    /// A batch failed and its records went back to pending.
    UploadFailed {
        /// Transport failure.
        error: TransportError,
        /// Consecutive failures so far.
        failures: u32,
    },
}
