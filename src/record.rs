//! Queue record model and persistence wrappers.

use serde::{Deserialize, Serialize};

use crate::{
    event::Event,
    profile::ProfileMutation,
    types::{RecordId, SeqNo},
};

/// Version number for serialized [`StoredPayloadEnvelope`] payloads.
pub const RECORD_FORMAT_VERSION: u16 = 1;

/// Body of a queued record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Behavioral event.
    Event(Event),
    /// People profile mutation.
    Profile(ProfileMutation),
}

impl Payload {
    /// Sequence number stamped at build time.
    pub fn seq(&self) -> SeqNo {
        match self {
            Self::Event(e) => e.seq,
            Self::Profile(p) => p.seq,
        }
    }

    /// Short kind name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Event(_) => "event",
            Self::Profile(_) => "profile",
        }
    }
}

/// Delivery state of a record still owned by the queue.
///
/// Delivered and quarantined records leave the queue, so neither has a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryState {
    /// Waiting to be selected into a batch.
    Pending,
    /// Part of a batch currently on the wire.
    InFlight,
}

/// Durable unit owned by the persistent queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueRecord {
    /// Storage-assigned id, ascending in enqueue order.
    pub id: RecordId,
    /// Wrapped event or profile mutation.
    pub payload: Payload,
    /// Current delivery state.
    pub state: DeliveryState,
    /// Failed send attempts so far.
    pub attempts: u32,
}

/// Versioned wrapper for stable on-disk payload decoding.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StoredPayloadEnvelope {
    /// Payload format version.
    pub format_version: u16,
    /// Wrapped payload.
    pub payload: Payload,
}

impl StoredPayloadEnvelope {
    /// Encodes `payload` for the durable store.
    pub fn encode(payload: &Payload) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&StoredPayloadEnvelopeRef {
            format_version: RECORD_FORMAT_VERSION,
            payload,
        })
    }

    /// Decodes bytes written by [`StoredPayloadEnvelope::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Payload, String> {
        let envelope: StoredPayloadEnvelope = serde_json::from_slice(bytes)
            .map_err(|e| format!("payload decode failed: {e}"))?;
        if envelope.format_version != RECORD_FORMAT_VERSION {
            return Err(format!(
                "unsupported payload format version: {}",
                envelope.format_version
            ));
        }
        Ok(envelope.payload)
    }
}

#[derive(Serialize)]
struct StoredPayloadEnvelopeRef<'a> {
    format_version: u16,
    payload: &'a Payload,
}
