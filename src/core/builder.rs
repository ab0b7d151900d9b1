//! Turns tracking calls into immutable, sequenced records and enqueues them.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::{
    event::{Event, EventDraft},
    profile::{AnonymousProfilePolicy, ProfileMutation, ProfileOp},
    record::Payload,
    types::{Attributes, Location, RESERVED_EVENT_PREFIX, RecordId, SeqNo},
};

use super::{
    identity::IdentityManager,
    properties::{PropertyStore, TimerRegistry, cost_seconds},
    queue::{PersistentQueue, QueueError},
    sequence::SequenceAllocator,
};

/// Why a tracking call was dropped locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Event id was empty.
    EmptyEventId,
    /// Event id used the SDK-reserved prefix.
    ReservedEventId,
    /// `must_in_session` was set but no session is active.
    NoActiveSession,
    /// Profile mutation without an identified user under the reject policy.
    AnonymousProfile,
    /// Profile mutation carried nothing usable.
    InvalidProfileOp,
}

/// Failure of a tracking call.
#[derive(Debug, Error)]
pub enum TrackError {
    /// Dropped by policy.
    #[error("rejected: {0:?}")]
    Rejected(Rejection),
    /// The queue could not persist the record.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<Rejection> for TrackError {
    fn from(value: Rejection) -> Self {
        Self::Rejected(value)
    }
}

/// Event builder state: super-properties, timers, sequence, and clock.
#[derive(Debug, Default)]
pub struct EventBuilder {
    properties: PropertyStore,
    timers: TimerRegistry,
    sequence: SequenceAllocator,
    default_location: Option<Location>,
    last_ts_ms: u64,
}

impl EventBuilder {
    /// Builder drawing sequence numbers from `sequence`.
    pub fn new(sequence: SequenceAllocator) -> Self {
        Self {
            sequence,
            ..Self::default()
        }
    }

    /// Super-property store.
    pub fn properties(&self) -> &PropertyStore {
        &self.properties
    }

    /// Mutable super-property store.
    pub fn properties_mut(&mut self) -> &mut PropertyStore {
        &mut self.properties
    }

    /// Mutable timer registry.
    pub fn timers_mut(&mut self) -> &mut TimerRegistry {
        &mut self.timers
    }

    /// Location applied to events that carry none.
    pub fn set_default_location(&mut self, location: Option<Location>) {
        self.default_location = location;
    }

    /// Builds an application event without enqueuing it.
    pub fn build(
        &mut self,
        draft: EventDraft,
        identity: &IdentityManager,
        queue: &mut PersistentQueue,
        now: Instant,
    ) -> Result<Event, TrackError> {
        if draft.event_id.is_empty() {
            return Err(Rejection::EmptyEventId.into());
        }
        if draft.event_id.starts_with(RESERVED_EVENT_PREFIX) {
            return Err(Rejection::ReservedEventId.into());
        }
        self.build_unchecked(draft, identity, queue, now)
    }

    /// Builds and enqueues an application event.
    pub fn track(
        &mut self,
        draft: EventDraft,
        identity: &IdentityManager,
        queue: &mut PersistentQueue,
        now: Instant,
    ) -> Result<(RecordId, Event), TrackError> {
        let event = self.build(draft, identity, queue, now)?;
        let id = queue.enqueue(Payload::Event(event.clone()))?;
        Ok((id, event))
    }

    /// Builds and enqueues an SDK-internal event, skipping the reserved-prefix check.
    pub fn track_internal(
        &mut self,
        draft: EventDraft,
        identity: &IdentityManager,
        queue: &mut PersistentQueue,
        now: Instant,
    ) -> Result<(RecordId, Event), TrackError> {
        let event = self.build_unchecked(draft, identity, queue, now)?;
        let id = queue.enqueue(Payload::Event(event.clone()))?;
        Ok((id, event))
    }

    /// Builds and enqueues a profile mutation for the current user.
    pub fn track_profile(
        &mut self,
        mut op: ProfileOp,
        identity: &IdentityManager,
        policy: AnonymousProfilePolicy,
        queue: &mut PersistentQueue,
    ) -> Result<(RecordId, ProfileMutation), TrackError> {
        if !op.sanitize() {
            return Err(Rejection::InvalidProfileOp.into());
        }
        let user_id = identity.current_user_id().map(str::to_string);
        if user_id.is_none() && policy == AnonymousProfilePolicy::Reject {
            return Err(Rejection::AnonymousProfile.into());
        }

        let (seq, ts_ms) = self.stamp(queue)?;
        let mutation = ProfileMutation {
            seq,
            user_id,
            ts_ms,
            op,
        };
        let id = queue.enqueue(Payload::Profile(mutation.clone()))?;
        Ok((id, mutation))
    }

    fn build_unchecked(
        &mut self,
        draft: EventDraft,
        identity: &IdentityManager,
        queue: &mut PersistentQueue,
        now: Instant,
    ) -> Result<Event, TrackError> {
        let session_id = identity.current_session_id().cloned();
        if draft.must_in_session && session_id.is_none() {
            return Err(Rejection::NoActiveSession.into());
        }

        let mut cost_time = draft.cost_time;
        if cost_time == 0 {
            if let Some(elapsed) = self.timers.consume_at(&draft.event_id, now) {
                cost_time = cost_seconds(elapsed);
            }
        }

        let mut attributes: Attributes = self.properties.merged_snapshot();
        for (key, value) in draft.attributes {
            if value.is_valid() {
                attributes.insert(key, value);
            } else {
                tracing::warn!(event_id = %draft.event_id, key = %key, "dropping non-finite attribute");
            }
        }

        let (seq, ts_ms) = self.stamp(queue)?;
        Ok(Event {
            seq,
            event_id: draft.event_id,
            categories: draft.categories,
            label: draft.label,
            cost_time,
            location: draft.location.or(self.default_location),
            ts_ms,
            attributes,
            session_id,
            user_id: identity.current_user_id().map(str::to_string),
        })
    }

    fn stamp(&mut self, queue: &mut PersistentQueue) -> Result<(SeqNo, u64), QueueError> {
        let seq = self.sequence.next(queue)?;
        self.last_ts_ms = self.last_ts_ms.max(now_ms());
        Ok((seq, self.last_ts_ms))
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
