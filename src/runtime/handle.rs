use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::{
    context::{DeviceContextProvider, StaticContext},
    core::{
        builder::{EventBuilder, Rejection, TrackError},
        identity::{IdentityManager, SessionTransition},
        lock,
        properties::cost_seconds,
        queue::{PersistentQueue, QueueError},
        sequence::SequenceAllocator,
    },
    event::{EventDraft, ExceptionReport, internal},
    persist::DurableStorage,
    profile::{AnonymousProfilePolicy, ProfileOp},
    types::{Attributes, Location, RecordId, Scalar, SeqNo, SessionId},
    upload::{
        codec::{AppIdentity, BatchEncoder, Cipher, Compressor, Plaintext, ZstdCompressor},
        scheduler::{SchedulerMsg, SchedulerParts, SchedulerState, spawn_scheduler},
        transport::Transport,
    },
};

use super::{
    config::{TrackerConfig, UploadSettings},
    events::TrackerEvent,
};

/// Tracker start-up and shutdown failure.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The queue could not be opened.
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// The scheduler task has already stopped.
    #[error("upload scheduler is not running")]
    ChannelClosed,
}

/// Result of a tracking call. Tracking never panics or returns errors into host code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    /// Durably queued.
    Queued {
        /// Queue record id.
        record_id: RecordId,
        /// Sequence number.
        seq: SeqNo,
    },
    /// Dropped by policy; never retried.
    Rejected(Rejection),
    /// Local storage failed; the failure was logged.
    Failed,
}

impl TrackOutcome {
    /// Returns true for [`TrackOutcome::Queued`].
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }
}

/// External capabilities the tracker runs on.
pub struct TrackerParts {
    /// Backing store for the queue.
    pub storage: Box<dyn DurableStorage>,
    /// Collector transport.
    pub transport: Arc<dyn Transport>,
    /// Device context stamped on batch headers.
    pub context: Arc<dyn DeviceContextProvider>,
    /// Batch compressor.
    pub compressor: Box<dyn Compressor>,
    /// Batch cipher.
    pub cipher: Box<dyn Cipher>,
}

impl TrackerParts {
    /// zstd compression, no encryption, empty device context.
    pub fn new(storage: Box<dyn DurableStorage>, transport: Arc<dyn Transport>) -> Self {
        Self {
            storage,
            transport,
            context: Arc::new(StaticContext::default()),
            compressor: Box::new(ZstdCompressor::default()),
            cipher: Box::new(Plaintext),
        }
    }

    /// Replaces the device context provider.
    pub fn with_context(mut self, context: Arc<dyn DeviceContextProvider>) -> Self {
        self.context = context;
        self
    }

    /// Replaces the compressor.
    pub fn with_compressor(mut self, compressor: Box<dyn Compressor>) -> Self {
        self.compressor = compressor;
        self
    }

    /// Replaces the cipher.
    pub fn with_cipher(mut self, cipher: Box<dyn Cipher>) -> Self {
        self.cipher = cipher;
        self
    }
}

struct TrackerCore {
    builder: EventBuilder,
    identity: IdentityManager,
}

struct Shared {
    core: Mutex<TrackerCore>,
    queue: Arc<Mutex<PersistentQueue>>,
    queue_capacity: usize,
    anonymous_profiles: AnonymousProfilePolicy,
    device_id_override: Option<String>,
    context: Arc<dyn DeviceContextProvider>,
    events_tx: broadcast::Sender<TrackerEvent>,
    settings_tx: watch::Sender<UploadSettings>,
    state_rx: watch::Receiver<SchedulerState>,
    trigger_tx: mpsc::Sender<SchedulerMsg>,
    draining: Arc<AtomicBool>,
}

/// Cloneable, thread-safe tracker handle.
#[derive(Clone)]
pub struct Tracker {
    shared: Arc<Shared>,
}

/// Opens the queue and starts the upload scheduler on the current tokio runtime.
pub fn start_tracker(config: TrackerConfig, parts: TrackerParts) -> Result<Tracker, RuntimeError> {
    let (queue, report) = PersistentQueue::open(parts.storage)?;
    tracing::info!(
        app_key = %config.app_key,
        pending = report.loaded,
        quarantined = report.quarantined.len(),
        "tracker starting"
    );
    let queue = Arc::new(Mutex::new(queue));

    let (events_tx, _) = broadcast::channel::<TrackerEvent>(1024);
    let (settings_tx, settings_rx) = watch::channel(config.upload_settings());
    let (state_tx, state_rx) = watch::channel(SchedulerState::Idle);
    let (trigger_tx, trigger_rx) = mpsc::channel::<SchedulerMsg>(4);
    let draining = Arc::new(AtomicBool::new(false));

    let encoder = BatchEncoder::new(
        AppIdentity {
            app_key: config.app_key.clone(),
            app_version: config.app_version.clone(),
            app_channel: config.app_channel.clone(),
        },
        config.max_record_bytes,
        parts.compressor,
        parts.cipher,
    );

    spawn_scheduler(
        SchedulerParts {
            queue: Arc::clone(&queue),
            transport: parts.transport,
            context: Arc::clone(&parts.context),
            device_id_override: config.custom_udid.clone(),
            encoder,
            retry: config.retry_policy(),
            request_timeout: config.request_timeout(),
            events_tx: events_tx.clone(),
            settings_rx,
            state_tx,
            draining: Arc::clone(&draining),
        },
        trigger_rx,
    );

    Ok(Tracker {
        shared: Arc::new(Shared {
            core: Mutex::new(TrackerCore {
                builder: EventBuilder::new(SequenceAllocator::default()),
                identity: IdentityManager::new(),
            }),
            queue,
            queue_capacity: config.queue_capacity.max(1),
            anonymous_profiles: config.anonymous_profiles,
            device_id_override: config.custom_udid,
            context: parts.context,
            events_tx,
            settings_tx,
            state_rx,
            trigger_tx,
            draining,
        }),
    })
}

impl Tracker {
    /// Subscribes to queue and upload events.
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.shared.events_tx.subscribe()
    }

    /// Tracks an application event.
    pub fn track_event(&self, draft: EventDraft) -> TrackOutcome {
        self.record(|core, queue| {
            let (id, event) = core
                .builder
                .track(draft, &core.identity, queue, Instant::now())?;
            Ok((id, event.seq))
        })
    }

    /// Tracks an event by id with explicit attributes.
    pub fn track_event_with_attributes(
        &self,
        event_id: impl Into<String>,
        attributes: Attributes,
    ) -> TrackOutcome {
        self.track_event(EventDraft::new(event_id).attributes(attributes))
    }

    /// Tracks a structured exception from a crash/exception reporter.
    pub fn track_exception(&self, report: ExceptionReport) -> TrackOutcome {
        self.track_internal(report.into_draft())
    }

    /// Starts timing `event_id`; the next matching event gets the elapsed cost time.
    pub fn track_timer(&self, event_id: impl Into<String>) {
        lock(&self.shared.core)
            .builder
            .timers_mut()
            .start_at(event_id, Instant::now());
    }

    /// Drops every running timer.
    pub fn clear_track_timer(&self) {
        lock(&self.shared.core).builder.timers_mut().clear();
    }

    /// Snapshot of the global super-properties.
    pub fn current_super_properties(&self) -> Attributes {
        lock(&self.shared.core).builder.properties().snapshot()
    }

    /// Registers super-properties, overwriting existing keys.
    pub fn register_super_properties(&self, properties: Attributes) {
        lock(&self.shared.core)
            .builder
            .properties_mut()
            .register(properties);
    }

    /// Registers super-properties only for keys not set yet.
    pub fn register_super_properties_once(&self, properties: Attributes) {
        lock(&self.shared.core)
            .builder
            .properties_mut()
            .register_once(properties, None);
    }

    /// Like [`Tracker::register_super_properties_once`], but also replaces keys whose value equals `default`.
    pub fn register_super_properties_once_with_default(&self, properties: Attributes, default: Scalar) {
        lock(&self.shared.core)
            .builder
            .properties_mut()
            .register_once(properties, Some(&default));
    }

    /// Removes one super-property; absent keys are ignored.
    pub fn unregister_super_property(&self, key: &str) {
        lock(&self.shared.core)
            .builder
            .properties_mut()
            .unregister(key);
    }

    /// Removes every global super-property.
    pub fn clear_super_properties(&self) {
        lock(&self.shared.core).builder.properties_mut().clear();
    }

    /// Registers properties that are dropped when the current session ends.
    pub fn register_session_properties(&self, properties: Attributes) {
        lock(&self.shared.core)
            .builder
            .properties_mut()
            .register_session(properties);
    }

    /// Identifies the user and records a login event. Returns `None` when that
    /// user was already logged in.
    pub fn login_user(&self, user_id: impl Into<String>) -> Option<TrackOutcome> {
        self.login(user_id.into(), None)
    }

    /// Like [`Tracker::login_user`], also recording an account name.
    pub fn login_user_with_account(
        &self,
        user_id: impl Into<String>,
        account: impl Into<String>,
    ) -> Option<TrackOutcome> {
        self.login(user_id.into(), Some(account.into()))
    }

    /// Records a logout event, then clears the identity. Returns `None` when
    /// nobody was logged in.
    pub fn logout_user(&self) -> Option<TrackOutcome> {
        let recorded = {
            let mut core = lock(&self.shared.core);
            core.identity.current_user_id()?;
            let mut queue = lock(&self.shared.queue);
            let recorded = self.record_locked(&mut core, &mut queue, |core, queue| {
                let draft = EventDraft::new(internal::USER_LOGOUT).must_in_session(false);
                let (id, event) = core
                    .builder
                    .track_internal(draft, &core.identity, queue, Instant::now())?;
                Ok((id, event.seq))
            });
            if let Some(user) = core.identity.logout() {
                tracing::info!(user_id = %user, "user logged out");
            }
            recorded
        };
        Some(self.finish(recorded))
    }

    /// Identified user, if any.
    pub fn current_user_id(&self) -> Option<String> {
        lock(&self.shared.core)
            .identity
            .current_user_id()
            .map(str::to_string)
    }

    /// Active session, if any.
    pub fn current_session_id(&self) -> Option<SessionId> {
        lock(&self.shared.core).identity.current_session_id().cloned()
    }

    /// App came to the foreground; starts a session if none is active.
    pub fn enter_foreground(&self) -> Option<SessionId> {
        let (session, recorded) = {
            let mut core = lock(&self.shared.core);
            let mut queue = lock(&self.shared.queue);
            let SessionTransition::Started(id) = core.identity.enter_foreground(Instant::now())?
            else {
                return None;
            };
            tracing::info!(session_id = %id.as_str(), "session started");
            let recorded = self.record_locked(&mut core, &mut queue, |core, queue| {
                let (rid, event) = core.builder.track_internal(
                    EventDraft::new(internal::SESSION_START),
                    &core.identity,
                    queue,
                    Instant::now(),
                )?;
                Ok((rid, event.seq))
            });
            (id, recorded)
        };
        self.finish(recorded);
        Some(session)
    }

    /// App went to the background; closes the session and requests an upload.
    pub fn enter_background(&self) -> Option<Duration> {
        let (length, recorded) = {
            let mut core = lock(&self.shared.core);
            let length = core.identity.session_length(Instant::now())?;
            let mut queue = lock(&self.shared.queue);
            let recorded = self.record_locked(&mut core, &mut queue, |core, queue| {
                let draft = EventDraft::new(internal::SESSION_CLOSE).cost_time(cost_seconds(length));
                let (rid, event) =
                    core.builder
                        .track_internal(draft, &core.identity, queue, Instant::now())?;
                Ok((rid, event.seq))
            });
            let TrackerCore { builder, identity } = &mut *core;
            identity.enter_background(Instant::now(), builder.properties_mut());
            tracing::info!(length_ms = length.as_millis() as u64, "session ended");
            (length, recorded)
        };
        self.finish(recorded);
        if self.shared.settings_tx.borrow().auto_upload {
            self.upload();
        }
        Some(length)
    }

    /// Default location for events that carry none.
    pub fn set_location(&self, latitude: f64, longitude: f64) {
        let location = (latitude.is_finite() && longitude.is_finite()).then_some(Location {
            latitude,
            longitude,
        });
        lock(&self.shared.core).builder.set_default_location(location);
    }

    /// People (profile) API bound to this tracker.
    pub fn people(&self) -> People {
        People {
            tracker: self.clone(),
        }
    }

    /// Requests an immediate drain. Returns false when the request was coalesced
    /// into a drain already in progress or already pending, or when the scheduler
    /// is backing off after a failed batch and would discard it.
    pub fn upload(&self) -> bool {
        if self.shared.draining.load(Ordering::SeqCst)
            || *self.shared.state_rx.borrow() == SchedulerState::Backoff
        {
            return false;
        }
        self.shared.trigger_tx.try_send(SchedulerMsg::Upload).is_ok()
    }

    /// Changes the automatic drain interval.
    pub fn set_upload_interval(&self, interval: Duration) {
        let interval = interval.max(Duration::from_millis(1));
        self.shared
            .settings_tx
            .send_modify(|s| s.interval = interval);
    }

    /// Changes the batch size and bulk trigger threshold.
    pub fn set_upload_bulk_size(&self, bulk_size: usize) {
        self.shared
            .settings_tx
            .send_modify(|s| s.bulk_size = bulk_size.max(1));
    }

    /// Turns interval and bulk triggers on or off.
    pub fn set_auto_upload_on(&self, auto_upload: bool) {
        self.shared
            .settings_tx
            .send_modify(|s| s.auto_upload = auto_upload);
    }

    /// Turns wifi-only uploading on or off.
    pub fn set_send_on_wifi_on(&self, wifi_only: bool) {
        self.shared
            .settings_tx
            .send_modify(|s| s.wifi_only = wifi_only);
    }

    /// Current upload settings.
    pub fn upload_settings(&self) -> UploadSettings {
        *self.shared.settings_tx.borrow()
    }

    /// Device id reported to the collector.
    pub fn device_id(&self) -> String {
        self.shared
            .device_id_override
            .clone()
            .unwrap_or_else(|| self.shared.context.context().device_id)
    }

    /// Current scheduler state.
    pub fn scheduler_state(&self) -> SchedulerState {
        *self.shared.state_rx.borrow()
    }

    /// Receiver for scheduler state changes.
    pub fn watch_scheduler_state(&self) -> watch::Receiver<SchedulerState> {
        self.shared.state_rx.clone()
    }

    /// Records waiting for their first or next send attempt.
    pub fn pending_count(&self) -> usize {
        lock(&self.shared.queue).pending_len()
    }

    /// Records owned by the queue, pending or in flight.
    pub fn queued_count(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    /// Stops the scheduler after any in-progress batch settles and flushes storage.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.shared
            .trigger_tx
            .send(SchedulerMsg::Shutdown { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    fn login(&self, user_id: String, account: Option<String>) -> Option<TrackOutcome> {
        let recorded = {
            let mut core = lock(&self.shared.core);
            if !core.identity.login(user_id.clone(), account) {
                return None;
            }
            tracing::info!(user_id = %user_id, "user logged in");
            let mut queue = lock(&self.shared.queue);
            self.record_locked(&mut core, &mut queue, |core, queue| {
                let draft = EventDraft::new(internal::USER_LOGIN).must_in_session(false);
                let (id, event) = core
                    .builder
                    .track_internal(draft, &core.identity, queue, Instant::now())?;
                Ok((id, event.seq))
            })
        };
        Some(self.finish(recorded))
    }

    fn track_internal(&self, draft: EventDraft) -> TrackOutcome {
        self.record(|core, queue| {
            let (id, event) = core
                .builder
                .track_internal(draft, &core.identity, queue, Instant::now())?;
            Ok((id, event.seq))
        })
    }

    fn track_profile(&self, op: ProfileOp) -> TrackOutcome {
        let policy = self.shared.anonymous_profiles;
        let kind = op.kind();
        let outcome = self.record(|core, queue| {
            let (id, mutation) =
                core.builder
                    .track_profile(op, &core.identity, policy, queue)?;
            Ok((id, mutation.seq))
        });
        tracing::debug!(kind, ?outcome, "profile mutation");
        outcome
    }

    fn record<F>(&self, f: F) -> TrackOutcome
    where
        F: FnOnce(&mut TrackerCore, &mut PersistentQueue) -> Result<(RecordId, SeqNo), TrackError>,
    {
        let recorded = {
            let mut core = lock(&self.shared.core);
            let mut queue = lock(&self.shared.queue);
            self.record_locked(&mut core, &mut queue, f)
        };
        self.finish(recorded)
    }

    /// Runs `f` under both locks (core first, then queue) and applies the capacity bound.
    fn record_locked<F>(
        &self,
        core: &mut TrackerCore,
        queue: &mut PersistentQueue,
        f: F,
    ) -> Recorded
    where
        F: FnOnce(&mut TrackerCore, &mut PersistentQueue) -> Result<(RecordId, SeqNo), TrackError>,
    {
        let result = f(core, queue);
        let evicted = if result.is_ok() {
            queue
                .evict_oldest_if_over_capacity(self.shared.queue_capacity)
                .unwrap_or_else(|err| {
                    tracing::warn!(error = %err, "capacity eviction failed");
                    Vec::new()
                })
        } else {
            Vec::new()
        };
        Recorded {
            result,
            evicted,
            pending: queue.pending_len(),
        }
    }

    /// Publishes events for a recorded call and triggers a bulk drain when due.
    fn finish(&self, recorded: Recorded) -> TrackOutcome {
        let Recorded {
            result,
            evicted,
            pending,
        } = recorded;

        if !evicted.is_empty() {
            let _ = self.shared.events_tx.send(TrackerEvent::Evicted { ids: evicted });
        }

        match result {
            Ok((record_id, seq)) => {
                let _ = self
                    .shared
                    .events_tx
                    .send(TrackerEvent::Queued { record_id, seq });
                let settings = *self.shared.settings_tx.borrow();
                if settings.auto_upload && pending >= settings.bulk_size {
                    self.upload();
                }
                TrackOutcome::Queued { record_id, seq }
            }
            Err(TrackError::Rejected(reason)) => {
                tracing::debug!(?reason, "tracking call rejected");
                let _ = self.shared.events_tx.send(TrackerEvent::Rejected { reason });
                TrackOutcome::Rejected(reason)
            }
            Err(TrackError::Queue(err)) => {
                tracing::warn!(error = %err, "failed to persist record");
                TrackOutcome::Failed
            }
        }
    }
}

struct Recorded {
    result: Result<(RecordId, SeqNo), TrackError>,
    evicted: Vec<RecordId>,
    pending: usize,
}

/// People API: profile mutations for the current user.
#[derive(Clone)]
pub struct People {
    tracker: Tracker,
}

impl People {
    /// Overwrites profile properties.
    pub fn set(&self, properties: Attributes) -> TrackOutcome {
        self.tracker.track_profile(ProfileOp::Set { properties })
    }

    /// Overwrites one profile property.
    pub fn set_one(&self, key: impl Into<String>, value: impl Into<Scalar>) -> TrackOutcome {
        self.tracker.track_profile(ProfileOp::set_one(key, value))
    }

    /// Sets properties only where the profile has no value yet.
    pub fn set_once(&self, properties: Attributes) -> TrackOutcome {
        self.tracker.track_profile(ProfileOp::SetOnce { properties })
    }

    /// Sets one profile property if it has no value yet.
    pub fn set_once_one(&self, key: impl Into<String>, value: impl Into<Scalar>) -> TrackOutcome {
        let mut properties = Attributes::new();
        properties.insert(key.into(), value.into());
        self.set_once(properties)
    }

    /// Removes one profile property.
    pub fn unset(&self, key: impl Into<String>) -> TrackOutcome {
        self.tracker.track_profile(ProfileOp::Unset {
            keys: vec![key.into()],
        })
    }

    /// Deletes the whole profile.
    pub fn delete_user(&self) -> TrackOutcome {
        self.tracker.track_profile(ProfileOp::Delete)
    }

    /// Records a charge.
    pub fn track_charge(&self, amount: f64) -> TrackOutcome {
        self.track_charge_with_properties(amount, Attributes::new())
    }

    /// Records a charge with segmentation properties.
    pub fn track_charge_with_properties(&self, amount: f64, properties: Attributes) -> TrackOutcome {
        self.tracker
            .track_profile(ProfileOp::Charge { amount, properties })
    }

    /// Deletes the charge history.
    pub fn clear_charges(&self) -> TrackOutcome {
        self.tracker.track_profile(ProfileOp::ClearCharges)
    }
}
