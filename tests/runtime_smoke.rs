use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use serde_json::Value;
use tokio::sync::broadcast;

use datrack::{
    core::builder::Rejection,
    event::{EventDraft, ExceptionReport},
    persist::memory::MemoryStorage,
    profile::AnonymousProfilePolicy,
    runtime::{
        config::TrackerConfig,
        events::TrackerEvent,
        handle::{RuntimeError, TrackOutcome, Tracker, TrackerParts, start_tracker},
    },
    types::{NetworkType, RecordId},
    upload::{
        codec::NoCompression,
        scheduler::SchedulerState,
        transport::{Transport, TransportError},
    },
};

struct MockTransport {
    bodies: Mutex<Vec<Vec<u8>>>,
    attempts: AtomicUsize,
    fail: AtomicBool,
    wifi: AtomicBool,
    delay: Duration,
}

impl MockTransport {
    fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    fn with_delay(delay: Duration) -> Self {
        Self {
            bodies: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            wifi: AtomicBool::new(true),
            delay,
        }
    }

    fn batches(&self) -> Vec<Value> {
        self.bodies
            .lock()
            .expect("lock")
            .iter()
            .map(|b| serde_json::from_slice(b).expect("json body"))
            .collect()
    }

    fn records(&self) -> Vec<Value> {
        self.batches()
            .into_iter()
            .flat_map(|b| b["records"].as_array().cloned().unwrap_or_default())
            .collect()
    }
}

impl Transport for MockTransport {
    fn send(&self, batch: &[u8]) -> Result<(), TransportError> {
        std::thread::sleep(self.delay);
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Status(503));
        }
        self.bodies.lock().expect("lock").push(batch.to_vec());
        Ok(())
    }

    fn network_type(&self) -> NetworkType {
        if self.wifi.load(Ordering::SeqCst) {
            NetworkType::Wifi
        } else {
            NetworkType::Cellular
        }
    }
}

fn manual_config() -> TrackerConfig {
    TrackerConfig {
        auto_upload: false,
        upload_interval_ms: 60_000,
        retry_base_delay_ms: 50,
        retry_max_delay_ms: 200,
        ..TrackerConfig::new("key", "1.0", "test")
    }
}

fn start(config: TrackerConfig, transport: &Arc<MockTransport>) -> Tracker {
    let parts = TrackerParts::new(Box::new(MemoryStorage::new()), transport.clone())
        .with_compressor(Box::new(NoCompression));
    start_tracker(config, parts).expect("start")
}

async fn next_matching<F>(sub: &mut broadcast::Receiver<TrackerEvent>, mut pred: F) -> TrackerEvent
where
    F: FnMut(&TrackerEvent) -> bool,
{
    loop {
        let evt = tokio::time::timeout(Duration::from_secs(3), sub.recv())
            .await
            .expect("event before timeout")
            .expect("recv");
        if pred(&evt) {
            return evt;
        }
    }
}

async fn delivered(sub: &mut broadcast::Receiver<TrackerEvent>) -> Vec<RecordId> {
    match next_matching(sub, |e| matches!(e, TrackerEvent::Delivered { .. })).await {
        TrackerEvent::Delivered { ids } => ids,
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn session_required_events_are_rejected_without_persisting() {
    let transport = Arc::new(MockTransport::new());
    let tracker = start(manual_config(), &transport);
    let mut sub = tracker.subscribe();

    let outcome = tracker.track_event(EventDraft::new("tap"));
    assert_eq!(outcome, TrackOutcome::Rejected(Rejection::NoActiveSession));
    assert_eq!(tracker.pending_count(), 0);
    let evt = next_matching(&mut sub, |_| true).await;
    assert_eq!(
        evt,
        TrackerEvent::Rejected {
            reason: Rejection::NoActiveSession
        }
    );

    assert!(tracker.track_event(EventDraft::new("tap").must_in_session(false)).is_queued());
    assert_eq!(
        tracker.track_event(EventDraft::new("da_spoof").must_in_session(false)),
        TrackOutcome::Rejected(Rejection::ReservedEventId)
    );
    assert_eq!(tracker.pending_count(), 1);
    tracker.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn manual_upload_delivers_batch_in_sequence_order() {
    let transport = Arc::new(MockTransport::new());
    let tracker = start(manual_config(), &transport);
    let mut sub = tracker.subscribe();

    assert!(tracker.enter_foreground().is_some());
    let mut props = datrack::types::Attributes::new();
    props.insert("plan".to_string(), "pro".into());
    tracker.register_super_properties(props);
    for i in 0..3 {
        assert!(tracker.track_event(EventDraft::new(format!("view_{i}"))).is_queued());
    }
    assert_eq!(tracker.pending_count(), 4);

    assert!(tracker.upload());
    let ids = delivered(&mut sub).await;
    assert_eq!(ids.len(), 4);
    assert_eq!(tracker.pending_count(), 0);

    let batches = transport.batches();
    assert_eq!(batches.len(), 1);
    let header = &batches[0]["header"];
    assert_eq!(header["app_key"], "key");
    assert_eq!(header["record_count"], 4);

    let records = transport.records();
    assert_eq!(records[0]["event_id"], "da_session_start");
    let seqs: Vec<u64> = records.iter().filter_map(|r| r["seq"].as_u64()).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    let session = records[0]["session_id"].clone();
    assert!(records.iter().all(|r| r["session_id"] == session));
    assert_eq!(records[1]["attributes"]["plan"], "pro");

    tracker.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn timer_sets_cost_time_once() {
    let transport = Arc::new(MockTransport::new());
    let tracker = start(manual_config(), &transport);
    let mut sub = tracker.subscribe();

    tracker.enter_foreground();
    tracker.track_timer("load");
    tokio::time::sleep(Duration::from_millis(700)).await;
    tracker.track_event(EventDraft::new("load"));
    tracker.track_event(EventDraft::new("load"));

    tracker.upload();
    delivered(&mut sub).await;
    let loads: Vec<Value> = transport
        .records()
        .into_iter()
        .filter(|r| r["event_id"] == "load")
        .collect();
    assert_eq!(loads.len(), 2);
    assert_eq!(loads[0]["cost_time"], 1);
    assert_eq!(loads[1]["cost_time"], 0);
    tracker.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn failed_batch_backs_off_and_keeps_records_pending() {
    let transport = Arc::new(MockTransport::new());
    transport.fail.store(true, Ordering::SeqCst);
    let tracker = start(manual_config(), &transport);
    let mut sub = tracker.subscribe();

    tracker.enter_foreground();
    tracker.track_event(EventDraft::new("buy"));
    assert!(tracker.upload());

    let evt = next_matching(&mut sub, |e| matches!(e, TrackerEvent::UploadFailed { .. })).await;
    assert_eq!(
        evt,
        TrackerEvent::UploadFailed {
            error: TransportError::Status(503),
            failures: 1
        }
    );
    assert_eq!(tracker.pending_count(), 2);
    assert_eq!(tracker.queued_count(), 2);

    transport.fail.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(tracker.upload());
    assert_eq!(delivered(&mut sub).await.len(), 2);
    assert_eq!(transport.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(tracker.queued_count(), 0);
    tracker.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn upload_is_refused_while_backing_off() {
    let transport = Arc::new(MockTransport::new());
    transport.fail.store(true, Ordering::SeqCst);
    let config = TrackerConfig {
        retry_base_delay_ms: 600,
        retry_max_delay_ms: 600,
        ..manual_config()
    };
    let tracker = start(config, &transport);
    let mut sub = tracker.subscribe();
    let mut state = tracker.watch_scheduler_state();

    tracker.enter_foreground();
    assert!(tracker.upload());
    next_matching(&mut sub, |e| matches!(e, TrackerEvent::UploadFailed { .. })).await;
    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|s| *s == SchedulerState::Backoff),
    )
    .await
    .expect("backoff before timeout")
    .expect("state channel");
    assert!(!tracker.upload());

    transport.fail.store(false, Ordering::SeqCst);
    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|s| *s == SchedulerState::Waiting),
    )
    .await
    .expect("waiting before timeout")
    .expect("state channel");
    assert!(tracker.upload());
    assert_eq!(delivered(&mut sub).await.len(), 1);
    assert_eq!(transport.attempts.load(Ordering::SeqCst), 2);
    tracker.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn wifi_only_defers_until_wifi() {
    let transport = Arc::new(MockTransport::new());
    transport.wifi.store(false, Ordering::SeqCst);
    let config = TrackerConfig {
        send_on_wifi_only: true,
        ..manual_config()
    };
    let tracker = start(config, &transport);
    let mut sub = tracker.subscribe();

    tracker.enter_foreground();
    tracker.upload();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(transport.attempts.load(Ordering::SeqCst), 0);
    assert_eq!(tracker.pending_count(), 1);

    transport.wifi.store(true, Ordering::SeqCst);
    assert!(tracker.upload());
    assert_eq!(delivered(&mut sub).await.len(), 1);
    tracker.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn upload_requests_during_drain_are_coalesced() {
    let transport = Arc::new(MockTransport::with_delay(Duration::from_millis(300)));
    let tracker = start(manual_config(), &transport);
    let mut sub = tracker.subscribe();
    let mut state = tracker.watch_scheduler_state();

    tracker.enter_foreground();
    assert!(tracker.upload());
    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|s| *s == SchedulerState::Draining),
    )
    .await
    .expect("draining before timeout")
    .expect("state channel");
    assert!(!tracker.upload());

    delivered(&mut sub).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
    tracker.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn reaching_bulk_size_triggers_upload_when_auto() {
    let transport = Arc::new(MockTransport::new());
    let config = TrackerConfig {
        auto_upload: true,
        upload_bulk_size: 3,
        ..manual_config()
    };
    let tracker = start(config, &transport);
    let mut sub = tracker.subscribe();

    tracker.enter_foreground();
    tracker.track_event(EventDraft::new("a"));
    tracker.track_event(EventDraft::new("b"));
    assert_eq!(delivered(&mut sub).await.len(), 3);
    tracker.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn background_closes_session_with_length() {
    let transport = Arc::new(MockTransport::new());
    let config = TrackerConfig {
        auto_upload: true,
        ..manual_config()
    };
    let tracker = start(config, &transport);
    let mut sub = tracker.subscribe();

    let session = tracker.enter_foreground().expect("session");
    assert!(tracker.enter_foreground().is_none());
    assert!(tracker.enter_background().is_some());
    assert!(tracker.current_session_id().is_none());
    assert!(tracker.enter_background().is_none());

    // Going to the background requests an upload.
    delivered(&mut sub).await;
    let records = transport.records();
    let close = records
        .iter()
        .find(|r| r["event_id"] == "da_session_close")
        .expect("close event");
    assert_eq!(close["session_id"], session.as_str());
    tracker.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn people_follow_identity_and_policy() {
    let transport = Arc::new(MockTransport::new());
    let config = TrackerConfig {
        anonymous_profiles: AnonymousProfilePolicy::Reject,
        ..manual_config()
    };
    let tracker = start(config, &transport);
    let mut sub = tracker.subscribe();
    let people = tracker.people();

    assert_eq!(
        people.set_one("plan", "pro"),
        TrackOutcome::Rejected(Rejection::AnonymousProfile)
    );
    assert!(tracker.logout_user().is_none());
    assert!(tracker.login_user("u-1").is_some_and(|o| o.is_queued()));
    assert!(tracker.login_user("u-1").is_none());
    assert!(people.set_one("plan", "pro").is_queued());
    assert!(people.track_charge(9.5).is_queued());
    assert_eq!(
        people.track_charge(f64::NAN),
        TrackOutcome::Rejected(Rejection::InvalidProfileOp)
    );
    assert!(tracker.track_exception(ExceptionReport::new("Panic", "index out of range")).is_queued());
    assert!(tracker.logout_user().is_some_and(|o| o.is_queued()));
    assert!(tracker.current_user_id().is_none());

    tracker.upload();
    delivered(&mut sub).await;
    let records = transport.records();
    let kinds: Vec<String> = records
        .iter()
        .map(|r| {
            r["event_id"]
                .as_str()
                .or_else(|| r["op"].as_str())
                .unwrap_or_default()
                .to_string()
        })
        .collect();
    assert_eq!(
        kinds,
        vec!["da_u_login", "set", "charge", "da_exception", "da_u_logout"]
    );
    assert!(records.iter().all(|r| r["user_id"] == "u-1"));
    tracker.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn shutdown_stops_scheduler() {
    let transport = Arc::new(MockTransport::new());
    let tracker = start(manual_config(), &transport);
    tracker.shutdown().await.expect("shutdown");
    assert_eq!(tracker.scheduler_state(), SchedulerState::Idle);
    assert!(matches!(
        tracker.shutdown().await,
        Err(RuntimeError::ChannelClosed)
    ));
    assert!(!tracker.upload());
}

#[tokio::test]
async fn concurrent_producers_get_unique_ordered_sequence_numbers() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 25;

    let transport = Arc::new(MockTransport::new());
    let tracker = start(manual_config(), &transport);
    let mut sub = tracker.subscribe();

    let mut queued: Vec<(RecordId, u64)> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..THREADS)
            .map(|t| {
                let tracker = tracker.clone();
                scope.spawn(move || {
                    (0..PER_THREAD)
                        .map(|i| {
                            let draft = EventDraft::new(format!("t{t}_e{i}")).must_in_session(false);
                            match tracker.track_event(draft) {
                                TrackOutcome::Queued { record_id, seq } => (record_id, seq),
                                other => panic!("not queued: {other:?}"),
                            }
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().expect("producer thread"))
            .collect()
    });

    assert_eq!(queued.len(), THREADS * PER_THREAD);
    let mut seqs: Vec<u64> = queued.iter().map(|(_, seq)| *seq).collect();
    seqs.sort_unstable();
    seqs.dedup();
    assert_eq!(seqs.len(), THREADS * PER_THREAD);

    // Queue order is record id order; it must agree with sequence order.
    queued.sort_unstable_by_key(|(id, _)| *id);
    assert!(queued.windows(2).all(|w| w[0].1 < w[1].1));

    assert!(tracker.upload());
    let mut sent = 0;
    while sent < THREADS * PER_THREAD {
        sent += delivered(&mut sub).await.len();
    }
    let sent_seqs: Vec<u64> = transport
        .records()
        .iter()
        .filter_map(|r| r["seq"].as_u64())
        .collect();
    let expected: Vec<u64> = queued.iter().map(|(_, seq)| *seq).collect();
    assert_eq!(sent_seqs, expected);
    tracker.shutdown().await.expect("shutdown");
}
