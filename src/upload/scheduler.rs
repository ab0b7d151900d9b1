use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
};

use crate::{
    context::DeviceContextProvider,
    core::{lock, queue::PersistentQueue},
    record::QueueRecord,
    runtime::{config::UploadSettings, events::TrackerEvent},
    types::{NetworkType, RecordId},
};

use super::{
    codec::BatchEncoder,
    retry::RetryPolicy,
    transport::{Transport, TransportError},
};

/// Observable scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Not started yet, or stopped.
    Idle,
    /// Waiting for the next tick or a manual trigger.
    Waiting,
    /// Draining the queue.
    Draining,
    /// Sleeping after a failed batch.
    Backoff,
}

pub(crate) enum SchedulerMsg {
    Upload,
    Shutdown { resp: oneshot::Sender<()> },
}

pub(crate) struct SchedulerParts {
    pub(crate) queue: Arc<Mutex<PersistentQueue>>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) context: Arc<dyn DeviceContextProvider>,
    pub(crate) device_id_override: Option<String>,
    pub(crate) encoder: BatchEncoder,
    pub(crate) retry: RetryPolicy,
    pub(crate) request_timeout: Duration,
    pub(crate) events_tx: broadcast::Sender<TrackerEvent>,
    pub(crate) settings_rx: watch::Receiver<UploadSettings>,
    pub(crate) state_tx: watch::Sender<SchedulerState>,
    pub(crate) draining: Arc<AtomicBool>,
}

enum DrainOutcome {
    Drained,
    Failed(TransportError),
}

enum Wake {
    Tick,
    Manual,
    Stop(Option<oneshot::Sender<()>>),
}

pub(crate) fn spawn_scheduler(
    parts: SchedulerParts,
    rx: mpsc::Receiver<SchedulerMsg>,
) -> JoinHandle<()> {
    tokio::spawn(run(parts, rx))
}

async fn run(mut parts: SchedulerParts, mut rx: mpsc::Receiver<SchedulerMsg>) {
    let mut settings = *parts.settings_rx.borrow_and_update();
    let mut failures: u32 = 0;
    let mut stop_resp = None;

    loop {
        parts.state_tx.send_replace(SchedulerState::Waiting);
        let wake = tokio::select! {
            _ = tokio::time::sleep(settings.interval) => Wake::Tick,
            changed = parts.settings_rx.changed() => {
                if changed.is_err() {
                    Wake::Stop(None)
                } else {
                    settings = *parts.settings_rx.borrow_and_update();
                    tracing::debug!(?settings, "upload settings changed");
                    continue;
                }
            }
            msg = rx.recv() => match msg {
                Some(SchedulerMsg::Upload) => Wake::Manual,
                Some(SchedulerMsg::Shutdown { resp }) => Wake::Stop(Some(resp)),
                None => Wake::Stop(None),
            },
        };

        match wake {
            Wake::Stop(resp) => {
                stop_resp = resp;
                break;
            }
            Wake::Tick if !settings.auto_upload => continue,
            Wake::Tick | Wake::Manual => {}
        }

        let network = parts.transport.network_type();
        if settings.wifi_only && network != NetworkType::Wifi {
            tracing::debug!(?network, "wifi-only upload deferred");
            continue;
        }

        match drain(&parts, &settings, network).await {
            DrainOutcome::Drained => failures = 0,
            DrainOutcome::Failed(error) => {
                failures = failures.saturating_add(1);
                let delay = parts.retry.delay_for_failures(failures);
                tracing::warn!(%error, failures, delay_ms = delay.as_millis() as u64, "upload failed, backing off");
                let _ = parts.events_tx.send(TrackerEvent::UploadFailed { error, failures });

                parts.state_tx.send_replace(SchedulerState::Backoff);
                let deadline = tokio::time::Instant::now() + delay;
                let stopped = loop {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => break None,
                        msg = rx.recv() => match msg {
                            Some(SchedulerMsg::Upload) => continue,
                            Some(SchedulerMsg::Shutdown { resp }) => break Some(Some(resp)),
                            None => break Some(None),
                        },
                    }
                };
                if let Some(resp) = stopped {
                    stop_resp = resp;
                    break;
                }
            }
        }

        // Triggers that arrived while draining are coalesced into the run that just ended.
        let mut stopped = None;
        while let Ok(msg) = rx.try_recv() {
            if let SchedulerMsg::Shutdown { resp } = msg {
                stopped = Some(resp);
                break;
            }
        }
        if let Some(resp) = stopped {
            stop_resp = Some(resp);
            break;
        }
    }

    drop(rx);
    parts.state_tx.send_replace(SchedulerState::Idle);
    if let Err(err) = lock(&parts.queue).flush() {
        tracing::warn!(error = %err, "queue flush on shutdown failed");
    }
    tracing::info!("upload scheduler stopped");
    if let Some(resp) = stop_resp {
        let _ = resp.send(());
    }
}

async fn drain(
    parts: &SchedulerParts,
    settings: &UploadSettings,
    network: NetworkType,
) -> DrainOutcome {
    parts.draining.store(true, Ordering::SeqCst);
    parts.state_tx.send_replace(SchedulerState::Draining);
    let outcome = drain_batches(parts, settings, network).await;
    parts.draining.store(false, Ordering::SeqCst);
    outcome
}

async fn drain_batches(
    parts: &SchedulerParts,
    settings: &UploadSettings,
    network: NetworkType,
) -> DrainOutcome {
    loop {
        let batch: Vec<QueueRecord> = {
            let mut queue = lock(&parts.queue);
            let batch: Vec<QueueRecord> = queue
                .peek_batch(settings.bulk_size)
                .into_iter()
                .cloned()
                .collect();
            let ids: Vec<RecordId> = batch.iter().map(|r| r.id).collect();
            queue.mark_in_flight(&ids);
            batch
        };
        if batch.is_empty() {
            return DrainOutcome::Drained;
        }
        let batch_ids: Vec<RecordId> = batch.iter().map(|r| r.id).collect();

        let mut device = parts.context.context();
        device.network = Some(network);
        if let Some(udid) = &parts.device_id_override {
            device.device_id = udid.clone();
        }

        let encoded = match parts.encoder.encode(&batch, &device, now_ms()) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::warn!(error = %err, records = batch_ids.len(), "batch encoding failed");
                fail(parts, &batch_ids);
                return DrainOutcome::Failed(TransportError::Network(format!("encode: {err}")));
            }
        };

        if !encoded.rejected.is_empty() {
            let ids: Vec<RecordId> = encoded.rejected.iter().map(|(id, _)| *id).collect();
            for (id, reason) in &encoded.rejected {
                tracing::warn!(record_id = *id, %reason, "quarantining unencodable record");
            }
            if let Err(err) = lock(&parts.queue).quarantine(&ids) {
                tracing::warn!(error = %err, "quarantine write failed");
            }
            let _ = parts.events_tx.send(TrackerEvent::Quarantined { ids });
        }
        if encoded.ids.is_empty() {
            continue;
        }

        tracing::debug!(records = encoded.ids.len(), bytes = encoded.body.len(), "sending batch");
        match send_with_timeout(parts, encoded.body).await {
            Ok(()) => {
                if let Err(err) = lock(&parts.queue).mark_delivered(&encoded.ids) {
                    tracing::warn!(error = %err, "removing delivered records failed");
                }
                tracing::debug!(records = encoded.ids.len(), "batch delivered");
                let _ = parts
                    .events_tx
                    .send(TrackerEvent::Delivered { ids: encoded.ids });
            }
            Err(error) => {
                fail(parts, &encoded.ids);
                return DrainOutcome::Failed(error);
            }
        }
    }
}

fn fail(parts: &SchedulerParts, ids: &[RecordId]) {
    if let Err(err) = lock(&parts.queue).mark_failed(ids) {
        tracing::warn!(error = %err, "persisting attempt counters failed");
    }
}

async fn send_with_timeout(parts: &SchedulerParts, body: Vec<u8>) -> Result<(), TransportError> {
    let transport = Arc::clone(&parts.transport);
    let send = tokio::task::spawn_blocking(move || transport.send(&body));
    match tokio::time::timeout(parts.request_timeout, send).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(TransportError::Network(format!("join error: {join}"))),
        Err(_) => Err(TransportError::Timeout),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
