use std::time::Duration;

use serde::Deserialize;

use crate::{profile::AnonymousProfilePolicy, upload::retry::RetryPolicy};

/// Tracker configuration fixed at [`crate::runtime::handle::start_tracker`].
///
/// Every field has a default, so hosts may deserialize a partial JSON object.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Collector-issued application key.
    pub app_key: String,
    /// Host application version.
    pub app_version: String,
    /// Distribution channel.
    pub app_channel: String,
    /// Upload on the interval timer and when the bulk size is reached.
    pub auto_upload: bool,
    /// Defer uploads while not on wifi.
    pub send_on_wifi_only: bool,
    /// Interval between automatic drains.
    pub upload_interval_ms: u64,
    /// Records per batch, and the pending count that triggers a drain.
    pub upload_bulk_size: usize,
    /// Maximum live records kept on device before the oldest pending ones are dropped.
    pub queue_capacity: usize,
    /// Per-batch send timeout.
    pub request_timeout_ms: u64,
    /// Backoff after the first failed batch.
    pub retry_base_delay_ms: u64,
    /// Backoff ceiling.
    pub retry_max_delay_ms: u64,
    /// Serialized size above which a single record is quarantined.
    pub max_record_bytes: usize,
    /// Handling of profile mutations without an identified user.
    pub anonymous_profiles: AnonymousProfilePolicy,
    /// Host-supplied device identifier that replaces the provider's.
    pub custom_udid: Option<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            app_key: String::new(),
            app_version: String::new(),
            app_channel: String::new(),
            auto_upload: true,
            send_on_wifi_only: false,
            upload_interval_ms: 15_000,
            upload_bulk_size: 100,
            queue_capacity: 10_000,
            request_timeout_ms: 30_000,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 300_000,
            max_record_bytes: 64 * 1024,
            anonymous_profiles: AnonymousProfilePolicy::Queue,
            custom_udid: None,
        }
    }
}

impl TrackerConfig {
    /// Defaults for the given application identity.
    pub fn new(
        app_key: impl Into<String>,
        app_version: impl Into<String>,
        app_channel: impl Into<String>,
    ) -> Self {
        Self {
            app_key: app_key.into(),
            app_version: app_version.into(),
            app_channel: app_channel.into(),
            ..Self::default()
        }
    }

    /// Backoff policy built from the retry fields.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_base_delay_ms, self.retry_max_delay_ms)
    }

    /// Send timeout, at least one millisecond.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }

    pub(crate) fn upload_settings(&self) -> UploadSettings {
        UploadSettings {
            interval: Duration::from_millis(self.upload_interval_ms.max(1)),
            bulk_size: self.upload_bulk_size.max(1),
            auto_upload: self.auto_upload,
            wifi_only: self.send_on_wifi_only,
        }
    }
}

/// Upload knobs that may change while the tracker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadSettings {
    /// Interval between automatic drains.
    pub interval: Duration,
    /// Records per batch and the bulk trigger threshold.
    pub bulk_size: usize,
    /// Whether interval and bulk triggers are active.
    pub auto_upload: bool,
    /// Whether uploads wait for wifi.
    pub wifi_only: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: TrackerConfig =
            serde_json::from_str(r#"{"app_key":"k","upload_bulk_size":20,"anonymous_profiles":"reject"}"#)
                .expect("config");
        assert_eq!(cfg.app_key, "k");
        assert_eq!(cfg.upload_bulk_size, 20);
        assert_eq!(cfg.upload_interval_ms, 15_000);
        assert_eq!(cfg.anonymous_profiles, AnonymousProfilePolicy::Reject);
        assert!(cfg.auto_upload);
    }

    #[test]
    fn zero_values_are_clamped() {
        let cfg = TrackerConfig {
            upload_bulk_size: 0,
            upload_interval_ms: 0,
            ..TrackerConfig::default()
        };
        let s = cfg.upload_settings();
        assert_eq!(s.bulk_size, 1);
        assert_eq!(s.interval, Duration::from_millis(1));
    }
}
