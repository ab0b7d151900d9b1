//! Super-properties and named duration timers.

use std::time::{Duration, Instant};

use hashbrown::HashMap;

use crate::types::{Attributes, Scalar};

/// Super-properties merged into every event, plus session-scoped properties.
///
/// Not synchronized on its own; the tracker keeps it inside its core mutex so
/// reads by the builder and writes by callers are linearized.
#[derive(Debug, Default)]
pub struct PropertyStore {
    global: HashMap<String, Scalar>,
    session: HashMap<String, Scalar>,
}

impl PropertyStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy of the global super-properties.
    pub fn snapshot(&self) -> Attributes {
        self.global
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Global super-properties with session-scoped properties merged over them.
    pub fn merged_snapshot(&self) -> Attributes {
        let mut out = self.snapshot();
        for (k, v) in &self.session {
            out.insert(k.clone(), v.clone());
        }
        out
    }

    /// Registers properties, overwriting existing keys.
    pub fn register(&mut self, properties: Attributes) {
        for (k, v) in properties {
            if v.is_valid() {
                self.global.insert(k, v);
            }
        }
    }

    /// Registers properties without overwriting, unless the current value equals `default`.
    pub fn register_once(&mut self, properties: Attributes, default: Option<&Scalar>) {
        for (k, v) in properties {
            if !v.is_valid() {
                continue;
            }
            let replace = match self.global.get(&k) {
                None => true,
                Some(current) => default.is_some_and(|d| d == current),
            };
            if replace {
                self.global.insert(k, v);
            }
        }
    }

    /// Removes one property; absent keys are ignored.
    pub fn unregister(&mut self, key: &str) {
        self.global.remove(key);
    }

    /// Removes all global super-properties.
    pub fn clear(&mut self) {
        self.global.clear();
    }

    /// Registers properties that live until the current session ends.
    pub fn register_session(&mut self, properties: Attributes) {
        for (k, v) in properties {
            if v.is_valid() {
                self.session.insert(k, v);
            }
        }
    }

    /// Drops all session-scoped properties.
    pub fn reset_session(&mut self) {
        self.session.clear();
    }
}

/// Pending duration timers keyed by event name.
#[derive(Debug, Default)]
pub struct TimerRegistry {
    started: HashMap<String, Instant>,
}

impl TimerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts (or restarts) the timer for `event_id` at `at`.
    pub fn start_at(&mut self, event_id: impl Into<String>, at: Instant) {
        self.started.insert(event_id.into(), at);
    }

    /// Removes the timer for `event_id` and returns its elapsed time at `now`.
    pub fn consume_at(&mut self, event_id: &str, now: Instant) -> Option<Duration> {
        self.started
            .remove(event_id)
            .map(|start| now.saturating_duration_since(start))
    }

    /// Drops every timer.
    pub fn clear(&mut self) {
        self.started.clear();
    }

    /// Number of running timers.
    pub fn len(&self) -> usize {
        self.started.len()
    }

    /// Returns true when no timer is running.
    pub fn is_empty(&self) -> bool {
        self.started.is_empty()
    }
}

/// Rounds an elapsed duration to whole seconds for the cost-time field.
pub fn cost_seconds(elapsed: Duration) -> u32 {
    let secs = elapsed.as_secs_f64().round();
    if secs >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        secs as u32
    }
}
