//! Behavioral event record, caller-side draft, and exception reports.

use serde::{Deserialize, Serialize};

use crate::types::{Attributes, Location, Scalar, SeqNo, SessionId, UserId};

/// Maximum number of category segments kept on an event.
pub const MAX_CATEGORY_DEPTH: usize = 5;

/// Bounded, ordered category path (`cat1 -> cat2 -> ...`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryPath(Vec<String>);

impl CategoryPath {
    /// Builds a path, dropping segments deeper than [`MAX_CATEGORY_DEPTH`].
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            segments
                .into_iter()
                .take(MAX_CATEGORY_DEPTH)
                .map(Into::into)
                .collect(),
        )
    }

    /// Segments in order.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Returns true when no category was given.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Raw tracking call, as packaged by the caller-facing adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    /// Application-chosen event name.
    pub event_id: String,
    /// Category path; truncated again by the builder.
    pub categories: CategoryPath,
    /// Optional label.
    pub label: Option<String>,
    /// Cost time in seconds, `0` means unset.
    pub cost_time: u32,
    /// Optional explicit location.
    pub location: Option<Location>,
    /// Explicit attributes; win over super-properties.
    pub attributes: Attributes,
    /// Reject the event when no session is active.
    pub must_in_session: bool,
}

impl EventDraft {
    /// Draft with only an event id, requiring an active session.
    pub fn new(event_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            categories: CategoryPath::default(),
            label: None,
            cost_time: 0,
            location: None,
            attributes: Attributes::new(),
            must_in_session: true,
        }
    }

    /// Sets category path and label.
    pub fn category(mut self, categories: CategoryPath, label: impl Into<String>) -> Self {
        self.categories = categories;
        self.label = Some(label.into());
        self
    }

    /// Sets an explicit cost time in seconds.
    pub fn cost_time(mut self, seconds: u32) -> Self {
        self.cost_time = seconds;
        self
    }

    /// Sets an explicit location.
    pub fn location(mut self, latitude: f64, longitude: f64) -> Self {
        self.location = Some(Location {
            latitude,
            longitude,
        });
        self
    }

    /// Adds a single attribute.
    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Replaces all explicit attributes.
    pub fn attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Sets the must-in-session policy.
    pub fn must_in_session(mut self, must_in_session: bool) -> Self {
        self.must_in_session = must_in_session;
        self
    }
}

/// Fully materialized, immutable event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Sequence number used for collector-side ordering and dedup.
    pub seq: SeqNo,
    /// Event name.
    pub event_id: String,
    /// Category path, at most five segments.
    #[serde(default, skip_serializing_if = "CategoryPath::is_empty")]
    pub categories: CategoryPath,
    /// Optional label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Cost time in seconds, `0` when unset.
    #[serde(default)]
    pub cost_time: u32,
    /// Optional location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    /// Capture time in milliseconds since epoch.
    pub ts_ms: u64,
    /// Merged attributes.
    #[serde(default)]
    pub attributes: Attributes,
    /// Session the event was captured in; `None` for pre-session events.
    #[serde(default)]
    pub session_id: Option<SessionId>,
    /// Identified user, if any.
    #[serde(default)]
    pub user_id: Option<UserId>,
}

/// Structured exception surfaced by a crash/exception reporter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionReport {
    /// Exception name or type.
    pub name: String,
    /// Human-readable reason.
    pub reason: String,
    /// Optional captured call stack.
    pub callstack: Option<String>,
}

impl ExceptionReport {
    /// Report without a call stack.
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: reason.into(),
            callstack: None,
        }
    }

    /// Attaches a call stack.
    pub fn with_callstack(mut self, callstack: impl Into<String>) -> Self {
        self.callstack = Some(callstack.into());
        self
    }

    pub(crate) fn into_draft(self) -> EventDraft {
        let mut draft = EventDraft::new(internal::EXCEPTION)
            .attribute("name", self.name)
            .attribute("reason", self.reason)
            .must_in_session(false);
        if let Some(stack) = self.callstack {
            draft = draft.attribute("callstack", stack);
        }
        draft
    }
}

/// Event ids emitted by the SDK itself.
pub mod internal {
    /// Foreground session began.
    pub const SESSION_START: &str = "da_session_start";
    /// Foreground session ended.
    pub const SESSION_CLOSE: &str = "da_session_close";
    /// A user logged in.
    pub const USER_LOGIN: &str = "da_u_login";
    /// A user logged out.
    pub const USER_LOGOUT: &str = "da_u_logout";
    /// A reported exception.
    pub const EXCEPTION: &str = "da_exception";
}
