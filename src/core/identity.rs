//! User identity and foreground-session tracking.

use std::time::{Duration, Instant};

use crate::types::{SessionId, UserId};

use super::properties::PropertyStore;

/// Who the current events are attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum IdentityState {
    /// No user logged in.
    #[default]
    Anonymous,
    /// A user logged in via `login_user`.
    Identified {
        /// Application user id.
        user_id: UserId,
        /// Optional account name supplied at login.
        account: Option<String>,
    },
}

/// Foreground/background session state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    /// App is in the background; no session is active.
    #[default]
    Background,
    /// App is in the foreground.
    Foreground {
        /// Id minted when the session began.
        id: SessionId,
        /// When the session began.
        started: Instant,
    },
}

/// Result of a lifecycle transition that actually changed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTransition {
    /// A new session began.
    Started(SessionId),
    /// A session ended after `length`.
    Ended {
        /// Id of the finished session.
        id: SessionId,
        /// Session length.
        length: Duration,
    },
}

/// Tracks identity and session; lives inside the tracker's core mutex.
#[derive(Debug, Default)]
pub struct IdentityManager {
    identity: IdentityState,
    session: SessionState,
}

impl IdentityManager {
    /// Anonymous, backgrounded manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current user id, if identified.
    pub fn current_user_id(&self) -> Option<&str> {
        match &self.identity {
            IdentityState::Identified { user_id, .. } => Some(user_id),
            IdentityState::Anonymous => None,
        }
    }

    /// Current session id, if a session is active.
    pub fn current_session_id(&self) -> Option<&SessionId> {
        match &self.session {
            SessionState::Foreground { id, .. } => Some(id),
            SessionState::Background => None,
        }
    }

    /// Identity state.
    pub fn identity(&self) -> &IdentityState {
        &self.identity
    }

    /// Returns true while in the foreground.
    pub fn in_session(&self) -> bool {
        matches!(self.session, SessionState::Foreground { .. })
    }

    /// Elapsed time of the active session, if any.
    pub fn session_length(&self, now: Instant) -> Option<Duration> {
        match &self.session {
            SessionState::Foreground { started, .. } => Some(now.saturating_duration_since(*started)),
            SessionState::Background => None,
        }
    }

    /// Sets the logged-in user; returns false when that user was already identified.
    pub fn login(&mut self, user_id: impl Into<UserId>, account: Option<String>) -> bool {
        let user_id = user_id.into();
        if self.current_user_id() == Some(user_id.as_str()) {
            if let IdentityState::Identified { account: current, .. } = &mut self.identity {
                if account.is_some() {
                    *current = account;
                }
            }
            return false;
        }
        self.identity = IdentityState::Identified { user_id, account };
        true
    }

    /// Returns to anonymous; yields the user that was logged out.
    pub fn logout(&mut self) -> Option<UserId> {
        match std::mem::take(&mut self.identity) {
            IdentityState::Identified { user_id, .. } => Some(user_id),
            IdentityState::Anonymous => None,
        }
    }

    /// Background → foreground; mints a new session id.
    pub fn enter_foreground(&mut self, now: Instant) -> Option<SessionTransition> {
        if self.in_session() {
            return None;
        }
        let id = SessionId::random();
        self.session = SessionState::Foreground {
            id: id.clone(),
            started: now,
        };
        Some(SessionTransition::Started(id))
    }

    /// Foreground → background; resets session-scoped properties.
    pub fn enter_background(
        &mut self,
        now: Instant,
        properties: &mut PropertyStore,
    ) -> Option<SessionTransition> {
        match std::mem::take(&mut self.session) {
            SessionState::Foreground { id, started } => {
                properties.reset_session();
                Some(SessionTransition::Ended {
                    id,
                    length: now.saturating_duration_since(started),
                })
            }
            SessionState::Background => None,
        }
    }
}
