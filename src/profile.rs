//! Profile-mutation records for the People overlay.

use serde::{Deserialize, Serialize};

use crate::types::{Attributes, Scalar, SeqNo, UserId};

/// What a profile mutation does to the user's profile record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ProfileOp {
    /// Overwrite properties.
    Set {
        /// Properties to write.
        properties: Attributes,
    },
    /// Write properties that are not already set.
    SetOnce {
        /// Properties to write.
        properties: Attributes,
    },
    /// Remove properties.
    Unset {
        /// Property names to remove.
        keys: Vec<String>,
    },
    /// Delete the whole profile.
    Delete,
    /// Record revenue.
    Charge {
        /// Charged amount.
        amount: f64,
        /// Segmentation properties for the charge.
        #[serde(default)]
        properties: Attributes,
    },
    /// Delete the revenue history.
    ClearCharges,
}

/// Immutable profile mutation bound to a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileMutation {
    /// Sequence number shared with events.
    pub seq: SeqNo,
    /// Target user; `None` leaves resolution to the collector.
    pub user_id: Option<UserId>,
    /// Capture time in milliseconds since epoch.
    pub ts_ms: u64,
    /// Mutation body.
    #[serde(flatten)]
    pub op: ProfileOp,
}

/// How profile mutations without an identified user are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnonymousProfilePolicy {
    /// Queue against a null user for server-side resolution.
    #[default]
    Queue,
    /// Drop locally.
    Reject,
}

impl ProfileOp {
    /// Convenience for a single-key `Set`.
    pub fn set_one(key: impl Into<String>, value: impl Into<Scalar>) -> Self {
        let mut properties = Attributes::new();
        properties.insert(key.into(), value.into());
        Self::Set { properties }
    }

    /// Drops non-finite numbers; returns false when the op itself is unusable.
    pub(crate) fn sanitize(&mut self) -> bool {
        match self {
            Self::Set { properties } | Self::SetOnce { properties } => {
                properties.retain(|_, v| v.is_valid());
                true
            }
            Self::Charge { amount, properties } => {
                properties.retain(|_, v| v.is_valid());
                amount.is_finite()
            }
            Self::Unset { keys } => !keys.is_empty(),
            Self::Delete | Self::ClearCharges => true,
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Set { .. } => "set",
            Self::SetOnce { .. } => "set_once",
            Self::Unset { .. } => "unset",
            Self::Delete => "delete",
            Self::Charge { .. } => "charge",
            Self::ClearCharges => "clear_charges",
        }
    }
}
