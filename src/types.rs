//! Core identifier and call description types.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A contact identity (8-character id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity(pub String);

impl Identity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Local database key of a group. Stable across restarts, private to this
/// device (not the wire-level group id).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct GroupId(pub i64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wire-level group identification, needed to derive call ids that match
/// those derived by other members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDescriptor {
    pub group_id: GroupId,
    pub creator: Identity,
    pub api_group_id: [u8; 8],
}

/// A known contact with its advertised feature mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub identity: Identity,
    pub nickname: Option<String>,
    pub feature_mask: u64,
}

/// Feature mask bit advertising group call support.
pub const FEATURE_GROUP_CALLS: u64 = 1 << 5;

impl Contact {
    pub fn can_group_calls(&self) -> bool {
        self.feature_mask & FEATURE_GROUP_CALLS != 0
    }
}

/// Length of a call id in bytes (SHA-256 output).
pub const CALL_ID_LENGTH: usize = 32;

/// Identifier of a group call, derived deterministically from the group
/// identification and the call start data so every device computes the same
/// id for the same call.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub [u8; CALL_ID_LENGTH]);

impl CallId {
    pub fn as_bytes(&self) -> &[u8; CALL_ID_LENGTH] {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallId({})", self)
    }
}

/// Length of a group call key in bytes.
pub const GCK_LENGTH: usize = 32;

/// Group call key: the random secret established by the call creator and
/// distributed via the start announcement.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gck(pub [u8; GCK_LENGTH]);

impl fmt::Debug for Gck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log the key material.
        f.write_str("Gck(..)")
    }
}

/// One call considered running for a group.
///
/// `call_id` and `gck` never change after construction. `started_at` only
/// moves to a value backed by an authoritative peek, a connected signal or
/// a start announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupCallDescription {
    pub protocol_version: u32,
    pub group_id: GroupId,
    pub sfu_base_url: String,
    pub call_id: CallId,
    pub gck: Gck,
    /// Milliseconds since the unix epoch.
    pub started_at: u64,
    pub max_participants: Option<u32>,
    pub encrypted_call_state: Option<Vec<u8>>,
}

impl GroupCallDescription {
    pub fn started_at_date(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.started_at as i64)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Elapsed time since `started_at`, zero if the timestamp is in the
    /// future.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        let millis = now.timestamp_millis().saturating_sub(self.started_at as i64);
        Duration::from_millis(millis.max(0) as u64)
    }
}
