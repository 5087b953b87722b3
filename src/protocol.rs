//! Group call protocol constants, start data and call-id derivation.

use crate::types::{CallId, Gck, GroupDescriptor, Identity, GCK_LENGTH};
use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Version of the group call protocol spoken by this implementation.
pub const GC_PROTOCOL_VERSION: u32 = 1;

/// Delay between two refresh cycles for a group with running calls.
pub const CALL_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Consecutive failed peeks before a call may be considered abandoned.
pub const PEEK_FAILED_ABANDON_MIN_TRIES: u32 = 3;

/// Minimum call age before sustained peek failure counts as abandonment.
pub const PEEK_FAILED_ABANDON_MIN_CALL_AGE: Duration = Duration::from_secs(10 * 60);

/// Wait period after creating a call during which a racing call started by
/// another member takes precedence.
pub const CREATE_WAIT_PERIOD: Duration = Duration::from_secs(2);

/// Capacity of the inbound start-announcement queue. Old announcements may
/// be dropped on overflow; call state is re-derived from peeks, not from
/// announcement history.
pub const START_QUEUE_CAPACITY: usize = 256;

/// The immutable parameters a call is started with, as carried by the start
/// announcement.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupCallStartData {
    pub protocol_version: u32,
    pub gck: Gck,
    pub sfu_base_url: String,
}

impl GroupCallStartData {
    /// Build start data for a fresh call with a newly generated gck.
    pub fn generate(sfu_base_url: String) -> Self {
        let mut gck = [0u8; GCK_LENGTH];
        rand::rng().fill_bytes(&mut gck);
        Self {
            protocol_version: GC_PROTOCOL_VERSION,
            gck: Gck(gck),
            sfu_base_url,
        }
    }
}

/// An inbound group call start announcement, already decrypted and resolved
/// to a local group by the message transport.
#[derive(Debug, Clone)]
pub struct GroupCallStartMessage {
    pub from: Identity,
    pub group: GroupDescriptor,
    pub data: GroupCallStartData,
    pub created_at: DateTime<Utc>,
}

impl CallId {
    /// Derive the call id from the group identification and the start data.
    ///
    /// Two devices constructing a call with identical start parameters must
    /// arrive at the identical id, so the derivation input is exactly the
    /// wire-visible call identification.
    pub fn derive(group: &GroupDescriptor, data: &GroupCallStartData) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(group.creator.as_str().as_bytes());
        hasher.update(group.api_group_id);
        hasher.update(data.protocol_version.to_le_bytes());
        hasher.update(data.gck.0);
        hasher.update(data.sfu_base_url.as_bytes());
        Self(hasher.finalize().into())
    }
}
