//! Engine configuration.

use crate::protocol::{CALL_REFRESH_INTERVAL, CREATE_WAIT_PERIOD};
use std::time::Duration;

/// Configuration for the group call coordination engine.
///
/// The defaults are the protocol-defined values; tests shrink the timings.
#[derive(Debug, Clone)]
pub struct GroupCallConfig {
    /// Whether group calls are enabled at all. When disabled, inbound
    /// announcements are still tracked (the chat history stays correct) but
    /// no incoming-call notification is surfaced.
    pub group_calls_enabled: bool,
    /// Skip the artificial wait window after creating a call. Useful for
    /// tests and impatient users.
    pub skip_create_delay: bool,
    /// Wait window during which a racing call started by another member wins
    /// over a freshly created one.
    pub create_wait_period: Duration,
    /// Delay between refresh cycles for a group with running calls.
    pub refresh_interval: Duration,
    /// Concurrent peeks during a refresh cycle's fan-out.
    pub peek_concurrency: usize,
}

impl Default for GroupCallConfig {
    fn default() -> Self {
        Self {
            group_calls_enabled: true,
            skip_create_delay: false,
            create_wait_period: CREATE_WAIT_PERIOD,
            refresh_interval: CALL_REFRESH_INTERVAL,
            peek_concurrency: 4,
        }
    }
}
