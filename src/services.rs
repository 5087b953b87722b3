//! External collaborator boundaries: directories, messaging, notifications
//! and chat status records.

use crate::protocol::GroupCallStartData;
use crate::types::{CallId, Contact, GroupDescriptor, GroupId, Identity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Group membership as known to the local device.
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    /// Resolve a local group id to its wire-level identification.
    async fn group(&self, group_id: GroupId) -> Option<GroupDescriptor>;

    /// Current member identities, including ourselves.
    async fn members(&self, group_id: GroupId) -> Vec<Identity>;

    /// Whether the local user is (still) a member of the group.
    async fn is_member(&self, group_id: GroupId) -> bool;
}

/// Contact lookup, including advertised feature masks.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn contact(&self, identity: &Identity) -> Option<Contact>;
}

/// Outbound control message channel for start announcements.
#[async_trait]
pub trait ControlMessageSender: Send + Sync {
    /// Send the call start announcement to the given identities. Returns the
    /// number of messages actually sent.
    async fn send_call_start(
        &self,
        group: &GroupDescriptor,
        recipients: &[Identity],
        data: &GroupCallStartData,
        started_at: DateTime<Utc>,
    ) -> usize;
}

/// User-facing "incoming group call" notification surface.
pub trait NotificationSurface: Send + Sync {
    fn add_group_call_notification(&self, group_id: GroupId, caller: &Contact);
    fn cancel_group_call_notification(&self, group_id: GroupId);
}

/// Status records written into the chat history as side effects of registry
/// mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupCallStatus {
    Started {
        call_id: CallId,
        group_id: GroupId,
        caller: Identity,
        /// Whether the announcement originated from this device.
        outbox: bool,
        started_at: DateTime<Utc>,
    },
    Ended {
        call_id: CallId,
    },
}

pub trait StatusSink: Send + Sync {
    fn group_call_status(&self, status: GroupCallStatus);
}
