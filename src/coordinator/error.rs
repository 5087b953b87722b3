//! Coordinator-level error types.

use crate::session::SessionError;
use crate::sfu::SfuError;
use crate::store::StoreError;
use crate::types::GroupId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GroupCallError {
    /// A protocol contract was violated, e.g. a freshly created call already
    /// had participants on the SFU.
    #[error("group call protocol violation: {0}")]
    Protocol(String),

    #[error("unknown group: {0}")]
    UnknownGroup(GroupId),

    #[error(transparent)]
    Sfu(#[from] SfuError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
