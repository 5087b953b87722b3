//! Group call coordination engine.
//!
//! Tracks the calls considered running per group, periodically peeks them at
//! the SFU, derives the one call everyone should converge on and steers the
//! locally joined call session accordingly. Media, networking and storage
//! are pluggable through trait objects; see
//! [`coordinator::GroupCallDependencies`].

pub mod config;
pub mod coordinator;
pub mod proto;
pub mod protocol;
pub mod services;
pub mod session;
pub mod sfu;
pub mod store;
pub mod types;

pub use config::GroupCallConfig;
pub use coordinator::{GroupCallDependencies, GroupCallError, GroupCallManager, GroupCallObserver};
pub use session::{CallSessionFactory, GroupCallController};
pub use types::{CallId, Gck, GroupCallDescription, GroupId, Identity};
