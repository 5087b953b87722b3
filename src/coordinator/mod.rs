//! Group call coordination: tracking running calls, deriving the chosen call
//! per group and steering the joined session.

mod error;
mod manager;
mod observer;
mod pipeline;
mod refresh;
mod registry;

pub use error::GroupCallError;
pub use manager::{GroupCallDependencies, GroupCallManager};
pub use observer::GroupCallObserver;
