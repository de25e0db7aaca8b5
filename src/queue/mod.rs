//! Durable sync queue for mutating operations that could not complete.
//!
//! Items are appended as `pending`, replayed in insertion order by `drain`,
//! and marked `completed` or `failed` in place. Nothing is ever deleted.

mod action;
mod store;

pub use action::{ActionHandler, HttpActionHandler, SyncAction};
pub use store::{DrainReport, SyncQueue, SyncStatus};
