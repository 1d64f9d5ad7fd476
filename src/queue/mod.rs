//! Durable sync queue: persistent buffering of user operations while
//! offline, and the at-least-once replay protocol that drains them.

pub mod manager;
pub mod store;

pub use manager::{SyncOutcome, SyncQueueManager};
pub use store::{Operation, QueueStore, QueuedOperation, SqliteQueueStore};
