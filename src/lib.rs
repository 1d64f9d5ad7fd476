//! Offline resilience layer for a point-of-sale web app.
//!
//! Two cooperating components, one per execution context, sharing nothing
//! but a one-way advisory message channel:
//!
//! - [`cache::CacheController`] (worker context) intercepts fetches for the
//!   origin, applies a per-request-class caching strategy, and manages the
//!   versioned cache generation lifecycle.
//! - [`queue::SyncQueueManager`] (page context) buffers user operations in
//!   a durable store while offline and replays them against the remote API
//!   as one ordered batch when connectivity returns.
//!
//! The browser platform (fetch, cookie jar, online/offline signals, toast
//! presenter, background sync) is abstracted behind traits so the full
//! protocol runs under test with synthetic events.

pub mod cache;
pub mod config;
pub mod event;
pub mod net;
pub mod notify;
pub mod page;
pub mod queue;

pub use cache::{CacheController, SqliteCacheStore};
pub use config::Config;
pub use event::{Connectivity, EventHandler, EventSender, PageEvent, WorkerMessage};
pub use net::{Fetcher, Request, Response, SyncTransport};
pub use notify::{Notifier, Severity};
pub use page::PageController;
pub use queue::{SqliteQueueStore, SyncOutcome, SyncQueueManager};
