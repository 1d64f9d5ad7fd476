//! Versioned response caching for the worker context.
//!
//! This module provides the offline cache half of the layer:
//! - Named cache generations with atomic install and exclusive activation
//! - Per-request-class routing (network-first API, navigation fallback,
//!   cache-first static assets)
//! - Best-effort runtime caching that never fails the response path

pub mod controller;
pub mod storage;

pub use controller::{CacheController, NullHost, WorkerHost, WorkerState, SYNC_TAG};
pub use storage::{CacheStore, SqliteCacheStore};
