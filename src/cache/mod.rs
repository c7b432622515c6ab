//! Versioned bucket store for offline support.
//!
//! This module provides a named-bucket cache of response snapshots that:
//! - Keys entries by request method + URL
//! - Groups entries into buckets named by a version tag
//! - Replaces whole buckets on version change (no per-entry eviction)
//! - Seeds buckets in all-or-nothing batches

mod layer;
mod storage;
mod traits;

pub use layer::Bucket;
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use traits::{CachedResponse, RequestKey};
