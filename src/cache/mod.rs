//! Versioned response cache.
//!
//! This module owns the cache buckets:
//! - One bucket per agent version, named like `automaten-manager-v1`
//! - Exact-match lookup by method + URL, GET only
//! - Only same-origin 200 responses are ever stored
//! - Old buckets are garbage once a newer version activates

mod manager;
mod storage;
mod traits;

pub use manager::CacheManager;
pub(crate) use storage::parse_millis;
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use traits::{CachedResponse, RequestKey};
