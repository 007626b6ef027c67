//! Versioned asset cache for offline support.
//!
//! This module provides the dashboard's application-shell cache:
//! - Pre-caches a fixed manifest when a cache generation is installed
//! - Serves intercepted fetches cache-first, falling back to the network
//! - Stores qualifying network responses in the background
//! - Serves the shell document to navigations when the network is down
//! - Deletes every other generation on activation

mod layer;
mod storage;
mod traits;

pub use layer::AssetCache;
pub use storage::SqliteCacheStorage;
pub use traits::{CacheResult, CacheSource};
