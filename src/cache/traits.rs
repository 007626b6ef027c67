//! Core types for the asset cache.

use chrono::{DateTime, Utc};

use crate::net::Response;

/// Result of answering an intercepted fetch, including where the response came from.
#[derive(Debug, Clone)]
pub struct CacheResult {
  /// The response handed back to the page
  pub response: Response,
  /// Where the response came from
  pub source: CacheSource,
  /// When the response was cached (if served from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl CacheResult {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(response: Response, cached_at: DateTime<Utc>) -> Self {
    Self {
      response,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Network unavailable, serving the cached shell document instead.
  pub fn offline(response: Response, cached_at: DateTime<Utc>) -> Self {
    Self {
      response,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Exact match in the current cache generation
  Cache,
  /// Fetched from the network on a cache miss
  Network,
  /// Network failed; the fallback document was served
  Offline,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CacheSource::Cache => write!(f, "cache"),
      CacheSource::Network => write!(f, "network"),
      CacheSource::Offline => write!(f, "offline fallback"),
    }
  }
}
