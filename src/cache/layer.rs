//! Asset cache that serves the dashboard shell cache-first with network fallback.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use super::storage::CacheStorage;
use super::traits::CacheResult;
use crate::net::{Fetcher, Request, Response};

/// Cache layer for one cache generation.
///
/// Sits between intercepted fetches and the network. Writes of freshly
/// fetched responses happen in the background so a response is never held
/// back by cache persistence; `flush` waits for them.
pub struct AssetCache<S: CacheStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  /// Name of the current cache generation
  version: String,
  origin: Url,
  /// Absolute URL of the offline fallback document
  fallback: String,
  writes: Arc<Mutex<JoinSet<()>>>,
}

impl<S, F> AssetCache<S, F>
where
  S: CacheStorage + 'static,
  F: Fetcher,
{
  pub fn new(
    storage: Arc<S>,
    fetcher: Arc<F>,
    version: impl Into<String>,
    origin: Url,
    fallback_document: &str,
  ) -> Result<Self> {
    let fallback = origin
      .join(fallback_document)
      .map_err(|e| eyre!("Invalid fallback document '{}': {}", fallback_document, e))?
      .to_string();

    Ok(Self {
      storage,
      fetcher,
      version: version.into(),
      origin,
      fallback,
      writes: Arc::new(Mutex::new(JoinSet::new())),
    })
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  /// Resolve a manifest entry against the origin.
  pub fn resolve(&self, path: &str) -> Result<String> {
    self
      .origin
      .join(path)
      .map(String::from)
      .map_err(|e| eyre!("Invalid manifest URL '{}': {}", path, e))
  }

  /// Fetch every manifest URL and store them as the current generation.
  ///
  /// All or nothing: if any fetch fails or returns a non-2xx status, nothing
  /// is written and no cache is created for this version.
  pub async fn install(&self, manifest: &[String]) -> Result<usize> {
    let urls = manifest
      .iter()
      .map(|path| self.resolve(path))
      .collect::<Result<Vec<_>>>()?;

    info!(cache = %self.version, assets = urls.len(), "Opened cache");

    let fetches = urls.into_iter().map(|url| async move {
      let response = self.fetcher.fetch(&Request::get(url.clone())).await?;
      if !response.ok() {
        return Err(eyre!(
          "Request for {} failed with status {}",
          url,
          response.status
        ));
      }
      Ok((url, response))
    });

    let entries = try_join_all(fetches).await.map_err(|e| {
      warn!(cache = %self.version, error = %e, "Install failed");
      e
    })?;

    self.storage.put_all(&self.version, &entries)?;
    Ok(entries.len())
  }

  /// Answer an intercepted fetch.
  pub async fn respond(&self, request: &Request) -> Result<CacheResult> {
    match self.storage.match_url(&self.version, &request.url) {
      Ok(Some(cached)) => {
        debug!(url = %request.url, "Cache hit");
        return Ok(CacheResult::from_cache(cached.response, cached.cached_at));
      }
      Ok(None) => {}
      Err(e) => warn!(url = %request.url, error = %e, "Cache lookup failed, treating as miss"),
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_cacheable() {
          self.store_in_background(request.url.clone(), response.clone());
        } else {
          debug!(
            url = %request.url,
            status = response.status,
            response_type = response.response_type.as_str(),
            "Not caching response"
          );
        }
        Ok(CacheResult::from_network(response))
      }
      Err(e) => {
        if request.is_navigation() {
          if let Ok(Some(cached)) = self.storage.match_url(&self.version, &self.fallback) {
            info!(url = %request.url, "Network unavailable, serving fallback document");
            return Ok(CacheResult::offline(cached.response, cached.cached_at));
          }
        }
        Err(e)
      }
    }
  }

  /// Pass a request to the network without consulting or filling the cache.
  pub async fn fetch_uncached(&self, request: &Request) -> Result<CacheResult> {
    let response = self.fetcher.fetch(request).await?;
    Ok(CacheResult::from_network(response))
  }

  /// Delete every cache that is not the current generation and mark the
  /// current one live.
  ///
  /// Returns the names of the deleted caches.
  pub fn activate(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();

    for name in self.storage.cache_names()? {
      if name != self.version && self.storage.delete_cache(&name)? {
        info!(cache = %name, "Deleted old cache");
        deleted.push(name);
      }
    }

    self.storage.mark_active(&self.version)?;
    Ok(deleted)
  }

  /// Wait for all background cache writes started so far.
  pub async fn flush(&self) -> Result<()> {
    let mut pending = {
      let mut writes = self
        .writes
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      std::mem::take(&mut *writes)
    };

    while let Some(result) = pending.join_next().await {
      if let Err(e) = result {
        warn!(error = %e, "Background cache write did not complete");
      }
    }

    Ok(())
  }

  /// Whether the current generation has been installed.
  pub fn is_installed(&self) -> Result<bool> {
    self.storage.has_cache(&self.version)
  }

  /// Whether the current generation was activated, possibly by an earlier run.
  pub fn is_active(&self) -> Result<bool> {
    self.storage.is_active(&self.version)
  }

  pub fn cache_names(&self) -> Result<Vec<String>> {
    self.storage.cache_names()
  }

  pub fn cached_urls(&self) -> Result<Vec<String>> {
    self.storage.urls(&self.version)
  }

  fn store_in_background(&self, url: String, response: Response) {
    let storage = Arc::clone(&self.storage);
    let cache_name = self.version.clone();

    let write = move || {
      if let Err(e) = storage.put(&cache_name, &url, &response) {
        warn!(url = %url, error = %e, "Cache write failed");
      }
    };

    match self.writes.lock() {
      Ok(mut writes) => {
        // Reap finished writes so the set only holds in-flight ones
        while writes.try_join_next().is_some() {}
        writes.spawn_blocking(write);
      }
      Err(e) => warn!(error = %e, "Skipping cache write"),
    }
  }
}

impl<S: CacheStorage, F: Fetcher> Clone for AssetCache<S, F> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      fetcher: Arc::clone(&self.fetcher),
      version: self.version.clone(),
      origin: self.origin.clone(),
      fallback: self.fallback.clone(),
      writes: Arc::clone(&self.writes),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::CachedResponse;
  use crate::cache::{CacheSource, SqliteCacheStorage};
  use crate::net::ResponseType;
  use crate::testing::FakeNetwork;

  /// Storage whose writes always fail, like a full disk.
  struct ReadOnlyStorage;

  impl CacheStorage for ReadOnlyStorage {
    fn cache_names(&self) -> Result<Vec<String>> {
      Ok(Vec::new())
    }

    fn has_cache(&self, _name: &str) -> Result<bool> {
      Ok(false)
    }

    fn put_all(&self, _name: &str, _entries: &[(String, Response)]) -> Result<()> {
      Err(eyre!("database or disk is full"))
    }

    fn put(&self, _name: &str, _url: &str, _response: &Response) -> Result<()> {
      Err(eyre!("database or disk is full"))
    }

    fn match_url(&self, _name: &str, _url: &str) -> Result<Option<CachedResponse>> {
      Ok(None)
    }

    fn urls(&self, _name: &str) -> Result<Vec<String>> {
      Ok(Vec::new())
    }

    fn delete_cache(&self, _name: &str) -> Result<bool> {
      Ok(false)
    }

    fn mark_active(&self, _name: &str) -> Result<()> {
      Err(eyre!("database or disk is full"))
    }

    fn is_active(&self, _name: &str) -> Result<bool> {
      Ok(false)
    }
  }

  const ORIGIN: &str = "http://localhost:8080/";

  fn manifest() -> Vec<String> {
    vec!["/".into(), "/index.html".into(), "/app.js".into()]
  }

  fn setup(
    version: &str,
  ) -> (
    AssetCache<SqliteCacheStorage, FakeNetwork>,
    Arc<SqliteCacheStorage>,
    Arc<FakeNetwork>,
  ) {
    let storage = Arc::new(SqliteCacheStorage::open_in_memory().unwrap());
    let network = Arc::new(FakeNetwork::default());
    network.serve("http://localhost:8080/", 200, ResponseType::Basic, "root");
    network.serve(
      "http://localhost:8080/index.html",
      200,
      ResponseType::Basic,
      "<html>shell</html>",
    );
    network.serve("http://localhost:8080/app.js", 200, ResponseType::Basic, "app");

    let cache = AssetCache::new(
      Arc::clone(&storage),
      Arc::clone(&network),
      version,
      Url::parse(ORIGIN).unwrap(),
      "/index.html",
    )
    .unwrap();

    (cache, storage, network)
  }

  #[tokio::test]
  async fn test_installed_assets_are_served_without_network() {
    let (cache, _storage, network) = setup("v1");
    assert_eq!(cache.install(&manifest()).await.unwrap(), 3);

    for path in manifest() {
      let url = cache.resolve(&path).unwrap();
      let before = network.fetch_count(&url);

      let result = cache.respond(&Request::get(url.clone())).await.unwrap();

      assert_eq!(result.source, CacheSource::Cache);
      assert_eq!(network.fetch_count(&url), before);
    }
  }

  #[tokio::test]
  async fn test_failed_asset_aborts_install_without_creating_cache() {
    let (cache, storage, network) = setup("v2");
    network.go_offline("http://localhost:8080/app.js");

    assert!(cache.install(&manifest()).await.is_err());
    assert!(!storage.has_cache("v2").unwrap());
  }

  #[tokio::test]
  async fn test_error_status_aborts_install() {
    let (cache, storage, network) = setup("v1");
    network.serve("http://localhost:8080/app.js", 404, ResponseType::Basic, "");

    assert!(cache.install(&manifest()).await.is_err());
    assert!(storage.cache_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_miss_fetches_once_and_caches_basic_200() {
    let (cache, storage, network) = setup("v1");
    cache.install(&manifest()).await.unwrap();
    let url = "http://localhost:8080/products.json";
    network.serve(url, 200, ResponseType::Basic, "[]");

    let first = cache.respond(&Request::get(url)).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(network.fetch_count(url), 1);

    cache.flush().await.unwrap();
    assert!(storage.match_url("v1", url).unwrap().is_some());

    let second = cache.respond(&Request::get(url)).await.unwrap();
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.response.body, b"[]".to_vec());
    assert_eq!(network.fetch_count(url), 1);
  }

  #[tokio::test]
  async fn test_cache_write_failure_still_returns_network_response() {
    let network = Arc::new(FakeNetwork::default());
    let url = "http://localhost:8080/products.json";
    network.serve(url, 200, ResponseType::Basic, "[]");
    let cache = AssetCache::new(
      Arc::new(ReadOnlyStorage),
      Arc::clone(&network),
      "v1",
      Url::parse(ORIGIN).unwrap(),
      "/index.html",
    )
    .unwrap();

    let result = cache.respond(&Request::get(url)).await.unwrap();
    cache.flush().await.unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.response.body, b"[]".to_vec());
  }

  #[tokio::test]
  async fn test_miss_before_install_does_not_create_cache() {
    let (cache, storage, network) = setup("v1");
    let url = "http://localhost:8080/other.js";
    network.serve(url, 200, ResponseType::Basic, "other");

    let result = cache.respond(&Request::get(url)).await.unwrap();
    cache.flush().await.unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert!(!cache.is_installed().unwrap());
    assert!(storage.cache_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_fetch_uncached_skips_cache() {
    let (cache, storage, network) = setup("v1");
    cache.install(&manifest()).await.unwrap();
    let url = "http://localhost:8080/app.js";

    let result = cache.fetch_uncached(&Request::get(url)).await.unwrap();
    cache.flush().await.unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(network.fetch_count(url), 2);
    assert_eq!(storage.urls("v1").unwrap().len(), 3);
  }

  #[tokio::test]
  async fn test_non_qualifying_responses_are_never_cached() {
    let (cache, storage, network) = setup("v1");
    let missing = "http://localhost:8080/missing.png";
    let font = "https://fonts.gstatic.com/outfit.woff2";
    network.serve(missing, 404, ResponseType::Basic, "not found");
    network.serve(font, 200, ResponseType::Cors, "font");

    let result = cache.respond(&Request::get(missing)).await.unwrap();
    assert_eq!(result.response.status, 404);
    let result = cache.respond(&Request::get(font)).await.unwrap();
    assert_eq!(result.response.response_type, ResponseType::Cors);

    cache.flush().await.unwrap();
    assert!(storage.match_url("v1", missing).unwrap().is_none());
    assert!(storage.match_url("v1", font).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_offline_navigation_gets_fallback_document() {
    let (cache, _storage, network) = setup("v1");
    cache.install(&manifest()).await.unwrap();
    let url = "http://localhost:8080/sales";
    network.go_offline(url);

    let result = cache.respond(&Request::navigate(url)).await.unwrap();

    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.response.body, b"<html>shell</html>".to_vec());
  }

  #[tokio::test]
  async fn test_offline_subresource_is_rejected() {
    let (cache, _storage, network) = setup("v1");
    cache.install(&manifest()).await.unwrap();
    let url = "http://localhost:8080/logo.png";
    network.go_offline(url);

    assert!(cache.respond(&Request::get(url)).await.is_err());
  }

  #[tokio::test]
  async fn test_offline_navigation_without_fallback_is_rejected() {
    let (cache, _storage, network) = setup("v1");
    let url = "http://localhost:8080/sales";
    network.go_offline(url);

    assert!(cache.respond(&Request::navigate(url)).await.is_err());
  }

  #[tokio::test]
  async fn test_activate_keeps_only_current_generation() {
    let (old, storage, network) = setup("scotech-inventory-v1");
    old.install(&manifest()).await.unwrap();
    storage.put_all("unrelated", &[]).unwrap();

    let current = AssetCache::new(
      Arc::clone(&storage),
      network,
      "scotech-inventory-v2",
      Url::parse(ORIGIN).unwrap(),
      "/index.html",
    )
    .unwrap();
    current.install(&manifest()).await.unwrap();

    let mut deleted = current.activate().unwrap();
    deleted.sort();

    assert_eq!(
      deleted,
      vec!["scotech-inventory-v1".to_string(), "unrelated".to_string()]
    );
    assert_eq!(
      current.cache_names().unwrap(),
      vec!["scotech-inventory-v2".to_string()]
    );
    assert!(current.is_active().unwrap());
  }
}
