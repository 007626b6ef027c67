use crate::cache::{AssetCache, SqliteCacheStorage};
use crate::config::Config;
use crate::event::{Event, EventHandler};
use crate::net::{Fetcher, SaleSubmitter};
use crate::notify::{Notification, Notifier, CLICK_TARGET};
use crate::outbox::{SaleQueue, SqliteSaleStore};
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
  Uninstalled,
  Installing,
  Installed,
  Activating,
  Active,
  /// A manifest asset could not be fetched; the next install starts over
  InstallFailed,
}

/// Settings the worker needs beyond its components
#[derive(Debug, Clone)]
pub struct WorkerOptions {
  pub manifest: Vec<String>,
  pub sync_tag: String,
  pub skip_waiting: bool,
}

impl WorkerOptions {
  pub fn from_config(config: &Config) -> Self {
    Self {
      manifest: config.manifest.clone(),
      sync_tag: config.sync_tag.clone(),
      skip_waiting: config.skip_waiting,
    }
  }
}

/// Background worker: routes host events to the asset cache, the sale
/// queue and the notifier.
pub struct Worker<C: Fetcher + SaleSubmitter> {
  cache: AssetCache<SqliteCacheStorage, C>,
  queue: SaleQueue<SqliteSaleStore, C>,
  notifier: Arc<dyn Notifier>,
  options: WorkerOptions,
  state: Lifecycle,
  /// Whether open pages are controlled without a reload
  clients_claimed: bool,
  /// In-flight fetch interceptions
  fetches: JoinSet<()>,
  /// In-flight sale replays
  syncs: JoinSet<()>,
}

impl<C: Fetcher + SaleSubmitter + 'static> Worker<C> {
  pub fn new(
    cache: AssetCache<SqliteCacheStorage, C>,
    queue: SaleQueue<SqliteSaleStore, C>,
    notifier: Arc<dyn Notifier>,
    options: WorkerOptions,
  ) -> Self {
    Self {
      cache,
      queue,
      notifier,
      options,
      state: Lifecycle::Uninstalled,
      clients_claimed: false,
      fetches: JoinSet::new(),
      syncs: JoinSet::new(),
    }
  }

  /// Open both databases under the configured data directory.
  ///
  /// A generation activated by an earlier run is live again immediately.
  pub fn open(config: &Config, client: C, notifier: Arc<dyn Notifier>) -> Result<Self> {
    let client = Arc::new(client);

    let storage = Arc::new(SqliteCacheStorage::open(&config.cache_db_path()?)?);
    let cache = AssetCache::new(
      storage,
      Arc::clone(&client),
      config.cache_version.clone(),
      config.origin_url()?,
      &config.fallback_document,
    )?;

    let store = Arc::new(SqliteSaleStore::open(&config.sales_db_path()?)?);
    let queue = SaleQueue::new(store, client);

    let mut worker = Self::new(cache, queue, notifier, WorkerOptions::from_config(config));
    if worker.cache.is_active()? {
      debug!(cache = %worker.cache.version(), "Resuming active cache");
      worker.state = Lifecycle::Active;
    }
    Ok(worker)
  }

  pub fn state(&self) -> Lifecycle {
    self.state
  }

  pub fn clients_claimed(&self) -> bool {
    self.clients_claimed
  }

  pub fn cache(&self) -> &AssetCache<SqliteCacheStorage, C> {
    &self.cache
  }

  pub fn queue(&self) -> &SaleQueue<SqliteSaleStore, C> {
    &self.queue
  }

  /// Handle events until every sender is dropped, then drain background work.
  pub async fn run(&mut self, mut events: EventHandler) {
    while let Some(event) = events.next().await {
      if let Err(e) = self.handle_event(event).await {
        warn!(error = %e, "Event failed");
      }
    }

    self.shutdown().await;
  }

  pub async fn handle_event(&mut self, event: Event) -> Result<()> {
    match event {
      Event::Install => self.install().await,
      Event::Activate => self.activate(),
      Event::Fetch { request, reply } => {
        // Reap finished interceptions so the set only holds in-flight ones
        while self.fetches.try_join_next().is_some() {}

        // Until a generation is live, requests go straight to the network
        let intercept = self.state == Lifecycle::Active;
        let cache = self.cache.clone();
        self.fetches.spawn(async move {
          let result = if intercept {
            cache.respond(&request).await
          } else {
            cache.fetch_uncached(&request).await
          };
          if reply.send(result).is_err() {
            debug!(url = %request.url, "Fetch requester went away");
          }
        });
        Ok(())
      }
      Event::Sync { tag } => {
        if tag != self.options.sync_tag {
          debug!(tag = %tag, "Ignoring unknown sync tag");
          return Ok(());
        }
        while self.syncs.try_join_next().is_some() {}

        let queue = self.queue.clone();
        self.syncs.spawn(async move {
          match queue.replay().await {
            Ok(report) => info!(
              attempted = report.attempted,
              delivered = report.delivered,
              retained = report.retained,
              "Sale sync finished"
            ),
            Err(e) => warn!(error = %e, "Sale sync failed"),
          }
        });
        Ok(())
      }
      Event::Push { data } => self.notifier.show(&Notification::from_push(data.as_deref())),
      Event::NotificationClick => {
        self.notifier.close()?;
        self.notifier.open_window(CLICK_TARGET)
      }
    }
  }

  async fn install(&mut self) -> Result<()> {
    self.state = Lifecycle::Installing;

    match self.cache.install(&self.options.manifest).await {
      Ok(count) => {
        info!(cache = %self.cache.version(), assets = count, "Installed");
        self.state = Lifecycle::Installed;
      }
      Err(e) => {
        self.state = Lifecycle::InstallFailed;
        return Err(e);
      }
    }

    if self.options.skip_waiting {
      self.activate()?;
    }
    Ok(())
  }

  fn activate(&mut self) -> Result<()> {
    if !self.cache.is_installed()? {
      return Err(eyre!(
        "Cannot activate: cache {} is not installed",
        self.cache.version()
      ));
    }

    self.state = Lifecycle::Activating;
    let deleted = self.cache.activate()?;
    self.clients_claimed = true;
    self.state = Lifecycle::Active;

    info!(
      cache = %self.cache.version(),
      deleted = deleted.len(),
      "Activated and claimed clients"
    );
    Ok(())
  }

  async fn shutdown(&mut self) {
    while let Some(result) = self.fetches.join_next().await {
      if let Err(e) = result {
        warn!(error = %e, "Fetch task did not complete");
      }
    }

    while let Some(result) = self.syncs.join_next().await {
      if let Err(e) = result {
        warn!(error = %e, "Sync task did not complete");
      }
    }

    if let Err(e) = self.cache.flush().await {
      warn!(error = %e, "Failed to flush cache writes");
    }
  }
}
