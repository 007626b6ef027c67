mod cache;
mod config;
mod db;
mod event;
mod net;
mod notify;
mod outbox;
#[cfg(test)]
mod testing;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::event::{Event, EventHandler};
use crate::net::{HttpClient, Request};
use crate::notify::LogNotifier;
use crate::outbox::{PendingSale, SaleRecord};
use crate::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "scotech-sw")]
#[command(about = "Offline worker for the Scotech Inventory dashboard")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/scotech-sw/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-cache the asset manifest for the configured cache version
  Install,
  /// Make the configured cache version current and drop older ones
  Activate,
  /// Answer a request the way an intercepted page fetch is answered
  Fetch {
    /// Absolute URL or path relative to the origin
    url: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Replay queued sales
  Sync {
    /// Sync tag (default: the configured sync_tag)
    #[arg(long)]
    tag: Option<String>,
  },
  /// Queue a sale for background delivery
  Enqueue {
    #[arg(long)]
    product: String,
    #[arg(long)]
    quantity: u32,
    #[arg(long)]
    amount: f64,
    /// Product display name
    #[arg(long)]
    name: Option<String>,
    /// Sale id (default: derived from the current time)
    #[arg(long)]
    id: Option<String>,
  },
  /// List queued sales
  Pending,
  /// List cache generations
  Caches,
  /// Show a push notification
  Push {
    /// Notification text
    data: Option<String>,
  },
  /// Simulate a click on the last notification
  Click,
}

fn init_tracing(log_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "scotech-sw.log"));
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("scotech_sw=info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(verbose.then(|| fmt::layer().with_writer(std::io::stderr)))
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

/// Tag for `sync`, falling back to the configured one
fn sync_tag(tag: Option<String>, config: &config::Config) -> String {
  tag.unwrap_or_else(|| config.sync_tag.clone())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _guard = init_tracing(&config.log_dir()?, args.verbose)?;

  let client = HttpClient::new(&config)?;
  let mut worker = Worker::open(&config, client, Arc::new(LogNotifier))?;

  // Commands that inspect or feed local state directly
  let event = match args.command {
    Command::Enqueue {
      product,
      quantity,
      amount,
      name,
      id,
    } => {
      let mut record = SaleRecord::completed(product, quantity, amount);
      record.product_name = name;
      let payload = record.into_payload()?;
      let sale = match id {
        Some(id) => PendingSale::new(id, payload),
        None => PendingSale::with_generated_id(payload),
      };
      worker.queue().enqueue(&sale)?;
      println!("Queued {}", sale.id);
      return Ok(());
    }
    Command::Pending => {
      for sale in worker.queue().pending()? {
        println!("{}  {}  {}", sale.id, sale.queued_at.to_rfc3339(), sale.payload);
      }
      return Ok(());
    }
    Command::Caches => {
      let current = worker.cache().version().to_string();
      for name in worker.cache().cache_names()? {
        let marker = if name == current { "*" } else { " " };
        println!("{} {}", marker, name);
      }
      for url in worker.cache().cached_urls()? {
        println!("    {}", url);
      }
      return Ok(());
    }
    Command::Install => Event::Install,
    Command::Activate => Event::Activate,
    Command::Sync { tag } => Event::Sync {
      tag: sync_tag(tag, &config),
    },
    Command::Push { data } => Event::Push { data },
    Command::Click => Event::NotificationClick,
    Command::Fetch { url, navigate } => {
      let url = config.resolve(&url)?.to_string();
      let request = if navigate {
        Request::navigate(url)
      } else {
        Request::get(url)
      };
      let (reply, rx) = oneshot::channel();
      return fetch(worker, Event::Fetch { request, reply }, rx).await;
    }
  };

  let (events, tx) = EventHandler::channel();
  tx.send(event)
    .map_err(|_| eyre!("Worker stopped before receiving the event"))?;
  drop(tx);

  worker.run(events).await;
  println!(
    "Worker state: {:?} (clients claimed: {})",
    worker.state(),
    worker.clients_claimed()
  );

  Ok(())
}

async fn fetch(
  mut worker: Worker<HttpClient>,
  event: Event,
  rx: oneshot::Receiver<Result<cache::CacheResult>>,
) -> Result<()> {
  let (events, tx) = EventHandler::channel();
  tx.send(event)
    .map_err(|_| eyre!("Worker stopped before receiving the event"))?;
  drop(tx);

  // Run to completion so the background cache write is flushed
  worker.run(events).await;

  let result = rx
    .await
    .map_err(|_| eyre!("Worker dropped the fetch without answering"))??;
  let response = &result.response;
  println!(
    "{} {} ({}, {}, {} bytes)",
    response.status,
    response.url,
    response.header("content-type").unwrap_or("-"),
    response.response_type.as_str(),
    response.body.len()
  );
  match result.cached_at {
    Some(at) => println!("Served from {} (cached {})", result.source, at),
    None => println!("Served from {}", result.source),
  }

  Ok(())
}
