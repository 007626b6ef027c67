use color_eyre::Result;
use tokio::sync::{mpsc, oneshot};

use crate::cache::CacheResult;
use crate::net::Request;

/// Lifecycle signals delivered by the host
#[derive(Debug)]
pub enum Event {
  /// A new cache generation should be installed
  Install,
  /// The installed generation takes over
  Activate,
  /// A page request was intercepted; the answer goes back on `reply`
  Fetch {
    request: Request,
    reply: oneshot::Sender<Result<CacheResult>>,
  },
  /// Background sync was requested under `tag`
  Sync { tag: String },
  /// A push message arrived, with its text payload if any
  Push { data: Option<String> },
  /// The user clicked a notification
  NotificationClick,
}

/// Receiving end of the worker's event channel
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create the channel; the sender is handed to whoever plays the host.
  pub fn channel() -> (Self, mpsc::UnboundedSender<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { rx }, tx)
  }

  /// Receive the next event, or `None` once every sender is gone
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
