//! Push notifications shown by the worker.

use chrono::Utc;
use color_eyre::Result;
use serde::Serialize;
use tracing::info;

const TITLE: &str = "Scotech Inventory";
const DEFAULT_BODY: &str = "New notification from Scotech Inventory";

/// Page opened when a notification is clicked
pub const CLICK_TARGET: &str = "/";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  /// Vibration pattern in milliseconds
  pub vibrate: Vec<u32>,
  pub data: NotificationData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
  /// Unix millis when the push arrived
  pub date_of_arrival: i64,
  pub primary_key: u32,
}

impl Notification {
  /// Build the notification for a push message; `data` is its text payload, if any.
  pub fn from_push(data: Option<&str>) -> Self {
    Self {
      title: TITLE.to_string(),
      body: data.unwrap_or(DEFAULT_BODY).to_string(),
      icon: "/icons/icon-192x192.png".to_string(),
      badge: "/icons/icon-72x72.png".to_string(),
      vibrate: vec![200, 100, 200],
      data: NotificationData {
        date_of_arrival: Utc::now().timestamp_millis(),
        primary_key: 1,
      },
    }
  }
}

/// Host surface that displays notifications and opens pages.
pub trait Notifier: Send + Sync {
  fn show(&self, notification: &Notification) -> Result<()>;

  /// Dismiss the notification that was clicked.
  fn close(&self) -> Result<()>;

  fn open_window(&self, url: &str) -> Result<()>;
}

/// Notifier that only records notifications in the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
  fn show(&self, notification: &Notification) -> Result<()> {
    info!(title = %notification.title, body = %notification.body, "Notification");
    Ok(())
  }

  fn close(&self) -> Result<()> {
    Ok(())
  }

  fn open_window(&self, url: &str) -> Result<()> {
    info!(url, "Opening window");
    Ok(())
  }
}
