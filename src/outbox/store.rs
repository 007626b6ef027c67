//! Durable store for sales awaiting delivery.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, ErrorCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::db;

/// A sale that could not be delivered synchronously.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSale {
  /// Primary key in the store
  pub id: String,
  /// Sale record as submitted to the endpoint, never interpreted here
  pub payload: Value,
  pub queued_at: DateTime<Utc>,
}

impl PendingSale {
  pub fn new(id: impl Into<String>, payload: Value) -> Self {
    Self {
      id: id.into(),
      payload,
      queued_at: Utc::now(),
    }
  }

  /// Id derived from the current time, e.g. `sale-1760880000000`.
  pub fn with_generated_id(payload: Value) -> Self {
    let queued_at = Utc::now();
    Self {
      id: format!("sale-{}", queued_at.timestamp_millis()),
      payload,
      queued_at,
    }
  }
}

/// Sale record as the dashboard's sale form produces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleRecord {
  pub product_id: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub product_name: Option<String>,
  pub quantity: u32,
  pub amount: f64,
  pub date: DateTime<Utc>,
  pub status: String,
}

impl SaleRecord {
  pub fn completed(product_id: impl Into<String>, quantity: u32, amount: f64) -> Self {
    Self {
      product_id: product_id.into(),
      product_name: None,
      quantity,
      amount,
      date: Utc::now(),
      status: "completed".to_string(),
    }
  }

  pub fn into_payload(self) -> Result<Value> {
    serde_json::to_value(self).map_err(|e| eyre!("Failed to serialize sale: {}", e))
  }
}

/// Trait for pending-sale storage backends.
pub trait SaleStore: Send + Sync {
  /// Durably add a sale. Fails if the id is already queued.
  fn insert(&self, sale: &PendingSale) -> Result<()>;

  /// Snapshot of every queued sale, oldest first.
  fn all(&self) -> Result<Vec<PendingSale>>;

  /// Remove a sale by id. Returns false if it was not queued.
  fn delete(&self, id: &str) -> Result<bool>;
}

/// SQLite-based pending-sale store.
pub struct SqliteSaleStore {
  conn: Mutex<Connection>,
}

const SALES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pending_sales (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    payload TEXT NOT NULL,
    queued_at TEXT NOT NULL
);
"#;

impl SqliteSaleStore {
  pub fn open(path: &Path) -> Result<Self> {
    Ok(Self {
      conn: Mutex::new(db::open(path, SALES_SCHEMA)?),
    })
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    Ok(Self {
      conn: Mutex::new(db::open_in_memory(SALES_SCHEMA)?),
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl SaleStore for SqliteSaleStore {
  fn insert(&self, sale: &PendingSale) -> Result<()> {
    let conn = self.lock()?;
    let payload =
      serde_json::to_string(&sale.payload).map_err(|e| eyre!("Failed to serialize sale: {}", e))?;

    conn
      .execute(
        "INSERT INTO pending_sales (id, payload, queued_at) VALUES (?, ?, ?)",
        params![sale.id, payload, sale.queued_at.to_rfc3339()],
      )
      .map_err(|e| match e.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => eyre!("Sale {} is already queued", sale.id),
        _ => eyre!("Failed to queue sale {}: {}", sale.id, e),
      })?;

    Ok(())
  }

  fn all(&self) -> Result<Vec<PendingSale>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT id, payload, queued_at FROM pending_sales ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
        ))
      })
      .map_err(|e| eyre!("Failed to read pending sales: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read pending sale: {}", e))?;

    rows
      .into_iter()
      .map(|(id, payload, queued_at)| {
        let payload = serde_json::from_str(&payload)
          .map_err(|e| eyre!("Failed to deserialize sale {}: {}", id, e))?;
        let queued_at = DateTime::parse_from_rfc3339(&queued_at)
          .map_err(|e| eyre!("Failed to parse queued_at of {}: {}", id, e))?
          .with_timezone(&Utc);
        Ok(PendingSale {
          id,
          payload,
          queued_at,
        })
      })
      .collect()
  }

  fn delete(&self, id: &str) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute("DELETE FROM pending_sales WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete sale {}: {}", id, e))?;

    Ok(removed > 0)
  }
}
