//! Offline sale queue: durable enqueue plus replay on sync.

use color_eyre::Result;
use std::sync::Arc;
use tracing::{info, warn};

use super::store::{PendingSale, SaleStore};
use crate::net::SaleSubmitter;

/// Outcome of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
  /// Sales read in the snapshot
  pub attempted: usize,
  /// Sales the endpoint accepted
  pub delivered: usize,
  /// Sales left queued for the next replay
  pub retained: usize,
}

/// Queue of sales that could not be delivered when they were recorded.
///
/// Delivery is at-least-once: a sale is only removed after the endpoint
/// accepted it, and overlapping replays may submit the same sale twice.
pub struct SaleQueue<S: SaleStore, T: SaleSubmitter> {
  store: Arc<S>,
  submitter: Arc<T>,
}

impl<S: SaleStore, T: SaleSubmitter> SaleQueue<S, T> {
  pub fn new(store: Arc<S>, submitter: Arc<T>) -> Self {
    Self { store, submitter }
  }

  /// Durably queue a sale. Returns once the record is in the store.
  pub fn enqueue(&self, sale: &PendingSale) -> Result<()> {
    self.store.insert(sale)?;
    info!(sale = %sale.id, "Queued sale for background sync");
    Ok(())
  }

  pub fn pending(&self) -> Result<Vec<PendingSale>> {
    self.store.all()
  }

  /// Try to deliver every sale queued at the time of the call.
  ///
  /// Individual failures never abort the pass; only reading the snapshot can fail.
  pub async fn replay(&self) -> Result<ReplayReport> {
    let snapshot = self.store.all()?;
    let mut report = ReplayReport {
      attempted: snapshot.len(),
      ..ReplayReport::default()
    };

    for sale in snapshot {
      match self.submitter.submit(&sale.payload).await {
        Ok(()) => {
          report.delivered += 1;
          match self.store.delete(&sale.id) {
            Ok(_) => info!(sale = %sale.id, "Synced sale"),
            // Still queued, so it will be submitted again next time
            Err(e) => warn!(sale = %sale.id, error = %e, "Synced sale but could not dequeue it"),
          }
        }
        Err(e) => {
          report.retained += 1;
          warn!(sale = %sale.id, error = %e, "Failed to sync sale");
        }
      }
    }

    Ok(report)
  }
}

impl<S: SaleStore, T: SaleSubmitter> Clone for SaleQueue<S, T> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      submitter: Arc::clone(&self.submitter),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::outbox::SqliteSaleStore;
  use crate::testing::FakeNetwork;
  use serde_json::json;
  use color_eyre::eyre::eyre;

  /// Store that keeps every sale because deletes always fail.
  struct UndeletableStore(SqliteSaleStore);

  impl SaleStore for UndeletableStore {
    fn insert(&self, sale: &PendingSale) -> Result<()> {
      self.0.insert(sale)
    }

    fn all(&self) -> Result<Vec<PendingSale>> {
      self.0.all()
    }

    fn delete(&self, _id: &str) -> Result<bool> {
      Err(eyre!("database is locked"))
    }
  }

  fn setup() -> (SaleQueue<SqliteSaleStore, FakeNetwork>, Arc<FakeNetwork>) {
    let store = Arc::new(SqliteSaleStore::open_in_memory().unwrap());
    let network = Arc::new(FakeNetwork::default());
    (SaleQueue::new(store, Arc::clone(&network)), network)
  }

  fn sale(id: &str, product: &str) -> PendingSale {
    PendingSale::new(id, json!({"productId": product, "quantity": 1, "amount": 10}))
  }

  #[tokio::test]
  async fn test_delivered_sales_are_removed() {
    let (queue, network) = setup();
    queue.enqueue(&sale("s1", "p1")).unwrap();
    queue.enqueue(&sale("s2", "p2")).unwrap();

    let report = queue.replay().await.unwrap();

    assert_eq!(
      report,
      ReplayReport {
        attempted: 2,
        delivered: 2,
        retained: 0
      }
    );
    assert!(queue.pending().unwrap().is_empty());
    assert_eq!(network.submissions().len(), 2);
  }

  #[tokio::test]
  async fn test_failure_is_isolated_and_record_kept_unchanged() {
    let (queue, network) = setup();
    let failing = sale("s1", "p1");
    queue.enqueue(&failing).unwrap();
    queue.enqueue(&sale("s2", "p2")).unwrap();
    network.reject_product("p1");

    let report = queue.replay().await.unwrap();

    assert_eq!(report.delivered, 1);
    assert_eq!(report.retained, 1);
    assert_eq!(queue.pending().unwrap(), vec![failing]);
    assert_eq!(network.submissions()[0]["productId"], "p2");
  }

  #[tokio::test]
  async fn test_second_replay_submits_nothing() {
    let (queue, network) = setup();
    queue.enqueue(&sale("s1", "p1")).unwrap();

    queue.replay().await.unwrap();
    let second = queue.replay().await.unwrap();

    assert_eq!(second, ReplayReport::default());
    assert_eq!(network.submissions().len(), 1);
  }

  #[tokio::test]
  async fn test_server_error_then_success() {
    let (queue, network) = setup();
    queue
      .enqueue(&PendingSale::new(
        "s1",
        json!({"productId": "p1", "quantity": 2, "amount": 100}),
      ))
      .unwrap();

    network.set_sale_status(500);
    queue.replay().await.unwrap();
    assert_eq!(queue.pending().unwrap().len(), 1);
    assert_eq!(queue.pending().unwrap()[0].id, "s1");

    network.set_sale_status(200);
    queue.replay().await.unwrap();
    assert!(queue.pending().unwrap().is_empty());
    assert_eq!(
      network.submissions(),
      vec![json!({"productId": "p1", "quantity": 2, "amount": 100})]
    );
  }

  #[tokio::test]
  async fn test_sale_is_resubmitted_when_dequeue_fails() {
    let store = Arc::new(UndeletableStore(SqliteSaleStore::open_in_memory().unwrap()));
    let network = Arc::new(FakeNetwork::default());
    let queue = SaleQueue::new(store, Arc::clone(&network));
    queue.enqueue(&sale("s1", "p1")).unwrap();

    let first = queue.replay().await.unwrap();
    assert_eq!(first.delivered, 1);
    assert_eq!(queue.pending().unwrap().len(), 1);

    let second = queue.replay().await.unwrap();
    assert_eq!(second.delivered, 1);
    assert_eq!(network.submissions().len(), 2);
    assert_eq!(network.submissions()[0], network.submissions()[1]);
  }

  #[tokio::test]
  async fn test_replay_on_empty_queue() {
    let (queue, _network) = setup();
    assert_eq!(queue.replay().await.unwrap(), ReplayReport::default());
  }
}
