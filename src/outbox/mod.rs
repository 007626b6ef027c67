//! Offline sale outbox.
//!
//! Sales that could not reach the ingestion endpoint are written to a local
//! SQLite store and replayed when a sync signal arrives. A sale stays queued
//! until the endpoint accepts it.

mod queue;
mod store;

pub use queue::SaleQueue;
pub use store::{PendingSale, SaleRecord, SqliteSaleStore};
