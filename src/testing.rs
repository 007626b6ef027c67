//! Scripted network used by unit tests.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use crate::net::{Fetcher, Request, Response, ResponseType, SaleSubmitter};

#[derive(Default)]
pub struct FakeNetwork {
  routes: Mutex<HashMap<String, Response>>,
  offline: Mutex<HashSet<String>>,
  fetched: Mutex<Vec<String>>,
  /// Status returned by the sale endpoint; 200 when unset
  sale_status: Mutex<Option<u16>>,
  /// Product ids whose sales are rejected
  rejected_products: Mutex<HashSet<String>>,
  submitted: Mutex<Vec<Value>>,
  /// While set, submissions wait until the gate is closed
  sale_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeNetwork {
  pub fn serve(&self, url: &str, status: u16, response_type: ResponseType, body: &str) {
    self.offline.lock().unwrap().remove(url);
    self.routes.lock().unwrap().insert(
      url.to_string(),
      Response {
        url: url.to_string(),
        status,
        response_type,
        headers: Vec::new(),
        body: body.as_bytes().to_vec(),
      },
    );
  }

  pub fn go_offline(&self, url: &str) {
    self.offline.lock().unwrap().insert(url.to_string());
  }

  pub fn fetch_count(&self, url: &str) -> usize {
    self
      .fetched
      .lock()
      .unwrap()
      .iter()
      .filter(|u| u.as_str() == url)
      .count()
  }

  pub fn set_sale_status(&self, status: u16) {
    *self.sale_status.lock().unwrap() = Some(status);
  }

  pub fn reject_product(&self, product_id: &str) {
    self
      .rejected_products
      .lock()
      .unwrap()
      .insert(product_id.to_string());
  }

  /// Make every submission wait until `release_sales`.
  pub fn hold_sales(&self) {
    *self.sale_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
  }

  pub fn release_sales(&self) {
    if let Some(gate) = self.sale_gate.lock().unwrap().take() {
      gate.close();
    }
  }

  /// Payloads that reached the endpoint with a success status.
  pub fn submissions(&self) -> Vec<Value> {
    self.submitted.lock().unwrap().clone()
  }
}

impl Fetcher for FakeNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    self.fetched.lock().unwrap().push(request.url.clone());

    if self.offline.lock().unwrap().contains(&request.url) {
      return Err(eyre!("Failed to fetch {}: network unreachable", request.url));
    }

    Ok(
      self
        .routes
        .lock()
        .unwrap()
        .get(&request.url)
        .cloned()
        .unwrap_or_else(|| Response {
          url: request.url.clone(),
          status: 404,
          response_type: ResponseType::Basic,
          headers: Vec::new(),
          body: Vec::new(),
        }),
    )
  }
}

impl SaleSubmitter for FakeNetwork {
  async fn submit(&self, payload: &Value) -> Result<()> {
    let gate = self.sale_gate.lock().unwrap().clone();
    if let Some(gate) = gate {
      // Fails once the gate is closed, which is the release signal
      let _ = gate.acquire().await;
    }

    let status = self.sale_status.lock().unwrap().unwrap_or(200);
    let rejected = payload
      .get("productId")
      .and_then(Value::as_str)
      .is_some_and(|id| self.rejected_products.lock().unwrap().contains(id));

    if rejected || !(200..300).contains(&status) {
      return Err(eyre!("Sale endpoint returned {}", status));
    }

    self.submitted.lock().unwrap().push(payload.clone());
    Ok(())
  }
}
