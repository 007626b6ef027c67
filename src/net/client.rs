use crate::config::Config;
use crate::net::types::{Request, Response, ResponseType};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use url::Url;

/// Performs network fetches on behalf of the asset cache.
///
/// An `Err` means the request never produced a response (offline, DNS,
/// TLS, timeout). HTTP error statuses are returned as `Ok`.
pub trait Fetcher: Send + Sync {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}

/// Delivers a queued sale payload to the remote ingestion endpoint.
///
/// Any `Err`, including a non-2xx status, leaves the sale queued.
pub trait SaleSubmitter: Send + Sync {
  fn submit(&self, payload: &Value) -> impl Future<Output = Result<()>> + Send;
}

/// HTTP client for asset fetches and sale submission
#[derive(Clone)]
pub struct HttpClient {
  client: reqwest::Client,
  origin: Url,
  sale_endpoint: Url,
  token: Option<String>,
}

impl HttpClient {
  pub fn new(config: &Config) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.request_timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      origin: config.origin_url()?,
      sale_endpoint: config.sale_endpoint_url()?,
      token: Config::get_api_token(),
    })
  }
}

impl Fetcher for HttpClient {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let response = self
      .client
      .get(&request.url)
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status().as_u16();
    let final_url = response.url().clone();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(Response {
      url: final_url.to_string(),
      status,
      response_type: response_type_for(&self.origin, &final_url),
      headers,
      body: body.to_vec(),
    })
  }
}

impl SaleSubmitter for HttpClient {
  async fn submit(&self, payload: &Value) -> Result<()> {
    let mut request = self.client.post(self.sale_endpoint.clone()).json(payload);
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }

    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Failed to submit sale: {}", e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!("Sale endpoint returned {}", status));
    }

    Ok(())
  }
}

/// Classify a response by comparing its final URL with the dashboard origin.
pub fn response_type_for(origin: &Url, url: &Url) -> ResponseType {
  if origin.origin() == url.origin() {
    ResponseType::Basic
  } else {
    ResponseType::Cors
  }
}
