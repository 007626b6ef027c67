use serde::{Deserialize, Serialize};

/// How the response relates to the dashboard origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
  /// Same-origin response
  Basic,
  /// Cross-origin response
  Cors,
}

impl ResponseType {
  pub fn as_str(&self) -> &'static str {
    match self {
      ResponseType::Basic => "basic",
      ResponseType::Cors => "cors",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "basic" => Some(ResponseType::Basic),
      "cors" => Some(ResponseType::Cors),
      _ => None,
    }
  }
}

/// Whether a request is a top-level page navigation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  Navigate,
  #[default]
  Subresource,
}

/// An intercepted GET request, identified by its absolute URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub url: String,
  pub mode: RequestMode,
}

impl Request {
  pub fn get(url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      mode: RequestMode::Subresource,
    }
  }

  pub fn navigate(url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      mode: RequestMode::Navigate,
    }
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }
}

/// A fully buffered HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  /// Final URL after redirects
  pub url: String,
  pub status: u16,
  pub response_type: ResponseType,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  /// True for any 2xx status.
  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Only complete same-origin responses may enter the cache at runtime.
  pub fn is_cacheable(&self) -> bool {
    self.status == 200 && self.response_type == ResponseType::Basic
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}
