//! Network access: intercepted request/response types and the HTTP client.

pub mod client;
pub mod types;

pub use client::{Fetcher, HttpClient, SaleSubmitter};
pub use types::{Request, Response, ResponseType};
