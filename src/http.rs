//! Request and response model plus the network seam.
//!
//! Everything that leaves the process goes through [`Network`], so the cache
//! strategies, the queue handlers and the reconciler can be driven by a
//! scripted network in tests.

use color_eyre::{eyre::eyre, Result};
use reqwest::header::{CACHE_CONTROL, PRAGMA};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use url::Url;

pub use reqwest::Method;

/// What the requesting page intends to do with the response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Destination {
  #[default]
  Document,
  Image,
}

/// How a fetch interacts with intermediate HTTP caches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchMode {
  #[default]
  Default,
  /// Bypass intermediate caches (used when checking for upstream updates)
  NoStore,
}

#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
  pub destination: Destination,
  pub mode: FetchMode,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: BTreeMap::new(),
      body: None,
      destination: Destination::default(),
      mode: FetchMode::default(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn with_json<T: Serialize>(self, body: &T) -> Result<Self> {
    let bytes =
      serde_json::to_vec(body).map_err(|e| eyre!("Failed to serialize request body: {}", e))?;
    let mut request = self.with_header("content-type", "application/json");
    request.body = Some(bytes);
    Ok(request)
  }

  pub fn bypass_cache(mut self) -> Self {
    self.mode = FetchMode::NoStore;
    self
  }

  /// Cache key for this request.
  pub fn key(&self) -> String {
    resource_key(&self.url)
  }
}

/// Normalized identifier for a cache entry: the absolute URL without fragment.
pub fn resource_key(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);
  url.into()
}

/// A fully buffered response, as stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  /// Header names are lowercased
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  #[cfg(test)]
  pub fn ok(body: impl Into<Vec<u8>>) -> Self {
    Self::new(200, body)
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  /// Stand-in returned when neither the network nor any fallback is available.
  pub fn service_unavailable() -> Self {
    Self::new(503, "offline: resource not available").with_header("content-type", "text/plain")
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Outbound transport. An `Err` means the network was unreachable; HTTP error
/// statuses come back as `Ok` responses.
pub trait Network: Send + Sync + 'static {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}

/// reqwest-backed network.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("offgrid/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if request.mode == FetchMode::NoStore {
      builder = builder
        .header(CACHE_CONTROL, "no-cache")
        .header(PRAGMA, "no-cache");
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Fetch of {} failed: {}", request.url, e))?;

    let status = response.status().as_u16();
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
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?
      .to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_resource_key_drops_fragment_keeps_query() {
    let url = Url::parse("https://app.example.com/page?tab=2#section").unwrap();
    assert_eq!(resource_key(&url), "https://app.example.com/page?tab=2");
  }

  #[test]
  fn test_header_lookup_is_case_insensitive() {
    let response = Response::ok("x").with_header("ETag", "\"abc\"");
    assert_eq!(response.header("etag"), Some("\"abc\""));
    assert_eq!(response.header("ETAG"), Some("\"abc\""));
  }

  #[test]
  fn test_success_range() {
    assert!(Response::new(204, "").is_success());
    assert!(!Response::new(304, "").is_success());
    assert!(!Response::service_unavailable().is_success());
  }

  #[test]
  fn test_json_body_sets_content_type() {
    let request = Request::new(
      Method::POST,
      Url::parse("http://localhost/api/submit").unwrap(),
    )
    .with_json(&serde_json::json!({"name": "x"}))
    .unwrap();

    assert_eq!(
      request.headers.get("content-type").map(String::as_str),
      Some("application/json")
    );
    assert_eq!(request.body.as_deref(), Some(&br#"{"name":"x"}"#[..]));
  }
}
