//! Push subscription registration.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::future::Future;
use tracing::info;
use url::Url;

use crate::http::{Method, Network, Request};

/// Platform push service that turns an application server key into a
/// subscription object.
pub trait PushService: Send + Sync {
  fn subscribe(&self, server_key: &str) -> impl Future<Output = Result<Value>> + Send;
}

/// Fetch the server key, subscribe, and hand the subscription to the
/// application server. Any failure aborts the registration.
pub async fn register<N: Network, P: PushService>(
  network: &N,
  push: &P,
  key_url: &Url,
  subscription_url: &Url,
) -> Result<Value> {
  let response = network
    .fetch(&Request::get(key_url.clone()).bypass_cache())
    .await
    .map_err(|e| eyre!("Failed to fetch push server key: {}", e))?;
  if !response.is_success() {
    return Err(eyre!(
      "Push server key request failed with status {}",
      response.status
    ));
  }

  let key = response.text().trim().to_string();
  if key.is_empty() {
    return Err(eyre!("Push server key is empty"));
  }

  let subscription = push
    .subscribe(&key)
    .await
    .map_err(|e| eyre!("Failed to subscribe to push service: {}", e))?;

  let request = Request::new(Method::POST, subscription_url.clone()).with_json(&subscription)?;
  let response = network
    .fetch(&request)
    .await
    .map_err(|e| eyre!("Failed to send push subscription: {}", e))?;
  if !response.is_success() {
    return Err(eyre!(
      "Push subscription upload failed with status {}",
      response.status
    ));
  }

  info!(endpoint = %subscription_url, "Registered push subscription");
  Ok(subscription)
}

/// Push service for hosts without a platform push channel. The subscription
/// only records the key it was made for.
pub struct LocalPushService {
  endpoint: Url,
}

impl LocalPushService {
  pub fn new(endpoint: Url) -> Self {
    Self { endpoint }
  }
}

impl PushService for LocalPushService {
  async fn subscribe(&self, server_key: &str) -> Result<Value> {
    Ok(serde_json::json!({
      "endpoint": self.endpoint.as_str(),
      "keys": { "applicationServerKey": server_key },
    }))
  }
}
