//! Queued actions and the handler that replays them.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use url::Url;

use crate::config::Config;
use crate::http::{Method, Network, Request};

pub const FORM_SUBMIT: &str = "form_submit";
pub const DATA_UPDATE: &str = "data_update";

/// A mutating operation waiting to be executed.
///
/// Unrecognised types are kept verbatim so they stay visible in the queue
/// and fail with a clear error instead of being dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawAction", into = "RawAction")]
pub enum SyncAction {
  FormSubmit(Value),
  DataUpdate(Value),
  Unknown { kind: String, data: Value },
}

/// Wire shape: `{"type": "...", "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawAction {
  #[serde(rename = "type")]
  kind: String,
  #[serde(default)]
  data: Value,
}

impl From<RawAction> for SyncAction {
  fn from(raw: RawAction) -> Self {
    Self::from_parts(&raw.kind, raw.data)
  }
}

impl From<SyncAction> for RawAction {
  fn from(action: SyncAction) -> Self {
    Self {
      kind: action.kind().to_string(),
      data: action.data().clone(),
    }
  }
}

impl SyncAction {
  pub fn from_parts(kind: &str, data: Value) -> Self {
    match kind {
      FORM_SUBMIT => Self::FormSubmit(data),
      DATA_UPDATE => Self::DataUpdate(data),
      other => Self::Unknown {
        kind: other.to_string(),
        data,
      },
    }
  }

  pub fn kind(&self) -> &str {
    match self {
      Self::FormSubmit(_) => FORM_SUBMIT,
      Self::DataUpdate(_) => DATA_UPDATE,
      Self::Unknown { kind, .. } => kind,
    }
  }

  pub fn data(&self) -> &Value {
    match self {
      Self::FormSubmit(data) | Self::DataUpdate(data) => data,
      Self::Unknown { data, .. } => data,
    }
  }
}

/// Executes one queued action. An `Err` marks the item as failed.
pub trait ActionHandler: Send + Sync {
  fn execute(&self, action: &SyncAction) -> impl Future<Output = Result<Value>> + Send;
}

/// Replays actions against the application API: POST for form submissions,
/// PUT for data updates, both with a JSON body.
pub struct HttpActionHandler<N: Network> {
  network: Arc<N>,
  submit_endpoint: Url,
  update_endpoint: Url,
}

impl<N: Network> HttpActionHandler<N> {
  pub fn new(config: &Config, network: Arc<N>) -> Result<Self> {
    Ok(Self {
      network,
      submit_endpoint: config.resolve(&config.api.submit_endpoint)?,
      update_endpoint: config.resolve(&config.api.update_endpoint)?,
    })
  }

  async fn send(&self, method: Method, url: &Url, data: &Value, what: &str) -> Result<Value> {
    let request = Request::new(method, url.clone()).with_json(data)?;
    let response = self.network.fetch(&request).await?;

    if !response.is_success() {
      return Err(eyre!("{} failed with status {}", what, response.status));
    }

    serde_json::from_slice(&response.body)
      .map_err(|e| eyre!("{} returned an invalid JSON body: {}", what, e))
  }
}

impl<N: Network> ActionHandler for HttpActionHandler<N> {
  async fn execute(&self, action: &SyncAction) -> Result<Value> {
    match action {
      SyncAction::FormSubmit(data) => {
        self
          .send(Method::POST, &self.submit_endpoint, data, "Form submission")
          .await
      }
      SyncAction::DataUpdate(data) => {
        self
          .send(Method::PUT, &self.update_endpoint, data, "Data update")
          .await
      }
      SyncAction::Unknown { kind, .. } => Err(eyre!("Unknown action type: {}", kind)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Response;
  use crate::testing::StubNetwork;
  use serde_json::json;

  fn handler() -> (HttpActionHandler<StubNetwork>, Arc<StubNetwork>) {
    let network = Arc::new(StubNetwork::new());
    let handler = HttpActionHandler::new(&Config::default(), Arc::clone(&network)).unwrap();
    (handler, network)
  }

  #[test]
  fn test_wire_shape() {
    let action: SyncAction =
      serde_json::from_value(json!({"type": "form_submit", "data": {"name": "a"}})).unwrap();
    assert_eq!(action, SyncAction::FormSubmit(json!({"name": "a"})));

    let unknown: SyncAction = serde_json::from_value(json!({"type": "delete_all"})).unwrap();
    assert_eq!(unknown.kind(), "delete_all");
    assert_eq!(unknown.data(), &Value::Null);

    assert_eq!(
      serde_json::to_value(SyncAction::DataUpdate(json!([1]))).unwrap(),
      json!({"type": "data_update", "data": [1]})
    );
  }

  #[tokio::test]
  async fn test_form_submit_posts_json() {
    let (handler, network) = handler();
    network.respond(
      "http://localhost:8080/api/submit",
      Response::ok(r#"{"ok":true}"#),
    );

    let result = handler
      .execute(&SyncAction::FormSubmit(json!({"email": "a@b.c"})))
      .await
      .unwrap();

    assert_eq!(result, json!({"ok": true}));
    let requests = network.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, Method::POST);
    assert_eq!(requests[0].body.as_deref(), Some(&br#"{"email":"a@b.c"}"#[..]));
  }

  #[tokio::test]
  async fn test_data_update_puts_json() {
    let (handler, network) = handler();
    network.respond("http://localhost:8080/api/update", Response::ok("{}"));

    handler
      .execute(&SyncAction::DataUpdate(json!({"id": 1})))
      .await
      .unwrap();

    assert_eq!(network.requests()[0].method, Method::PUT);
  }

  #[tokio::test]
  async fn test_error_status_fails() {
    let (handler, network) = handler();
    network.respond(
      "http://localhost:8080/api/submit",
      Response::new(422, r#"{"error":"invalid"}"#),
    );

    let err = handler
      .execute(&SyncAction::FormSubmit(json!({})))
      .await
      .unwrap_err();

    assert_eq!(err.to_string(), "Form submission failed with status 422");
  }

  #[tokio::test]
  async fn test_unknown_action_fails_without_network() {
    let (handler, network) = handler();

    let err = handler
      .execute(&SyncAction::from_parts("archive", Value::Null))
      .await
      .unwrap_err();

    assert_eq!(err.to_string(), "Unknown action type: archive");
    assert_eq!(network.calls(), 0);
  }
}
