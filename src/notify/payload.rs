use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::NotificationConfig;

pub const OPEN_ACTION: &str = "open";
pub const CLOSE_ACTION: &str = "close";

/// Tag of the locally generated "update available" notification.
pub const UPDATE_TAG: &str = "app-update";

/// Push payload as sent by the push service. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NotificationPayload {
  pub title: Option<String>,
  pub body: Option<String>,
  pub icon: Option<String>,
  pub badge: Option<String>,
  pub tag: Option<String>,
  /// Shorthand for `data.url`
  pub url: Option<String>,
  pub data: Option<Map<String, Value>>,
}

impl NotificationPayload {
  /// Parse raw push data. Never fails: absent data yields an empty payload
  /// and anything that is not a JSON object becomes the body text.
  pub fn parse(data: Option<&[u8]>) -> Self {
    let Some(bytes) = data else {
      return Self::default();
    };

    match serde_json::from_slice::<Self>(bytes) {
      Ok(payload) => payload,
      Err(_) => {
        let text = String::from_utf8_lossy(bytes).trim().to_string();
        Self {
          body: (!text.is_empty()).then_some(text),
          ..Self::default()
        }
      }
    }
  }

  /// Where a click on the notification should lead.
  pub fn target_url(&self) -> Option<&str> {
    self
      .data
      .as_ref()
      .and_then(|d| d.get("url"))
      .and_then(Value::as_str)
      .or(self.url.as_deref())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  pub icon: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationData {
  pub url: String,
  pub arrived_at: DateTime<Utc>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// A fully resolved notification, ready to be shown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  pub actions: Vec<NotificationAction>,
  pub require_interaction: bool,
  /// Re-alert when replacing a notification with the same tag
  pub renotify: bool,
  pub silent: bool,
  pub tag: String,
  pub data: NotificationData,
}

impl Notification {
  pub fn from_payload(
    payload: &NotificationPayload,
    settings: &NotificationConfig,
    arrived_at: DateTime<Utc>,
  ) -> Self {
    let mut extra = payload.data.clone().unwrap_or_default();
    extra.remove("url");

    Self {
      title: payload
        .title
        .clone()
        .unwrap_or_else(|| settings.app_name.clone()),
      body: payload
        .body
        .clone()
        .unwrap_or_else(|| settings.default_body.clone()),
      icon: payload.icon.clone().unwrap_or_else(|| settings.icon.clone()),
      badge: payload
        .badge
        .clone()
        .unwrap_or_else(|| settings.badge.clone()),
      vibrate: settings.vibration.clone(),
      actions: default_actions(settings),
      require_interaction: true,
      renotify: true,
      silent: false,
      tag: payload
        .tag
        .clone()
        .unwrap_or_else(|| settings.default_tag.clone()),
      data: NotificationData {
        url: payload
          .target_url()
          .unwrap_or(&settings.default_url)
          .to_string(),
        arrived_at,
        extra,
      },
    }
  }

  /// Local notification announcing that cached resources were updated.
  pub fn update_available(settings: &NotificationConfig, arrived_at: DateTime<Utc>) -> Self {
    let payload = NotificationPayload {
      body: Some(settings.update_body.clone()),
      tag: Some(UPDATE_TAG.to_string()),
      ..NotificationPayload::default()
    };
    Self::from_payload(&payload, settings, arrived_at)
  }
}

fn default_actions(settings: &NotificationConfig) -> Vec<NotificationAction> {
  vec![
    NotificationAction {
      action: OPEN_ACTION.to_string(),
      title: settings.open_title.clone(),
      icon: settings.icon.clone(),
    },
    NotificationAction {
      action: CLOSE_ACTION.to_string(),
      title: settings.close_title.clone(),
      icon: settings.icon.clone(),
    },
  ]
}
