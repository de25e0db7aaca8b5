use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::payload::{Notification, NotificationPayload, CLOSE_ACTION};
use crate::config::NotificationConfig;

/// Platform surface that renders notifications.
///
/// Showing a notification whose tag is already visible replaces it.
pub trait Notifier: Send + Sync {
  fn show(&self, notification: &Notification) -> Result<()>;
  fn close(&self, tag: &str) -> Result<()>;
}

/// An open application window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowClient {
  pub id: String,
  pub url: Url,
}

/// Platform surface for the application windows this process controls.
pub trait WindowClients: Send + Sync {
  fn windows(&self) -> Result<Vec<WindowClient>>;
  fn focus(&self, id: &str) -> Result<()>;
  fn open_window(&self, url: &Url) -> Result<()>;
  /// Take control of every open window without a reload.
  fn claim(&self) -> Result<()>;
}

/// A click on a shown notification.
#[derive(Debug, Clone)]
pub struct NotificationClick {
  pub notification: Notification,
  /// Action button that was clicked; `None` for the notification body
  pub action: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
  Dismissed,
  Focused(String),
  Opened(Url),
}

/// Turns push payloads into notifications and routes clicks to windows.
pub struct Dispatcher {
  notifier: Arc<dyn Notifier>,
  clients: Arc<dyn WindowClients>,
  settings: NotificationConfig,
  origin: Url,
}

impl Dispatcher {
  pub fn new(
    notifier: Arc<dyn Notifier>,
    clients: Arc<dyn WindowClients>,
    settings: NotificationConfig,
    origin: Url,
  ) -> Self {
    Self {
      notifier,
      clients,
      settings,
      origin,
    }
  }

  /// Show exactly one notification for a push, whatever its payload.
  pub fn on_push(&self, data: Option<&[u8]>) -> Result<Notification> {
    let payload = NotificationPayload::parse(data);
    let notification = Notification::from_payload(&payload, &self.settings, Utc::now());

    self.notifier.show(&notification)?;
    info!(tag = %notification.tag, title = %notification.title, "Showed push notification");
    Ok(notification)
  }

  /// Close the notification, then focus or open the target window.
  pub fn on_notification_click(&self, click: &NotificationClick) -> Result<ClickOutcome> {
    let notification = &click.notification;
    self.notifier.close(&notification.tag)?;

    if click.action.as_deref() == Some(CLOSE_ACTION) {
      debug!(tag = %notification.tag, "Notification dismissed");
      return Ok(ClickOutcome::Dismissed);
    }

    let target = self
      .origin
      .join(&notification.data.url)
      .map_err(|e| eyre!("Invalid notification url '{}': {}", notification.data.url, e))?;

    let windows = self.clients.windows()?;
    if let Some(window) = windows.iter().find(|w| same_location(&w.url, &target)) {
      self.clients.focus(&window.id)?;
      info!(window = %window.id, url = %target, "Focused existing window");
      return Ok(ClickOutcome::Focused(window.id.clone()));
    }

    self.clients.open_window(&target)?;
    info!(url = %target, "Opened new window");
    Ok(ClickOutcome::Opened(target))
  }

  pub fn on_notification_close(&self, notification: &Notification) {
    info!(
      tag = %notification.tag,
      url = %notification.data.url,
      arrived_at = %notification.data.arrived_at,
      "Notification closed"
    );
  }

  /// Local notification for the periodic update check.
  pub fn show_update_available(&self) -> Result<Notification> {
    let notification = Notification::update_available(&self.settings, Utc::now());
    self.notifier.show(&notification)?;
    info!("Showed update notification");
    Ok(notification)
  }
}

fn same_location(a: &Url, b: &Url) -> bool {
  let mut a = a.clone();
  let mut b = b.clone();
  a.set_fragment(None);
  b.set_fragment(None);
  a == b
}

/// Notifier that writes notifications to stdout as JSON lines.
pub struct StdoutNotifier;

impl Notifier for StdoutNotifier {
  fn show(&self, notification: &Notification) -> Result<()> {
    let line = serde_json::to_string(notification)
      .map_err(|e| eyre!("Failed to serialize notification: {}", e))?;
    println!("{}", line);
    Ok(())
  }

  fn close(&self, tag: &str) -> Result<()> {
    debug!(tag, "Closed notification");
    Ok(())
  }
}

/// Window set for processes that run without any application window.
pub struct HeadlessClients;

impl WindowClients for HeadlessClients {
  fn windows(&self) -> Result<Vec<WindowClient>> {
    Ok(Vec::new())
  }

  fn focus(&self, id: &str) -> Result<()> {
    Err(eyre!("No window with id {}", id))
  }

  fn open_window(&self, url: &Url) -> Result<()> {
    warn!(url = %url, "No window system available; not opening window");
    Ok(())
  }

  fn claim(&self) -> Result<()> {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{FakeWindows, Journal, RecordingNotifier};

  fn dispatcher(windows: &[(&str, &str)]) -> (Dispatcher, Arc<RecordingNotifier>, Journal) {
    let journal = Journal::default();
    let notifier = Arc::new(RecordingNotifier::new(journal.clone()));
    let clients = Arc::new(FakeWindows::new(journal.clone(), windows));
    let dispatcher = Dispatcher::new(
      notifier.clone(),
      clients,
      NotificationConfig::default(),
      Url::parse("http://localhost:8080/").unwrap(),
    );
    (dispatcher, notifier, journal)
  }

  fn click(notification: Notification, action: Option<&str>) -> NotificationClick {
    NotificationClick {
      notification,
      action: action.map(String::from),
    }
  }

  #[test]
  fn test_push_shows_exactly_one_notification() {
    let (dispatcher, notifier, _) = dispatcher(&[]);

    let n = dispatcher
      .on_push(Some(br#"{"title":"New","body":"hi"}"#))
      .unwrap();

    assert_eq!(notifier.shown().len(), 1);
    assert_eq!(n.title, "New");
    assert_eq!(n.body, "hi");
    assert_eq!(n.icon, "/logo-any.png");
    assert_eq!(n.tag, "default");
  }

  #[test]
  fn test_same_tag_replaces_visible_notification() {
    let (dispatcher, notifier, _) = dispatcher(&[]);

    dispatcher.on_push(Some(br#"{"body":"first"}"#)).unwrap();
    dispatcher.on_push(Some(br#"{"body":"second"}"#)).unwrap();
    dispatcher
      .on_push(Some(br#"{"body":"other","tag":"chat"}"#))
      .unwrap();

    let visible = notifier.visible();
    assert_eq!(visible.len(), 2);
    assert_eq!(visible["default"].body, "second");
    assert_eq!(visible["chat"].body, "other");
  }

  #[test]
  fn test_open_click_opens_new_window_when_none_matches() {
    let (dispatcher, _, journal) = dispatcher(&[("w1", "http://localhost:8080/settings")]);
    let n = dispatcher.on_push(Some(br#"{"title":"New","body":"hi"}"#)).unwrap();

    let outcome = dispatcher
      .on_notification_click(&click(n, Some("open")))
      .unwrap();

    assert_eq!(
      outcome,
      ClickOutcome::Opened(Url::parse("http://localhost:8080/").unwrap())
    );
    assert_eq!(
      journal.entries(),
      vec![
        "show default",
        "close default",
        "open http://localhost:8080/"
      ]
    );
  }

  #[test]
  fn test_body_click_focuses_matching_window() {
    let (dispatcher, _, journal) = dispatcher(&[
      ("w1", "http://localhost:8080/settings"),
      ("w2", "http://localhost:8080/inbox#latest"),
    ]);
    let n = dispatcher
      .on_push(Some(br#"{"data":{"url":"/inbox"}}"#))
      .unwrap();

    let outcome = dispatcher.on_notification_click(&click(n, None)).unwrap();

    assert_eq!(outcome, ClickOutcome::Focused("w2".to_string()));
    assert_eq!(journal.entries().last().unwrap(), "focus w2");
  }

  #[test]
  fn test_close_click_only_dismisses() {
    let (dispatcher, notifier, journal) = dispatcher(&[]);
    let n = dispatcher.on_push(None).unwrap();

    let outcome = dispatcher
      .on_notification_click(&click(n, Some("close")))
      .unwrap();

    assert_eq!(outcome, ClickOutcome::Dismissed);
    assert!(notifier.visible().is_empty());
    assert_eq!(journal.entries(), vec!["show default", "close default"]);
  }
}
