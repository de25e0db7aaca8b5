//! Test doubles for the platform and network seams.

use color_eyre::{eyre::eyre, Result};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use url::Url;

use crate::http::{resource_key, Network, Request, Response};
use crate::notify::{Notification, Notifier, WindowClient, WindowClients};

/// Scripted network. Unknown URLs fail as if the host were unreachable.
///
/// Each URL holds a queue of replies; the last reply repeats forever.
#[derive(Default)]
pub struct StubNetwork {
  routes: Mutex<HashMap<String, VecDeque<Option<Response>>>>,
  requests: Mutex<Vec<Request>>,
  journal: Option<Journal>,
}

impl StubNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  /// Also log every fetch as `fetch METHOD url` into `journal`.
  pub fn with_journal(journal: Journal) -> Self {
    Self {
      journal: Some(journal),
      ..Self::default()
    }
  }

  pub fn respond(&self, url: &str, response: Response) {
    self.script(url, vec![Some(response)]);
  }

  pub fn fail(&self, url: &str) {
    self.script(url, vec![None]);
  }

  /// `None` entries simulate a network failure.
  pub fn script(&self, url: &str, replies: Vec<Option<Response>>) {
    let key = resource_key(&Url::parse(url).unwrap());
    self
      .routes
      .lock()
      .unwrap()
      .insert(key, replies.into_iter().collect());
  }

  pub fn calls(&self) -> usize {
    self.requests.lock().unwrap().len()
  }

  pub fn calls_to(&self, url: &str) -> usize {
    let key = resource_key(&Url::parse(url).unwrap());
    self
      .requests
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.key() == key)
      .count()
  }

  pub fn requests(&self) -> Vec<Request> {
    self.requests.lock().unwrap().clone()
  }

  fn next_reply(&self, key: &str) -> Option<Response> {
    let mut routes = self.routes.lock().unwrap();
    let queue = routes.get_mut(key)?;
    if queue.len() > 1 {
      queue.pop_front().flatten()
    } else {
      queue.front().cloned().flatten()
    }
  }
}

impl Network for StubNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    if let Some(journal) = &self.journal {
      journal.record(format!("fetch {} {}", request.method, request.url));
    }
    self.requests.lock().unwrap().push(request.clone());
    self
      .next_reply(&request.key())
      .ok_or_else(|| eyre!("connection refused: {}", request.url))
  }
}

/// Ordered log shared by the fake platform surfaces.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
  pub fn record(&self, entry: String) {
    self.0.lock().unwrap().push(entry);
  }

  pub fn entries(&self) -> Vec<String> {
    self.0.lock().unwrap().clone()
  }
}

/// Notifier that keeps every shown notification and the visible set by tag.
pub struct RecordingNotifier {
  journal: Journal,
  shown: Mutex<Vec<Notification>>,
  visible: Mutex<BTreeMap<String, Notification>>,
}

impl RecordingNotifier {
  pub fn new(journal: Journal) -> Self {
    Self {
      journal,
      shown: Mutex::new(Vec::new()),
      visible: Mutex::new(BTreeMap::new()),
    }
  }

  pub fn shown(&self) -> Vec<Notification> {
    self.shown.lock().unwrap().clone()
  }

  pub fn visible(&self) -> BTreeMap<String, Notification> {
    self.visible.lock().unwrap().clone()
  }
}

impl Notifier for RecordingNotifier {
  fn show(&self, notification: &Notification) -> Result<()> {
    self.journal.record(format!("show {}", notification.tag));
    self.shown.lock().unwrap().push(notification.clone());
    self
      .visible
      .lock()
      .unwrap()
      .insert(notification.tag.clone(), notification.clone());
    Ok(())
  }

  fn close(&self, tag: &str) -> Result<()> {
    self.journal.record(format!("close {}", tag));
    self.visible.lock().unwrap().remove(tag);
    Ok(())
  }
}

pub struct FakeWindows {
  journal: Journal,
  windows: Mutex<Vec<WindowClient>>,
}

impl FakeWindows {
  pub fn new(journal: Journal, windows: &[(&str, &str)]) -> Self {
    Self {
      journal,
      windows: Mutex::new(
        windows
          .iter()
          .map(|(id, url)| WindowClient {
            id: id.to_string(),
            url: Url::parse(url).unwrap(),
          })
          .collect(),
      ),
    }
  }
}

impl WindowClients for FakeWindows {
  fn windows(&self) -> Result<Vec<WindowClient>> {
    Ok(self.windows.lock().unwrap().clone())
  }

  fn focus(&self, id: &str) -> Result<()> {
    self.journal.record(format!("focus {}", id));
    Ok(())
  }

  fn open_window(&self, url: &Url) -> Result<()> {
    self.journal.record(format!("open {}", url));
    let mut windows = self.windows.lock().unwrap();
    let id = format!("w{}", windows.len() + 1);
    windows.push(WindowClient {
      id,
      url: url.clone(),
    });
    Ok(())
  }

  fn claim(&self) -> Result<()> {
    self.journal.record("claim".to_string());
    Ok(())
  }
}
