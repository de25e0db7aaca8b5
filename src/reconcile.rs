//! Background reconciliation: queue replay, update detection and refresh.

use color_eyre::Result;
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheManager, Fingerprint};
use crate::config::Config;
use crate::http::{resource_key, Network, Request};
use crate::notify::Dispatcher;
use crate::queue::{ActionHandler, DrainReport, SyncQueue};

/// Tag of the reconnect-driven sync.
pub const SYNC_TAG: &str = "sync-data";
/// Tag of the timer-driven sync.
pub const PERIODIC_TAG: &str = "periodic-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
  /// Connectivity came back
  Reconnected,
  /// The periodic timer fired
  Periodic,
}

impl Trigger {
  pub fn tag(&self) -> &'static str {
    match self {
      Self::Reconnected => SYNC_TAG,
      Self::Periodic => PERIODIC_TAG,
    }
  }

  pub fn from_tag(tag: &str) -> Option<Self> {
    match tag {
      SYNC_TAG => Some(Self::Reconnected),
      PERIODIC_TAG => Some(Self::Periodic),
      _ => None,
    }
  }
}

/// What happened to one resource in a check or refresh pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceOutcome {
  /// Upstream fingerprint differed; cache overwritten
  Updated,
  Unchanged,
  /// Re-fetched and overwritten
  Refreshed,
  /// Server answered with a non-success status; cache left alone
  Rejected(u16),
  Failed(String),
}

impl std::fmt::Display for ResourceOutcome {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Updated => f.write_str("updated"),
      Self::Unchanged => f.write_str("unchanged"),
      Self::Refreshed => f.write_str("refreshed"),
      Self::Rejected(status) => write!(f, "rejected with status {}", status),
      Self::Failed(message) => write!(f, "failed: {}", message),
    }
  }
}

#[derive(Debug, Default)]
pub struct PeriodicReport {
  pub checks: Vec<(Url, ResourceOutcome)>,
  pub refreshes: Vec<(Url, ResourceOutcome)>,
  /// `None` when the drain itself failed
  pub drain: Option<DrainReport>,
  pub notified: bool,
}

impl PeriodicReport {
  pub fn updates_found(&self) -> usize {
    self
      .checks
      .iter()
      .filter(|(_, outcome)| *outcome == ResourceOutcome::Updated)
      .count()
  }
}

pub struct Reconciler<N: Network, H: ActionHandler> {
  cache: Arc<CacheManager>,
  network: Arc<N>,
  queue: Arc<SyncQueue>,
  handler: H,
  dispatcher: Arc<Dispatcher>,
  resources: Vec<Url>,
  concurrency: usize,
}

impl<N: Network, H: ActionHandler> Reconciler<N, H> {
  pub fn new(
    config: &Config,
    cache: Arc<CacheManager>,
    network: Arc<N>,
    queue: Arc<SyncQueue>,
    handler: H,
    dispatcher: Arc<Dispatcher>,
  ) -> Result<Self> {
    Ok(Self {
      cache,
      network,
      queue,
      handler,
      dispatcher,
      resources: config.resolve_all(&config.reconcile.fresh_resources)?,
      concurrency: config.reconcile.concurrency.max(1),
    })
  }

  pub fn handler(&self) -> &H {
    &self.handler
  }

  /// Run the path a trigger selects. Errors are logged, never returned.
  pub async fn handle(&self, trigger: Trigger) {
    debug!(tag = trigger.tag(), "Handling trigger");
    match trigger {
      Trigger::Reconnected => {
        if let Err(e) = self.sync().await {
          warn!("Sync queue drain failed: {}", e);
        }
      }
      Trigger::Periodic => {
        self.periodic().await;
      }
    }
  }

  /// Replay the sync queue.
  pub async fn sync(&self) -> Result<DrainReport> {
    self.queue.drain(&self.handler).await
  }

  /// Update check, refresh, then drain. Each step runs even when the one
  /// before it failed. The update notification goes out before the refresh.
  pub async fn periodic(&self) -> PeriodicReport {
    let mut report = PeriodicReport {
      checks: self.check_for_updates().await,
      ..PeriodicReport::default()
    };

    let updates = report.updates_found();
    if updates > 0 {
      info!(updates, "Found upstream updates");
      match self.dispatcher.show_update_available() {
        Ok(_) => report.notified = true,
        Err(e) => warn!("Failed to show update notification: {}", e),
      }
    }

    report.refreshes = self.refresh_resources().await;

    report.drain = match self.sync().await {
      Ok(drain) => Some(drain),
      Err(e) => {
        warn!("Sync queue drain failed: {}", e);
        None
      }
    };

    report
  }

  /// Compare each fresh resource's network fingerprint against the cached copy.
  pub async fn check_for_updates(&self) -> Vec<(Url, ResourceOutcome)> {
    self.for_each_resource(|url| self.check_one(url)).await
  }

  /// Re-fetch and overwrite every fresh resource.
  pub async fn refresh_resources(&self) -> Vec<(Url, ResourceOutcome)> {
    self.for_each_resource(|url| self.refresh_one(url)).await
  }

  /// Bounded-concurrency fan-out that keeps every per-resource outcome.
  async fn for_each_resource<'a, F, Fut>(&'a self, task: F) -> Vec<(Url, ResourceOutcome)>
  where
    F: Fn(Url) -> Fut + 'a,
    Fut: Future<Output = ResourceOutcome> + 'a,
  {
    stream::iter(self.resources.iter().cloned())
      .map(|url| {
        let outcome = task(url.clone());
        async move { (url, outcome.await) }
      })
      .buffered(self.concurrency)
      .collect()
      .await
  }

  async fn check_one(&self, url: Url) -> ResourceOutcome {
    let key = resource_key(&url);
    let cached = match self.cache.match_key(&key) {
      Ok(cached) => cached,
      Err(e) => return failed(&url, "read cached copy", e),
    };

    let response = match self.network.fetch(&Request::get(url.clone()).bypass_cache()).await {
      Ok(response) => response,
      Err(e) => return failed(&url, "check for updates", e),
    };
    if !response.is_success() {
      return ResourceOutcome::Rejected(response.status);
    }

    let fresh = Fingerprint::of(&response);
    if cached.as_ref().map(Fingerprint::of).as_ref() == Some(&fresh) {
      return ResourceOutcome::Unchanged;
    }

    match self.cache.put(self.cache.current(), &key, &response) {
      Ok(()) => {
        info!(url = %url, fingerprint = %fresh, "Found update");
        ResourceOutcome::Updated
      }
      Err(e) => failed(&url, "store update", e),
    }
  }

  async fn refresh_one(&self, url: Url) -> ResourceOutcome {
    let response = match self.network.fetch(&Request::get(url.clone()).bypass_cache()).await {
      Ok(response) => response,
      Err(e) => return failed(&url, "refresh", e),
    };
    if !response.is_success() {
      return ResourceOutcome::Rejected(response.status);
    }

    match self
      .cache
      .put(self.cache.current(), &resource_key(&url), &response)
    {
      Ok(()) => {
        debug!(url = %url, "Refreshed");
        ResourceOutcome::Refreshed
      }
      Err(e) => failed(&url, "store refresh", e),
    }
  }

  /// Serve triggers until the channel closes. The periodic timer's first
  /// tick is one full period after start.
  pub async fn run(&self, mut triggers: mpsc::UnboundedReceiver<Trigger>, period: Duration) {
    let mut timer = tokio::time::interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer.tick().await;

    info!(period_secs = period.as_secs(), "Reconciliation scheduler running");
    loop {
      tokio::select! {
        _ = timer.tick() => self.handle(Trigger::Periodic).await,
        trigger = triggers.recv() => match trigger {
          Some(trigger) => self.handle(trigger).await,
          None => break,
        },
      }
    }
    info!("Reconciliation scheduler stopped");
  }
}

fn failed(url: &Url, what: &str, e: color_eyre::Report) -> ResourceOutcome {
  warn!(url = %url, "Failed to {}: {}", what, e);
  ResourceOutcome::Failed(e.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheStore;
  use crate::config::NotificationConfig;
  use crate::http::Response;
  use crate::notify::UPDATE_TAG;
  use crate::queue::{HttpActionHandler, SyncAction, SyncStatus};
  use crate::testing::{FakeWindows, Journal, RecordingNotifier, StubNetwork};
  use serde_json::json;

  const INDEX: &str = "http://localhost:8080/index.html";
  const MANIFEST: &str = "http://localhost:8080/manifest.json";
  const SUBMIT: &str = "http://localhost:8080/api/submit";

  struct Fixture {
    journal: Journal,
    cache: Arc<CacheManager>,
    network: Arc<StubNetwork>,
    queue: Arc<SyncQueue>,
    notifier: Arc<RecordingNotifier>,
    reconciler: Reconciler<StubNetwork, HttpActionHandler<StubNetwork>>,
  }

  fn fixture() -> Fixture {
    let mut config = Config::default();
    config.reconcile.fresh_resources = vec!["/index.html".into(), "/manifest.json".into()];

    let journal = Journal::default();
    let cache = Arc::new(CacheManager::new(
      Arc::new(CacheStore::open_in_memory().unwrap()),
      config.cache.generation.clone(),
    ));
    let network = Arc::new(StubNetwork::with_journal(journal.clone()));
    let queue = Arc::new(SyncQueue::open_in_memory(false).unwrap());
    let notifier = Arc::new(RecordingNotifier::new(journal.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
      notifier.clone(),
      Arc::new(FakeWindows::new(journal.clone(), &[])),
      NotificationConfig::default(),
      config.origin().unwrap(),
    ));
    let handler = HttpActionHandler::new(&config, Arc::clone(&network)).unwrap();
    let reconciler = Reconciler::new(
      &config,
      Arc::clone(&cache),
      Arc::clone(&network),
      Arc::clone(&queue),
      handler,
      dispatcher,
    )
    .unwrap();

    Fixture {
      journal,
      cache,
      network,
      queue,
      notifier,
      reconciler,
    }
  }

  impl Fixture {
    fn seed(&self, url: &str, response: Response) {
      self
        .cache
        .put(self.cache.current(), url, &response)
        .unwrap();
    }

    fn cached_text(&self, url: &str) -> Option<String> {
      self.cache.match_key(url).unwrap().map(|r| r.text())
    }
  }

  #[test]
  fn test_trigger_tags() {
    assert_eq!(Trigger::from_tag("sync-data"), Some(Trigger::Reconnected));
    assert_eq!(Trigger::from_tag("periodic-sync"), Some(Trigger::Periodic));
    assert_eq!(Trigger::from_tag("other"), None);
    assert_eq!(Trigger::Periodic.tag(), PERIODIC_TAG);
  }

  #[test]
  fn test_outcome_display() {
    assert_eq!(ResourceOutcome::Rejected(404).to_string(), "rejected with status 404");
    assert_eq!(
      ResourceOutcome::Failed("timeout".into()).to_string(),
      "failed: timeout"
    );
  }

  #[tokio::test]
  async fn test_changed_fingerprint_notifies_once_before_refresh_and_drain() {
    let f = fixture();
    f.seed(INDEX, Response::ok("old").with_header("etag", "\"v1\""));
    f.seed(MANIFEST, Response::ok("{}").with_header("etag", "\"m1\""));
    f.network
      .respond(INDEX, Response::ok("new").with_header("etag", "\"v2\""));
    f.network
      .respond(MANIFEST, Response::ok("{}").with_header("etag", "\"m1\""));
    f.network.respond(SUBMIT, Response::ok("{}"));
    f.queue
      .enqueue(&SyncAction::FormSubmit(json!({"a": 1})))
      .unwrap();

    let report = f.reconciler.periodic().await;

    assert_eq!(report.updates_found(), 1);
    assert!(report.notified);
    assert_eq!(f.notifier.shown().len(), 1);
    assert_eq!(f.notifier.shown()[0].tag, UPDATE_TAG);
    assert_eq!(f.cached_text(INDEX).as_deref(), Some("new"));

    let entries = f.journal.entries();
    let shown_at = entries
      .iter()
      .position(|e| e == &format!("show {}", UPDATE_TAG))
      .unwrap();
    let index_fetch = format!("fetch GET {}", INDEX);
    assert_eq!(
      entries[..shown_at].iter().filter(|e| **e == index_fetch).count(),
      1
    );
    assert_eq!(
      entries[shown_at..].iter().filter(|e| **e == index_fetch).count(),
      1
    );
    assert!(entries[shown_at..].contains(&format!("fetch POST {}", SUBMIT)));
    assert_eq!(report.drain.unwrap().completed.len(), 1);
  }

  #[tokio::test]
  async fn test_unchanged_resources_are_still_refreshed() {
    let f = fixture();
    f.seed(INDEX, Response::ok("same"));
    f.seed(MANIFEST, Response::ok("{}"));
    f.network.respond(INDEX, Response::ok("same"));
    f.network.respond(MANIFEST, Response::ok("{}"));

    let report = f.reconciler.periodic().await;

    assert_eq!(report.updates_found(), 0);
    assert!(!report.notified);
    assert!(f.notifier.shown().is_empty());
    assert_eq!(
      report.checks,
      vec![
        (Url::parse(INDEX).unwrap(), ResourceOutcome::Unchanged),
        (Url::parse(MANIFEST).unwrap(), ResourceOutcome::Unchanged),
      ]
    );
    assert!(report
      .refreshes
      .iter()
      .all(|(_, outcome)| *outcome == ResourceOutcome::Refreshed));
    assert_eq!(f.network.calls_to(INDEX), 2);
  }

  #[tokio::test]
  async fn test_checks_bypass_intermediate_caches() {
    let f = fixture();
    f.network.respond(INDEX, Response::ok("x"));
    f.network.respond(MANIFEST, Response::ok("y"));

    f.reconciler.check_for_updates().await;

    assert!(f
      .network
      .requests()
      .iter()
      .all(|r| r.mode == crate::http::FetchMode::NoStore));
  }

  #[tokio::test]
  async fn test_failures_are_collected_and_later_steps_still_run() {
    let f = fixture();
    f.seed(MANIFEST, Response::ok("old"));
    f.network.respond(MANIFEST, Response::new(503, "busy"));
    f.network.fail(SUBMIT);
    let id = f
      .queue
      .enqueue(&SyncAction::FormSubmit(json!({})))
      .unwrap();

    let report = f.reconciler.periodic().await;

    assert!(matches!(report.checks[0].1, ResourceOutcome::Failed(_)));
    assert_eq!(report.checks[1].1, ResourceOutcome::Rejected(503));
    assert!(matches!(report.refreshes[0].1, ResourceOutcome::Failed(_)));
    assert_eq!(f.cached_text(MANIFEST).as_deref(), Some("old"));
    assert!(!report.notified);

    let drain = report.drain.unwrap();
    assert_eq!(drain.failed.len(), 1);
    assert_eq!(f.queue.get(id).unwrap().unwrap().status, SyncStatus::Failed);
  }

  #[tokio::test]
  async fn test_new_resource_counts_as_update() {
    let f = fixture();
    f.seed(MANIFEST, Response::ok("{}"));
    f.network.respond(INDEX, Response::ok("first copy"));
    f.network.respond(MANIFEST, Response::ok("{}"));

    let checks = f.reconciler.check_for_updates().await;

    assert_eq!(checks[0].1, ResourceOutcome::Updated);
    assert_eq!(checks[1].1, ResourceOutcome::Unchanged);
    assert_eq!(f.cached_text(INDEX).as_deref(), Some("first copy"));
  }

  #[tokio::test]
  async fn test_run_handles_reconnect_and_stops_when_channel_closes() {
    let f = fixture();
    f.network.respond(SUBMIT, Response::ok("{}"));
    let id = f
      .queue
      .enqueue(&SyncAction::FormSubmit(json!({})))
      .unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tx.send(Trigger::Reconnected).unwrap();
    drop(tx);

    f.reconciler.run(rx, Duration::from_secs(3600)).await;

    assert_eq!(
      f.queue.get(id).unwrap().unwrap().status,
      SyncStatus::Completed
    );
    assert_eq!(f.network.calls_to(INDEX), 0);
  }
}
