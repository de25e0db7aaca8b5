//! The offline worker: lifecycle plus the event entry points that route to
//! the executor, queue, reconciler and dispatcher.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheManager, CacheStore};
use crate::config::Config;
use crate::http::{Network, Request};
use crate::notify::{
  ClickOutcome, Dispatcher, Notification, NotificationClick, Notifier, WindowClients,
};
use crate::push::{self, PushService};
use crate::queue::{ActionHandler, DrainReport, HttpActionHandler, SyncAction, SyncQueue};
use crate::reconcile::{PeriodicReport, Reconciler, Trigger, PERIODIC_TAG};
use crate::strategy::{Executor, Interception};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Parsed,
  Installing,
  Installed,
  Activating,
  Activated,
  /// Install failed; the previous generation keeps serving
  Redundant,
}

/// Result of submitting an action while connectivity is unknown.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
  /// Executed right away; carries the server's reply
  Sent(Value),
  /// Execution failed; stored in the sync queue under this id
  Queued(i64),
}

pub struct OfflineWorker<N: Network> {
  config: Config,
  cache: Arc<CacheManager>,
  queue: Arc<SyncQueue>,
  network: Arc<N>,
  executor: Executor<N>,
  /// Serves from the generation that was active at startup until this
  /// worker activates its own
  previous: Option<(Arc<CacheManager>, Executor<N>)>,
  reconciler: Reconciler<N, HttpActionHandler<N>>,
  dispatcher: Arc<Dispatcher>,
  clients: Arc<dyn WindowClients>,
  precache: Vec<Url>,
  state: Mutex<WorkerState>,
  periodic: Mutex<Option<Duration>>,
}

impl<N: Network> OfflineWorker<N> {
  /// Open the on-disk cache and queue stores under the data directory.
  pub fn open(
    config: Config,
    network: Arc<N>,
    notifier: Arc<dyn Notifier>,
    clients: Arc<dyn WindowClients>,
  ) -> Result<Self> {
    let store = Arc::new(CacheStore::open(&config.cache_db_path()?)?);
    let queue = Arc::new(SyncQueue::open(
      &config.queue_db_path()?,
      config.queue.retry_failed,
    )?);
    Self::with_stores(config, store, queue, network, notifier, clients)
  }

  pub fn with_stores(
    config: Config,
    store: Arc<CacheStore>,
    queue: Arc<SyncQueue>,
    network: Arc<N>,
    notifier: Arc<dyn Notifier>,
    clients: Arc<dyn WindowClients>,
  ) -> Result<Self> {
    let generation = config.cache.generation.clone();
    let active = store.active_generation()?;
    let state = if active.as_deref() == Some(generation.as_str()) {
      WorkerState::Activated
    } else {
      WorkerState::Parsed
    };

    let previous = match active {
      Some(name) if name != generation => {
        debug!(generation = %name, "Previous generation keeps serving until activation");
        let cache = Arc::new(CacheManager::new(Arc::clone(&store), name));
        let executor = Executor::new(&config, Arc::clone(&cache), Arc::clone(&network))?;
        Some((cache, executor))
      }
      _ => None,
    };

    let cache = Arc::new(CacheManager::new(store, generation));
    let dispatcher = Arc::new(Dispatcher::new(
      notifier,
      Arc::clone(&clients),
      config.notifications.clone(),
      config.origin()?,
    ));
    let executor = Executor::new(&config, Arc::clone(&cache), Arc::clone(&network))?;
    let handler = HttpActionHandler::new(&config, Arc::clone(&network))?;
    let reconciler = Reconciler::new(
      &config,
      Arc::clone(&cache),
      Arc::clone(&network),
      Arc::clone(&queue),
      handler,
      Arc::clone(&dispatcher),
    )?;

    debug!(?state, generation = cache.current(), "Worker loaded");
    Ok(Self {
      precache: config.resolve_all(&config.cache.precache)?,
      config,
      cache,
      queue,
      network,
      executor,
      previous,
      reconciler,
      dispatcher,
      clients,
      state: Mutex::new(state),
      periodic: Mutex::new(None),
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn cache(&self) -> &CacheManager {
    &self.cache
  }

  pub fn queue(&self) -> &SyncQueue {
    &self.queue
  }

  pub fn network(&self) -> &Arc<N> {
    &self.network
  }

  pub fn reconciler(&self) -> &Reconciler<N, HttpActionHandler<N>> {
    &self.reconciler
  }

  pub fn state(&self) -> WorkerState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn set_state(&self, state: WorkerState) {
    *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    debug!(?state, "Worker state changed");
  }

  /// Interval registered for periodic reconciliation during install.
  pub fn periodic_registration(&self) -> Option<Duration> {
    *self.periodic.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Pre-cache the current generation and prepare the queue.
  ///
  /// Every pre-cache resource must be fetched successfully; otherwise the
  /// worker becomes redundant and the active generation is left untouched.
  pub async fn install(&self) -> Result<()> {
    let state = self.state();
    if state != WorkerState::Parsed {
      return Err(eyre!("Cannot install from state {:?}", state));
    }
    self.set_state(WorkerState::Installing);

    match self.install_steps().await {
      Ok(count) => {
        self.set_state(WorkerState::Installed);
        info!(generation = self.cache.current(), count, "Worker installed");
        Ok(())
      }
      Err(e) => {
        self.set_state(WorkerState::Redundant);
        warn!(generation = self.cache.current(), "Install failed: {}", e);
        Err(e)
      }
    }
  }

  async fn install_steps(&self) -> Result<usize> {
    let generation = self.cache.current();
    self.cache.open(generation)?;
    let count = self
      .cache
      .populate_all(
        generation,
        &self.precache,
        &*self.network,
        self.config.reconcile.concurrency,
      )
      .await?;
    self.queue.migrate()?;

    let period = self.config.periodic_interval();
    *self.periodic.lock().unwrap_or_else(|e| e.into_inner()) = Some(period);
    debug!(tag = PERIODIC_TAG, period_secs = period.as_secs(), "Registered periodic sync");
    Ok(count)
  }

  /// Make the installed generation the only one and take over open windows.
  pub async fn activate(&self) -> Result<()> {
    let state = self.state();
    if state != WorkerState::Installed {
      return Err(eyre!("Cannot activate from state {:?}", state));
    }
    self.set_state(WorkerState::Activating);

    let generation = self.cache.current();
    let result = self
      .cache
      .evict_stale(generation)
      .and_then(|_| self.cache.activate(generation))
      .and_then(|_| self.clients.claim());

    match result {
      Ok(()) => {
        self.set_state(WorkerState::Activated);
        info!(generation, "Worker activated");
        Ok(())
      }
      Err(e) => {
        self.set_state(WorkerState::Installed);
        Err(e)
      }
    }
  }

  /// Intercept a request.
  ///
  /// Before activation (and after a failed install) requests are served
  /// from the previously active generation; they pass through only when no
  /// generation was ever activated.
  pub async fn fetch(&self, request: &Request) -> Result<Interception> {
    if self.state() == WorkerState::Activated {
      return self.executor.handle(request).await;
    }
    match &self.previous {
      Some((_, executor)) => executor.handle(request).await,
      None => Ok(Interception::Passthrough),
    }
  }

  /// One-shot sync event. Returns `None` for tags this worker does not own.
  pub async fn sync(&self, tag: &str) -> Result<Option<DrainReport>> {
    match Trigger::from_tag(tag) {
      Some(Trigger::Reconnected) => self.reconciler.sync().await.map(Some),
      _ => {
        warn!(tag, "Ignoring sync event with unknown tag");
        Ok(None)
      }
    }
  }

  pub async fn periodic_sync(&self, tag: &str) -> Option<PeriodicReport> {
    match Trigger::from_tag(tag) {
      Some(Trigger::Periodic) => Some(self.reconciler.periodic().await),
      _ => {
        warn!(tag, "Ignoring periodic sync event with unknown tag");
        None
      }
    }
  }

  /// Execute an action now, or queue it for the next sync if that fails.
  pub async fn submit(&self, action: SyncAction) -> Result<SubmitOutcome> {
    match self.reconciler.handler().execute(&action).await {
      Ok(reply) => Ok(SubmitOutcome::Sent(reply)),
      Err(e) => {
        let id = self.queue.enqueue(&action)?;
        info!(id, kind = action.kind(), "Queued action for later sync: {}", e);
        Ok(SubmitOutcome::Queued(id))
      }
    }
  }

  pub fn push(&self, data: Option<&[u8]>) -> Result<Notification> {
    self.dispatcher.on_push(data)
  }

  pub fn notification_click(&self, click: &NotificationClick) -> Result<ClickOutcome> {
    self.dispatcher.on_notification_click(click)
  }

  pub fn notification_close(&self, notification: &Notification) {
    self.dispatcher.on_notification_close(notification)
  }

  pub async fn register_push<P: PushService>(&self, service: &P) -> Result<Value> {
    let key_url = self.config.resolve(&self.config.api.push_key_endpoint)?;
    let subscription_url = self
      .config
      .resolve(&self.config.api.push_subscription_endpoint)?;
    push::register(&*self.network, service, &key_url, &subscription_url).await
  }

  /// Wait for background cache writes to finish.
  pub async fn settle(&self) {
    if let Some((cache, _)) = &self.previous {
      cache.settle().await;
    }
    self.cache.settle().await;
  }
}
