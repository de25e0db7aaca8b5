mod cache;
mod classify;
mod config;
mod connectivity;
mod http;
mod logging;
mod notify;
mod push;
mod queue;
mod reconcile;
mod strategy;
#[cfg(test)]
mod testing;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::http::{Destination, HttpNetwork, Network, Request};
use crate::notify::{ClickOutcome, HeadlessClients, NotificationClick, StdoutNotifier};
use crate::push::LocalPushService;
use crate::queue::{SyncAction, SyncStatus};
use crate::reconcile::{ResourceOutcome, PERIODIC_TAG, SYNC_TAG};
use crate::strategy::Interception;
use crate::worker::{OfflineWorker, SubmitOutcome, WorkerState};

#[derive(Parser, Debug)]
#[command(name = "offgrid")]
#[command(about = "Offline-first cache, sync queue and push dispatcher for a web application")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offgrid/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Write logs to a daily rolling file in this directory instead of stderr
  #[arg(long)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-cache the configured generation and activate it
  Install,
  /// Serve a request the way an intercepted fetch would be served
  Fetch {
    /// Absolute URL or path relative to the origin
    url: String,
    /// Treat the request as an image load
    #[arg(long)]
    image: bool,
  },
  /// Execute an action now, queueing it if that fails
  Submit {
    #[arg(value_name = "TYPE")]
    kind: String,
    /// JSON payload
    data: String,
  },
  /// Queue an action for the next sync
  Enqueue {
    #[arg(value_name = "TYPE")]
    kind: String,
    /// JSON payload
    data: String,
  },
  /// List queued actions
  Queue,
  /// Mark one failed action (or all of them) as pending again
  Retry { id: Option<i64> },
  /// Replay the sync queue
  Sync {
    #[arg(long, default_value = SYNC_TAG)]
    tag: String,
  },
  /// Run the periodic update check, refresh and sync
  Periodic {
    #[arg(long, default_value = PERIODIC_TAG)]
    tag: String,
  },
  /// Deliver a push message
  Push { payload: Option<String> },
  /// Deliver a push message, then click its notification
  Click {
    payload: Option<String>,
    /// Action button to click (`open` or `close`); omit to click the body
    #[arg(long)]
    action: Option<String>,
  },
  /// Deliver a push message, then dismiss its notification
  Close { payload: Option<String> },
  /// Install if needed, then reconcile on a timer and on reconnect until interrupted
  Run,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = logging::init(args.log_dir.as_deref())?;

  let config = Config::load(args.config.as_deref())?;
  let network = Arc::new(HttpNetwork::new()?);
  let worker = OfflineWorker::open(
    config,
    network,
    Arc::new(StdoutNotifier),
    Arc::new(HeadlessClients),
  )?;

  let result = execute(&worker, args.command).await;
  worker.settle().await;
  result
}

async fn execute<N: Network>(worker: &OfflineWorker<N>, command: Command) -> Result<()> {
  match command {
    Command::Install => {
      if worker.state() == WorkerState::Activated {
        println!("Generation {} is already active", worker.cache().current());
        return Ok(());
      }
      install(worker).await?;
      println!("Activated generation {}", worker.cache().current());
      register_push(worker).await;
    }
    Command::Fetch { url, image } => {
      let url = worker.config().resolve(&url)?;
      let mut request = Request::get(url);
      if image {
        request = request.with_destination(Destination::Image);
      }
      match worker.fetch(&request).await? {
        Interception::Passthrough => {
          println!("passthrough: worker state is {:?}", worker.state());
        }
        Interception::Respond(served) => {
          println!("{} ({:?})", served.response.status, served.source);
          println!("{}", served.response.text());
        }
      }
    }
    Command::Submit { kind, data } => {
      let action = SyncAction::from_parts(&kind, parse_json(&data)?);
      match worker.submit(action).await? {
        SubmitOutcome::Sent(reply) => println!("sent: {}", reply),
        SubmitOutcome::Queued(id) => println!("queued as #{}", id),
      }
    }
    Command::Enqueue { kind, data } => {
      let id = worker
        .queue()
        .enqueue(&SyncAction::from_parts(&kind, parse_json(&data)?))?;
      println!("queued as #{}", id);
    }
    Command::Queue => {
      for item in worker.queue().items()? {
        println!(
          "#{:<5} {:<10} {:<12} {}  attempts={}{}",
          item.id,
          item.status.as_str(),
          item.action.kind(),
          item.timestamp.format("%Y-%m-%d %H:%M:%S"),
          item.attempts,
          item
            .error
            .map(|e| format!("  error={}", e))
            .unwrap_or_default()
        );
      }
    }
    Command::Retry { id: Some(id) } => {
      let item = worker
        .queue()
        .get(id)?
        .ok_or_else(|| eyre!("No queue item with id {}", id))?;
      if item.status != SyncStatus::Failed {
        return Err(eyre!("Queue item #{} is {}, not failed", id, item.status));
      }
      worker.queue().retry(id)?;
      println!("#{} is pending again", id);
    }
    Command::Retry { id: None } => {
      let count = worker.queue().retry_failed()?;
      println!("{} failed item(s) are pending again", count);
    }
    Command::Sync { tag } => {
      if let Some(report) = worker.sync(&tag).await? {
        println!(
          "completed {}, failed {}, skipped {}",
          report.completed.len(),
          report.failed.len(),
          report.skipped
        );
      }
    }
    Command::Periodic { tag } => {
      if let Some(report) = worker.periodic_sync(&tag).await {
        for (url, outcome) in report.checks.iter().chain(&report.refreshes) {
          if matches!(outcome, ResourceOutcome::Rejected(_) | ResourceOutcome::Failed(_)) {
            println!("{}: {}", url, outcome);
          }
        }
        println!(
          "updates {}, refreshed {}, notified {}, synced {}",
          report.updates_found(),
          report.refreshes.len(),
          report.notified,
          report.drain.as_ref().map_or(0, |drain| drain.completed.len())
        );
      }
    }
    Command::Push { payload } => {
      worker.push(payload.as_deref().map(str::as_bytes))?;
    }
    Command::Click { payload, action } => {
      let notification = worker.push(payload.as_deref().map(str::as_bytes))?;
      let click = NotificationClick {
        notification,
        action,
      };
      match worker.notification_click(&click)? {
        ClickOutcome::Dismissed => println!("dismissed"),
        ClickOutcome::Focused(id) => println!("focused window {}", id),
        ClickOutcome::Opened(url) => println!("opened {}", url),
      }
    }
    Command::Close { payload } => {
      let notification = worker.push(payload.as_deref().map(str::as_bytes))?;
      worker.notification_close(&notification);
    }
    Command::Run => run(worker).await?,
  }
  Ok(())
}

async fn install<N: Network>(worker: &OfflineWorker<N>) -> Result<()> {
  worker.install().await?;
  worker.activate().await
}

/// Push registration never fails the command that triggered it.
async fn register_push<N: Network>(worker: &OfflineWorker<N>) {
  let result = match worker.config().origin() {
    Ok(origin) => worker.register_push(&LocalPushService::new(origin)).await,
    Err(e) => Err(e),
  };
  if let Err(e) = result {
    warn!("Push registration failed: {}", e);
  }
}

async fn run<N: Network>(worker: &OfflineWorker<N>) -> Result<()> {
  if worker.state() != WorkerState::Activated {
    install(worker).await?;
  }

  register_push(worker).await;

  let config = worker.config();
  let period = worker
    .periodic_registration()
    .unwrap_or_else(|| config.periodic_interval());
  let (tx, rx) = mpsc::unbounded_channel();
  let monitor = ConnectivityMonitor::new(
    Arc::clone(worker.network()),
    config.origin()?,
    config.probe_interval(),
  );

  tokio::select! {
    _ = worker.reconciler().run(rx, period) => {}
    _ = monitor.watch(tx) => {}
    _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
  }
  Ok(())
}

fn parse_json(data: &str) -> Result<serde_json::Value> {
  serde_json::from_str(data).map_err(|e| eyre!("Invalid JSON payload: {}", e))
}
