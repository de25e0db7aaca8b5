//! Connectivity probing. Raises a reconnect trigger when the origin becomes
//! reachable again after being unreachable.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;

use crate::http::{Method, Network, Request};
use crate::reconcile::Trigger;

pub struct ConnectivityMonitor<N: Network> {
  network: Arc<N>,
  probe: Url,
  interval: Duration,
  online: Option<bool>,
}

impl<N: Network> ConnectivityMonitor<N> {
  pub fn new(network: Arc<N>, probe: Url, interval: Duration) -> Self {
    Self {
      network,
      probe,
      interval,
      online: None,
    }
  }

  /// Record a probe result. Only an offline to online transition yields a
  /// trigger; the first observation never does.
  pub fn observe(&mut self, online: bool) -> Option<Trigger> {
    let previous = self.online.replace(online);
    match (previous, online) {
      (Some(false), true) => {
        info!(origin = %self.probe, "Connectivity restored");
        Some(Trigger::Reconnected)
      }
      (Some(true), false) => {
        warn!(origin = %self.probe, "Connectivity lost");
        None
      }
      (None, state) => {
        debug!(online = state, "Initial connectivity state");
        None
      }
      _ => None,
    }
  }

  /// Any response counts as reachable, whatever its status.
  pub async fn probe(&self) -> bool {
    let request = Request::new(Method::HEAD, self.probe.clone()).bypass_cache();
    match self.network.fetch(&request).await {
      Ok(_) => true,
      Err(e) => {
        debug!("Connectivity probe failed: {}", e);
        false
      }
    }
  }

  /// Probe on an interval until the receiving side goes away.
  pub async fn watch(mut self, triggers: mpsc::UnboundedSender<Trigger>) {
    let mut timer = tokio::time::interval(self.interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
      tokio::select! {
        _ = timer.tick() => {
          let online = self.probe().await;
          if let Some(trigger) = self.observe(online) {
            if triggers.send(trigger).is_err() {
              break;
            }
          }
        }
        _ = triggers.closed() => break,
      }
    }
    debug!("Connectivity monitor stopped");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Response;
  use crate::testing::StubNetwork;

  const ORIGIN: &str = "http://localhost:8080/";

  fn monitor(network: Arc<StubNetwork>) -> ConnectivityMonitor<StubNetwork> {
    ConnectivityMonitor::new(
      network,
      Url::parse(ORIGIN).unwrap(),
      Duration::from_millis(10),
    )
  }

  #[test]
  fn test_only_offline_to_online_triggers() {
    let mut m = monitor(Arc::new(StubNetwork::new()));

    assert_eq!(m.observe(true), None);
    assert_eq!(m.observe(true), None);
    assert_eq!(m.observe(false), None);
    assert_eq!(m.observe(false), None);
    assert_eq!(m.observe(true), Some(Trigger::Reconnected));
    assert_eq!(m.observe(true), None);
  }

  #[test]
  fn test_starting_offline_then_online_triggers() {
    let mut m = monitor(Arc::new(StubNetwork::new()));

    assert_eq!(m.observe(false), None);
    assert_eq!(m.observe(true), Some(Trigger::Reconnected));
  }

  #[tokio::test]
  async fn test_error_status_still_counts_as_online() {
    let network = Arc::new(StubNetwork::new());
    network.respond(ORIGIN, Response::new(500, ""));
    let m = monitor(Arc::clone(&network));

    assert!(m.probe().await);
    assert_eq!(network.requests()[0].method, Method::HEAD);
  }

  #[tokio::test]
  async fn test_watch_sends_reconnect_after_outage() {
    let network = Arc::new(StubNetwork::new());
    network.script(ORIGIN, vec![None, None, Some(Response::ok(""))]);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(monitor(Arc::clone(&network)).watch(tx));
    let trigger = tokio::time::timeout(Duration::from_secs(5), rx.recv())
      .await
      .unwrap();

    assert_eq!(trigger, Some(Trigger::Reconnected));
    drop(rx);
    tokio::time::timeout(Duration::from_secs(5), handle)
      .await
      .unwrap()
      .unwrap();
  }
}
