//! Cache generation management on top of [`CacheStore`].

use color_eyre::{eyre::eyre, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::storage::CacheStore;
use crate::http::{resource_key, Network, Request, Response};

/// Owns the named cache generations and knows which one is current.
pub struct CacheManager {
  store: Arc<CacheStore>,
  current: String,
  /// Background writes still in flight
  pending: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheManager {
  pub fn new(store: Arc<CacheStore>, current: impl Into<String>) -> Self {
    Self {
      store,
      current: current.into(),
      pending: Mutex::new(Vec::new()),
    }
  }

  /// Name of the generation this manager reads from and writes to.
  pub fn current(&self) -> &str {
    &self.current
  }

  #[cfg(test)]
  pub fn store(&self) -> &CacheStore {
    &self.store
  }

  pub fn open(&self, generation: &str) -> Result<()> {
    self.store.create_generation(generation)?;
    debug!(generation, "Opened cache generation");
    Ok(())
  }

  /// Fetch every resource and store them all in `generation`.
  ///
  /// Any unreachable resource or non-success status fails the whole call
  /// before anything is written, so a generation is never partially
  /// populated. Returns the number of stored entries.
  pub async fn populate_all<N: Network>(
    &self,
    generation: &str,
    resources: &[Url],
    network: &N,
    concurrency: usize,
  ) -> Result<usize> {
    let entries: Vec<(String, Response)> = stream::iter(resources.iter().cloned())
      .map(|url| async move {
        let response = network
          .fetch(&Request::get(url.clone()))
          .await
          .map_err(|e| eyre!("Failed to pre-cache {}: {}", url, e))?;
        if !response.is_success() {
          return Err(eyre!(
            "Failed to pre-cache {}: status {}",
            url,
            response.status
          ));
        }
        Ok::<_, color_eyre::Report>((resource_key(&url), response))
      })
      .buffered(concurrency.max(1))
      .try_collect()
      .await?;

    self.store.put_all(generation, &entries)?;
    info!(generation, count = entries.len(), "Populated cache generation");
    Ok(entries.len())
  }

  /// Delete every generation other than `current`.
  pub fn evict_stale(&self, current: &str) -> Result<Vec<String>> {
    let deleted = self.store.delete_generations_except(current)?;
    for name in &deleted {
      info!(generation = %name, "Deleted stale cache generation");
    }
    Ok(deleted)
  }

  pub fn activate(&self, generation: &str) -> Result<()> {
    self.store.set_active(generation)
  }

  pub fn put(&self, generation: &str, key: &str, response: &Response) -> Result<()> {
    self.store.put(generation, key, response)
  }

  /// Look up `key` in the current generation.
  pub fn match_key(&self, key: &str) -> Result<Option<Response>> {
    self.store.get(&self.current, key)
  }

  /// Write a copy into the current generation without blocking the caller.
  pub fn put_in_background(&self, key: String, response: Response) {
    let store = Arc::clone(&self.store);
    let generation = self.current.clone();

    let handle = tokio::task::spawn_blocking(move || {
      if let Err(e) = store.put(&generation, &key, &response) {
        warn!(key = %key, "Background cache write failed: {}", e);
      }
    });

    match self.pending.lock() {
      Ok(mut pending) => {
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
      }
      Err(e) => warn!("Lock poisoned while tracking cache write: {}", e),
    }
  }

  /// Wait for every background write issued so far.
  pub async fn settle(&self) {
    let handles = match self.pending.lock() {
      Ok(mut pending) => std::mem::take(&mut *pending),
      Err(e) => {
        warn!("Lock poisoned while settling cache writes: {}", e);
        return;
      }
    };

    for handle in handles {
      if let Err(e) = handle.await {
        warn!("Background cache write panicked: {}", e);
      }
    }
  }
}
