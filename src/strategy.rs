//! Strategy executor that sits between intercepted requests and the network.
//!
//! Each GET request is classified and served by one of three strategies,
//! all sharing the same offline fallback.

use color_eyre::Result;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::cache::CacheManager;
use crate::classify::{Classifier, Strategy};
use crate::config::Config;
use crate::http::{resource_key, Destination, Method, Network, Request, Response};

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
  /// Fresh response from the network
  Network,
  /// Entry from the current cache generation
  Cache,
  /// Cached offline document standing in for an unavailable resource
  OfflineDocument,
  /// Cached placeholder standing in for an unavailable image
  Placeholder,
  /// Nothing cached to fall back on
  Unavailable,
}

/// A response together with its source.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: Source,
}

impl Served {
  fn new(response: Response, source: Source) -> Self {
    Self { response, source }
  }
}

/// Outcome of intercepting a request.
#[derive(Debug, Clone)]
pub enum Interception {
  /// The request is not ours to serve; let it reach the network untouched
  Passthrough,
  Respond(Served),
}

pub struct Executor<N: Network> {
  cache: Arc<CacheManager>,
  network: Arc<N>,
  classifier: Classifier,
  offline_document: Url,
  placeholder_image: Url,
}

impl<N: Network> Executor<N> {
  pub fn new(config: &Config, cache: Arc<CacheManager>, network: Arc<N>) -> Result<Self> {
    Ok(Self {
      cache,
      network,
      classifier: Classifier::from_config(config)?,
      offline_document: config.resolve(&config.cache.offline_document)?,
      placeholder_image: config.resolve(&config.cache.placeholder_image)?,
    })
  }

  /// Route an intercepted request. Only GET requests are served; mutating
  /// requests pass through.
  pub async fn handle(&self, request: &Request) -> Result<Interception> {
    if request.method != Method::GET {
      return Ok(Interception::Passthrough);
    }
    Ok(Interception::Respond(self.serve(request).await?))
  }

  /// Serve a GET request with the strategy its URL is classified under.
  ///
  /// Network failures never surface as errors; only storage errors do.
  pub async fn serve(&self, request: &Request) -> Result<Served> {
    let strategy = self.classifier.classify(&request.url);
    debug!(url = %request.url, ?strategy, "Serving request");

    match strategy {
      Strategy::Static => self.cache_first(request).await,
      Strategy::Dynamic => self.network_first(request).await,
      Strategy::Essential => self.cache_only(request),
    }
  }

  async fn cache_first(&self, request: &Request) -> Result<Served> {
    if let Some(cached) = self.cache.match_key(&request.key())? {
      return Ok(Served::new(cached, Source::Cache));
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        self.store_copy(request, &response);
        Ok(Served::new(response, Source::Network))
      }
      Err(e) => {
        debug!(url = %request.url, "Network unavailable: {}", e);
        self.offline_fallback(request)
      }
    }
  }

  async fn network_first(&self, request: &Request) -> Result<Served> {
    match self.network.fetch(request).await {
      Ok(response) => {
        self.store_copy(request, &response);
        Ok(Served::new(response, Source::Network))
      }
      Err(e) => {
        debug!(url = %request.url, "Network unavailable: {}", e);
        match self.cache.match_key(&request.key())? {
          Some(cached) => Ok(Served::new(cached, Source::Cache)),
          None => self.offline_fallback(request),
        }
      }
    }
  }

  fn cache_only(&self, request: &Request) -> Result<Served> {
    match self.cache.match_key(&request.key())? {
      Some(cached) => Ok(Served::new(cached, Source::Cache)),
      None => self.offline_fallback(request),
    }
  }

  /// Images get the placeholder; everything else gets the offline document.
  fn offline_fallback(&self, request: &Request) -> Result<Served> {
    let (url, source) = match request.destination {
      Destination::Image => (&self.placeholder_image, Source::Placeholder),
      _ => (&self.offline_document, Source::OfflineDocument),
    };

    match self.cache.match_key(&resource_key(url))? {
      Some(fallback) => Ok(Served::new(fallback, source)),
      None => Ok(Served::new(
        Response::service_unavailable(),
        Source::Unavailable,
      )),
    }
  }

  /// Only successful responses are worth keeping.
  fn store_copy(&self, request: &Request, response: &Response) {
    if response.is_success() {
      self
        .cache
        .put_in_background(request.key(), response.clone());
    }
  }
}
