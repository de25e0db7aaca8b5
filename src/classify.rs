//! Maps a resource URL to the cache strategy that serves it.

use color_eyre::Result;
use url::Url;

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Cache first, network on miss
  Static,
  /// Network first, cache when offline
  Dynamic,
  /// Cache only; pre-populated at install time
  Essential,
}

/// Pure, deterministic classifier.
///
/// Rules are checked in order and the first match wins:
/// 1. path ends in a static extension → `Static`
/// 2. same document as the app root or the offline page → `Essential`
/// 3. anything else → `Dynamic`
#[derive(Debug, Clone)]
pub struct Classifier {
  extensions: Vec<String>,
  essential: Vec<Url>,
}

impl Classifier {
  pub fn new(extensions: Vec<String>, essential: Vec<Url>) -> Self {
    Self {
      extensions: extensions.into_iter().map(|e| e.to_lowercase()).collect(),
      essential,
    }
  }

  pub fn from_config(config: &Config) -> Result<Self> {
    let essential = vec![
      config.resolve(&config.cache.app_root)?,
      config.resolve(&config.cache.offline_document)?,
    ];
    Ok(Self::new(config.cache.static_extensions.clone(), essential))
  }

  pub fn classify(&self, url: &Url) -> Strategy {
    if self.has_static_extension(url.path()) {
      return Strategy::Static;
    }
    if self.essential.iter().any(|e| same_document(e, url)) {
      return Strategy::Essential;
    }
    Strategy::Dynamic
  }

  fn has_static_extension(&self, path: &str) -> bool {
    let file = path.rsplit('/').next().unwrap_or(path);
    match file.rsplit_once('.') {
      Some((_, ext)) => self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)),
      None => false,
    }
  }
}

/// Same origin and path; query and fragment are ignored.
fn same_document(a: &Url, b: &Url) -> bool {
  a.origin() == b.origin() && a.path() == b.path()
}
