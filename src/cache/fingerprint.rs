use sha2::{Digest, Sha256};

use crate::http::Response;

/// Opaque content-version marker used to detect upstream changes without
/// comparing full bodies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fingerprint {
  /// Entity tag reported by the server
  EntityTag(String),
  /// SHA256 of the body, for servers that send no entity tag
  Digest(String),
}

impl Fingerprint {
  pub fn of(response: &Response) -> Self {
    match response.header("etag") {
      Some(tag) => Self::EntityTag(tag.to_string()),
      None => {
        let mut hasher = Sha256::new();
        hasher.update(&response.body);
        Self::Digest(hex::encode(hasher.finalize()))
      }
    }
  }
}

impl std::fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::EntityTag(tag) => write!(f, "etag {}", tag),
      Self::Digest(digest) => write!(f, "sha256 {}", &digest[..12.min(digest.len())]),
    }
  }
}
