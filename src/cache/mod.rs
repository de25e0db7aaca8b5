//! Generational response cache.
//!
//! This module provides the persistent side of request interception:
//! - Named cache generations, exactly one of which is current
//! - All-or-nothing population at install time
//! - Eviction of every non-current generation at activation
//! - Background copies of fresh network responses
//! - Content fingerprints for upstream change detection

mod fingerprint;
mod manager;
mod storage;

pub use fingerprint::Fingerprint;
pub use manager::CacheManager;
pub use storage::CacheStore;
