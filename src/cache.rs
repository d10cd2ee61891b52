//! Per-user job-list cache.
//!
//! Entries are JSON documents keyed by `provider:user`. The cache is advisory: every write
//! to the store is followed by a `delete` of the affected key, and readers fall back to the
//! store on a miss.

use crate::error::CacheError;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

#[async_trait]
pub trait ListCache: Send + Sync {
  async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;
  async fn set(&self, key: &str, value: Value) -> Result<(), CacheError>;
  async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// In-process [`ListCache`]. Failpoints are keyed `get`, `set` and `delete`.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
  entries: Arc<RwLock<HashMap<String, Value>>>,
  failpoints: Arc<Mutex<HashSet<&'static str>>>,
}

impl MemoryCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn fail_on(&self, op: &'static str) {
    self.failpoints.lock().insert(op);
  }

  pub fn clear_failure(&self, op: &'static str) {
    self.failpoints.lock().remove(op);
  }

  pub fn contains(&self, key: &str) -> bool {
    self.entries.read().contains_key(key)
  }

  fn check(&self, op: &'static str) -> Result<(), CacheError> {
    if self.failpoints.lock().contains(op) {
      return Err(CacheError::Backend(format!("injected failure at `{op}`")));
    }
    Ok(())
  }
}

#[async_trait]
impl ListCache for MemoryCache {
  async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
    self.check("get")?;
    Ok(self.entries.read().get(key).cloned())
  }

  async fn set(&self, key: &str, value: Value) -> Result<(), CacheError> {
    self.check("set")?;
    self.entries.write().insert(key.to_string(), value);
    Ok(())
  }

  async fn delete(&self, key: &str) -> Result<(), CacheError> {
    self.check("delete")?;
    self.entries.write().remove(key);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn set_get_delete() {
    let cache = MemoryCache::new();
    cache.set("github:alice", json!([1, 2])).await.unwrap();
    assert_eq!(cache.get("github:alice").await.unwrap(), Some(json!([1, 2])));
    cache.delete("github:alice").await.unwrap();
    assert!(cache.get("github:alice").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn injected_failure_is_reported() {
    let cache = MemoryCache::new();
    cache.fail_on("delete");
    assert!(matches!(
      cache.delete("k").await,
      Err(CacheError::Backend(_))
    ));
  }
}
