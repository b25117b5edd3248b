//! In-process key/value store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;

use crate::component::{Block, Component};
use crate::error::{Error, Result};
use crate::store::Store;

/// Expired entries are dropped when touched; a full sweep runs every this
/// many operations.
const SWEEP_INTERVAL: u64 = 1024;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemoryStoreConfig {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

/// A concurrent map with optional per-entry expiry and lazy sweeping.
/// In a clustered deployment this lives in the primary and is reached by
/// workers through `store.shared`.
pub struct MemoryStore {
    id: Option<String>,
    map: DashMap<String, Entry>,
    operations: AtomicU64,
}

impl MemoryStore {
    pub fn factory(block: &Block) -> Result<Arc<dyn Component>> {
        let config: MemoryStoreConfig =
            serde_json::from_value(Value::Object(block.clone()))
                .map_err(|e| Error::Config(e.to_string()))?;
        Ok(Arc::new(Self::new(config.id)))
    }

    pub fn new(id: Option<String>) -> Self {
        Self {
            id,
            map: DashMap::new(),
            operations: AtomicU64::new(0),
        }
    }

    fn tick(&self) {
        let count = self.operations.fetch_add(1, Ordering::Relaxed) + 1;
        if count % SWEEP_INTERVAL == 0 {
            self.map.retain(|_, entry| !entry.expired());
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.tick();
        if let Some(entry) = self.map.get(key) {
            if entry.expired() {
                drop(entry);
                self.map.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        self.tick();
        self.map.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl Component for MemoryStore {
    fn namespace(&self) -> &'static str {
        "store.memory"
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// RMI surface: `get(key)` and `set(key, value, ttlMs?)`.
    async fn invoke(&self, method: &str, args: &[Value]) -> Result<Value> {
        match method {
            "get" => {
                let key = string_arg(args, 0)?;
                Ok(self.get(&key).await?.unwrap_or(Value::Null))
            }
            "set" => {
                let key = string_arg(args, 0)?;
                let value = args.get(1).cloned().unwrap_or(Value::Null);
                let ttl = args
                    .get(2)
                    .and_then(Value::as_u64)
                    .map(Duration::from_millis);
                self.set(&key, value, ttl).await?;
                Ok(Value::Null)
            }
            other => Err(Error::UnknownMethod {
                component: self.id.clone().unwrap_or_else(|| "store.memory".into()),
                method: other.to_string(),
            }),
        }
    }

    fn as_store(self: Arc<Self>) -> Option<Arc<dyn Store>> {
        Some(self)
    }
}

fn string_arg(args: &[Value], index: usize) -> Result<String> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Rmi(format!("argument {index} must be a string")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = MemoryStore::new(None);
        store
            .set("k", serde_json::json!({"hits": 1}), None)
            .await
            .unwrap();
        assert_eq!(
            store.get("k").await.unwrap(),
            Some(serde_json::json!({"hits": 1}))
        );
    }

    #[tokio::test]
    async fn expired_entries_vanish() {
        let store = MemoryStore::new(None);
        store
            .set("k", Value::Bool(true), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn rmi_invoke_matches_direct_access() {
        let store = MemoryStore::new(Some("shared".into()));
        store
            .invoke("set", &[serde_json::json!("k"), serde_json::json!(42)])
            .await
            .unwrap();
        let got = store.invoke("get", &[serde_json::json!("k")]).await.unwrap();
        assert_eq!(got, serde_json::json!(42));
    }

    #[tokio::test]
    async fn unknown_method_is_an_error() {
        let store = MemoryStore::new(None);
        assert!(store.invoke("drop", &[]).await.is_err());
    }
}
