//! Cluster-shared store.
//!
//! A worker-side proxy for a store owned by the primary process. `get`
//! becomes an awaited RMI round trip; `set` is sent fire-and-forget, the
//! primary's single-threaded dispatch serializing all workers' mutations.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::cluster::rmi::RmiClient;
use crate::component::{Block, Component, LoadContext};
use crate::error::{Error, Result};
use crate::store::Store;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SharedStoreConfig {
    #[serde(default)]
    id: Option<String>,
    store_id: String,
}

pub struct SharedStore {
    config: SharedStoreConfig,
    rmi: OnceLock<Arc<RmiClient>>,
}

impl SharedStore {
    pub fn factory(block: &Block) -> Result<Arc<dyn Component>> {
        let config: SharedStoreConfig =
            serde_json::from_value(Value::Object(block.clone())).map_err(|e| {
                Error::Config(format!("store.shared requires a storeId: {e}"))
            })?;
        Ok(Arc::new(Self {
            config,
            rmi: OnceLock::new(),
        }))
    }

    fn rmi(&self) -> Result<&Arc<RmiClient>> {
        self.rmi
            .get()
            .ok_or_else(|| Error::Rmi("shared store used before load".into()))
    }
}

#[async_trait]
impl Component for SharedStore {
    fn namespace(&self) -> &'static str {
        "store.shared"
    }

    fn id(&self) -> Option<&str> {
        self.config.id.as_deref()
    }

    fn load(&self, ctx: &LoadContext<'_>) -> Result<()> {
        match &ctx.rmi {
            Some(rmi) => {
                let _ = self.rmi.set(rmi.clone());
                Ok(())
            }
            None => Err(Error::Config(
                "store.shared can only be used inside a cluster worker".into(),
            )),
        }
    }

    fn as_store(self: Arc<Self>) -> Option<Arc<dyn Store>> {
        Some(self)
    }
}

#[async_trait]
impl Store for SharedStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let value = self
            .rmi()?
            .call(&self.config.store_id, "get", vec![Value::String(key.into())])
            .await?;
        Ok(match value {
            Value::Null => None,
            other => Some(other),
        })
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let mut args = vec![Value::String(key.into()), value];
        if let Some(ttl) = ttl {
            args.push(Value::from(ttl.as_millis() as u64));
        }
        self.rmi()?
            .notify(&self.config.store_id, "set", args)
            .await
    }
}
