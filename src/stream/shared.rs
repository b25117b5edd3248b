//! Cluster-shared stream.
//!
//! Worker-side proxy for a stream owned by the primary. Writes are
//! forwarded fire-and-forget; the primary's own stream does the actual
//! file I/O.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::cluster::rmi::RmiClient;
use crate::component::{Block, Component, LoadContext};
use crate::error::{Error, Result};
use crate::stream::LogStream;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SharedStreamConfig {
    #[serde(default)]
    id: Option<String>,
    stream_id: String,
}

pub struct SharedStream {
    config: SharedStreamConfig,
    rmi: OnceLock<Arc<RmiClient>>,
}

impl SharedStream {
    pub fn factory(block: &Block) -> Result<Arc<dyn Component>> {
        let config: SharedStreamConfig =
            serde_json::from_value(Value::Object(block.clone())).map_err(|e| {
                Error::Config(format!("stream.shared requires a streamId: {e}"))
            })?;
        Ok(Arc::new(Self {
            config,
            rmi: OnceLock::new(),
        }))
    }
}

#[async_trait]
impl Component for SharedStream {
    fn namespace(&self) -> &'static str {
        "stream.shared"
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
                "stream.shared can only be used inside a cluster worker".into(),
            )),
        }
    }

    fn as_stream(self: Arc<Self>) -> Option<Arc<dyn LogStream>> {
        Some(self)
    }
}

#[async_trait]
impl LogStream for SharedStream {
    async fn write(&self, line: &str) {
        let Some(rmi) = self.rmi.get() else {
            tracing::warn!("stream.shared written before load");
            return;
        };
        if let Err(e) = rmi
            .notify(
                &self.config.stream_id,
                "write",
                vec![Value::String(line.to_string())],
            )
            .await
        {
            tracing::warn!(stream_id = %self.config.stream_id, error = %e, "shared stream write failed");
        }
    }
}
