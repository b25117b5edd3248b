//! Round-robin balancing strategy, the default.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Deserialize;

use crate::balancer::{parse_upstreams, Balancer, Upstream, UpstreamConfig};
use crate::component::{Block, Component};
use crate::error::Result;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoundRobinConfig {
    #[serde(default)]
    id: Option<String>,
    upstream: Vec<UpstreamConfig>,
}

/// Cyclic selector over a fixed upstream list.
///
/// The cursor advances once per candidate probed, so with every upstream
/// healthy the selection is exactly cyclic. At most `len` candidates are
/// probed per call; if all are down (and more than one is configured) the
/// call reports no upstream available rather than returning a down one.
pub struct RoundRobin {
    id: Option<String>,
    upstreams: Vec<Arc<Upstream>>,
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn factory(block: &Block) -> Result<Arc<dyn Component>> {
        let config: RoundRobinConfig =
            serde_json::from_value(serde_json::Value::Object(block.clone()))
                .map_err(|e| crate::error::Error::Config(e.to_string()))?;
        Ok(Arc::new(Self::from_entries(config.id, &config.upstream)?))
    }

    pub fn from_entries(id: Option<String>, entries: &[UpstreamConfig]) -> Result<Self> {
        Ok(Self {
            id,
            upstreams: parse_upstreams(entries)?,
            cursor: AtomicUsize::new(0),
        })
    }
}

impl Balancer for RoundRobin {
    fn next(&self) -> Option<Arc<Upstream>> {
        let len = self.upstreams.len();
        // Single-upstream configurations have no failover.
        if len == 1 {
            return Some(self.upstreams[0].clone());
        }
        for _ in 0..len {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
            let upstream = &self.upstreams[index];
            if !upstream.is_down() {
                return Some(upstream.clone());
            }
        }
        None
    }

    fn upstreams(&self) -> &[Arc<Upstream>] {
        &self.upstreams
    }
}

#[async_trait::async_trait]
impl Component for RoundRobin {
    fn namespace(&self) -> &'static str {
        "balancer.round-robin"
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn as_balancer(self: Arc<Self>) -> Option<Arc<dyn Balancer>> {
        Some(self)
    }
}
