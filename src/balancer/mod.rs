//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! proxy route matched
//!     -> balancer.next() (skip upstreams marked down)
//!     -> Upstream address template
//!     -> stats updated around the proxied exchange
//! ```
//!
//! # Design Decisions
//! - Upstreams are owned exclusively by their balancer
//! - Selection never returns a down upstream while any non-down one
//!   exists; all down (and more than one configured) yields `None` and the
//!   caller answers service-unavailable
//! - A single-entry list is always returned, even when marked down:
//!   single-upstream configurations have no failover

pub mod round_robin;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

pub use round_robin::RoundRobin;

/// One balancer-managed backend target.
#[derive(Debug)]
pub struct Upstream {
    /// Address template; may carry `${...}` request references.
    pub address: String,
    down: AtomicBool,
    pub stats: UpstreamStats,
}

/// Selection and latency statistics, mutated per request.
#[derive(Debug, Default)]
pub struct UpstreamStats {
    active_connections: AtomicUsize,
    total_connections: AtomicU64,
    average_latency_micros: AtomicU64,
}

impl Upstream {
    pub fn new(address: impl Into<String>, down: bool) -> Self {
        Self {
            address: address.into(),
            down: AtomicBool::new(down),
            stats: UpstreamStats::default(),
        }
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::Relaxed)
    }

    /// Health-check style flipping of the down flag.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::Relaxed);
    }

    /// Record the start of a proxied exchange. The guard closes the books
    /// when dropped.
    pub fn begin(self: &Arc<Self>) -> UpstreamGuard {
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        UpstreamGuard {
            upstream: self.clone(),
            started: std::time::Instant::now(),
        }
    }
}

impl UpstreamStats {
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn average_latency(&self) -> Duration {
        Duration::from_micros(self.average_latency_micros.load(Ordering::Relaxed))
    }

    fn record_latency(&self, sample: Duration) {
        // Exponential moving average, enough for balancing heuristics.
        let sample = sample.as_micros() as u64;
        let current = self.average_latency_micros.load(Ordering::Relaxed);
        let next = if current == 0 {
            sample
        } else {
            current - current / 8 + sample / 8
        };
        self.average_latency_micros.store(next, Ordering::Relaxed);
    }
}

/// RAII guard pairing an upstream's active-connection count with the
/// lifetime of one proxied exchange.
#[derive(Debug)]
pub struct UpstreamGuard {
    upstream: Arc<Upstream>,
    started: std::time::Instant,
}

impl Drop for UpstreamGuard {
    fn drop(&mut self) {
        self.upstream
            .stats
            .active_connections
            .fetch_sub(1, Ordering::Relaxed);
        self.upstream.stats.record_latency(self.started.elapsed());
    }
}

/// Stateful upstream-selection strategy.
pub trait Balancer: Send + Sync {
    /// The next upstream to proxy to, or `None` when nothing is available.
    fn next(&self) -> Option<Arc<Upstream>>;

    fn upstreams(&self) -> &[Arc<Upstream>];
}

/// An upstream entry as it appears in configuration: a bare address string
/// or an object with a down flag.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum UpstreamConfig {
    Address(String),
    Detailed {
        server: String,
        #[serde(default)]
        down: bool,
    },
}

/// Validate and build the upstream list out of configuration entries.
pub fn parse_upstreams(entries: &[UpstreamConfig]) -> Result<Vec<Arc<Upstream>>> {
    if entries.is_empty() {
        return Err(Error::Config("upstream list must not be empty".into()));
    }
    Ok(entries
        .iter()
        .map(|entry| match entry {
            UpstreamConfig::Address(server) => Arc::new(Upstream::new(server.clone(), false)),
            UpstreamConfig::Detailed { server, down } => {
                Arc::new(Upstream::new(server.clone(), *down))
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_tracks_active_and_total() {
        let upstream = Arc::new(Upstream::new("http://127.0.0.1:9000", false));
        {
            let _a = upstream.begin();
            let _b = upstream.begin();
            assert_eq!(upstream.stats.active_connections(), 2);
        }
        assert_eq!(upstream.stats.active_connections(), 0);
        assert_eq!(upstream.stats.total_connections(), 2);
    }

    #[test]
    fn empty_upstream_list_is_rejected() {
        assert!(parse_upstreams(&[]).is_err());
    }
}
