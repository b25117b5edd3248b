//! Pluggable key/value stores.
//!
//! A store is where stateful components (the rate limiter foremost) keep
//! their entries. The access contract is uniformly asynchronous so a
//! caller cannot tell a process-local map from a cross-process round trip
//! to the primary.

pub mod memory;
pub mod shared;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

pub use memory::MemoryStore;
pub use shared::SharedStore;

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Write a value, optionally expiring it after `ttl`. Implementations
    /// backed by RMI send this fire-and-forget.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;
}
