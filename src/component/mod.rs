//! Component plug-in framework.
//!
//! # Responsibilities
//! - Define the `Component` contract every configurable unit implements
//! - Map namespace strings to factories and ids to live instances
//! - Drive the two-phase construct/load then start lifecycle
//!
//! # Design Decisions
//! - The registry is an explicit value owned by bootstrap, not a process
//!   singleton, so tests can build isolated registries per case
//! - Cross-references resolve during `load()`, after the whole batch has
//!   been constructed, so forward declarations by id work
//! - Registry state is mutated only during the load phase and read-only
//!   while serving; no locking is needed at steady state

pub mod loader;
pub mod registry;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::balancer::Balancer;
use crate::cluster::rmi::RmiClient;
use crate::error::{Error, Result};
use crate::limiter::RateLimit;
use crate::logger::Logger;
use crate::routes::Route;
use crate::store::Store;
use crate::stream::LogStream;

pub use registry::{Block, Factory, Registry};

/// The role this process plays in a deployment.
///
/// A worker is a supervised child with an RMI channel back to the primary.
/// Everything else (a supervising primary, or a bare standalone run) is
/// `Main`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Main,
    Worker(String),
}

/// Passed to `Component::load()` so components can resolve their
/// cross-references.
pub struct LoadContext<'a> {
    pub registry: &'a Registry,
    pub rmi: Option<Arc<RmiClient>>,
    pub role: &'a Role,
}

/// Passed to `Component::start()` once every component in the batch has
/// loaded.
pub struct StartContext {
    pub registry: Arc<Registry>,
    pub rmi: Option<Arc<RmiClient>>,
    pub role: Role,
    pub config_path: PathBuf,
}

/// A configuration-constructed, registry-tracked unit.
///
/// Lifecycle: constructed by its factory, `load()` validates config and
/// wires references (may fail, aborting startup), `start()` begins any
/// background activity. Components live for the process lifetime; there is
/// no teardown.
#[async_trait]
pub trait Component: Send + Sync + 'static {
    /// The namespace this instance was constructed under.
    fn namespace(&self) -> &'static str;

    /// The configuration-supplied identifier, if any.
    fn id(&self) -> Option<&str>;

    /// Validate configuration and resolve references by id.
    fn load(&self, ctx: &LoadContext<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Begin background activity (listeners, supervisors).
    async fn start(&self, ctx: &StartContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Invoke a named method with JSON arguments on behalf of a remote
    /// caller. Components reachable over RMI override this.
    async fn invoke(&self, method: &str, args: &[Value]) -> Result<Value> {
        let _ = args;
        Err(Error::UnknownMethod {
            component: self.id().unwrap_or(self.namespace()).to_string(),
            method: method.to_string(),
        })
    }

    // Typed views used when resolving id references. Each component kind
    // overrides the accessor matching what it is; the rest stay `None`.

    fn as_route(self: Arc<Self>) -> Option<Arc<dyn Route>> {
        None
    }

    fn as_balancer(self: Arc<Self>) -> Option<Arc<dyn Balancer>> {
        None
    }

    fn as_store(self: Arc<Self>) -> Option<Arc<dyn Store>> {
        None
    }

    fn as_stream(self: Arc<Self>) -> Option<Arc<dyn LogStream>> {
        None
    }

    fn as_logger(self: Arc<Self>) -> Option<Arc<Logger>> {
        None
    }

    fn as_rate_limit(self: Arc<Self>) -> Option<Arc<RateLimit>> {
        None
    }
}
