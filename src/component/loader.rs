//! Two-phase component lifecycle loader.
//!
//! All blocks in a batch are constructed and indexed first; only then does
//! `load()` run, in construction order, so a component can resolve another
//! declared after it. `start()` follows once every `load()` has succeeded.

use std::sync::Arc;

use crate::cluster::rmi::RmiClient;
use crate::component::{Block, Component, LoadContext, Registry, Role, StartContext};
use crate::error::{Error, Result};

/// Construct every block in order, index the instances, then `load()` each
/// in construction order. Returns the newly created components.
pub fn construct_and_load(
    registry: &mut Registry,
    blocks: &[Block],
    rmi: Option<Arc<RmiClient>>,
    role: &Role,
) -> Result<Vec<Arc<dyn Component>>> {
    let mut created = Vec::with_capacity(blocks.len());

    for block in blocks {
        let namespace = block
            .get("namespace")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                Error::Config(format!(
                    "configuration block missing a namespace: {}",
                    serde_json::Value::Object(block.clone())
                ))
            })?;
        let factory = registry.factory(namespace)?;
        let component = factory(block)?;
        registry.insert(component.clone())?;
        created.push(component);
    }

    let ctx = LoadContext {
        registry,
        rmi,
        role,
    };
    for component in &created {
        component.load(&ctx).map_err(|e| {
            tracing::error!(
                namespace = component.namespace(),
                id = component.id().unwrap_or("-"),
                error = %e,
                "component failed to load"
            );
            e
        })?;
    }

    Ok(created)
}

/// `start()` the given components in construction order.
pub async fn start_components(
    components: &[Arc<dyn Component>],
    ctx: &StartContext,
) -> Result<()> {
    for component in components {
        component.start(ctx).await?;
    }
    Ok(())
}
