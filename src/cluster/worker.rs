//! Worker-side runtime.
//!
//! A worker loads its group's section, starts serving, then spends its
//! life reading envelopes off stdin: responses resolve the worker's own
//! pending calls, requests invoke locally-owned components on the
//! primary's behalf. When stdin closes the primary is gone and the worker
//! exits with it.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::cluster::rmi::{self, Envelope, RmiClient};
use crate::component::{loader, Registry, Role, StartContext};
use crate::config::AppConfig;
use crate::error::Result;

pub async fn run(group: &str, config: &AppConfig, config_path: PathBuf) -> Result<()> {
    let rmi = Arc::new(RmiClient::stdio());
    let role = Role::Worker(group.to_string());

    let mut registry = Registry::builtin();
    let blocks = config.section(group)?;
    let created =
        loader::construct_and_load(&mut registry, blocks, Some(rmi.clone()), &role)?;
    let registry = Arc::new(registry);

    let ctx = StartContext {
        registry: registry.clone(),
        rmi: Some(rmi.clone()),
        role,
        config_path,
    };
    loader::start_components(&created, &ctx).await?;
    tracing::info!(group, pid = std::process::id(), "worker serving");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Envelope>(&line) {
            Ok(Envelope::Response(response)) => rmi.handle_response(response),
            Ok(Envelope::Request(request)) => {
                let registry = registry.clone();
                let rmi = rmi.clone();
                tokio::spawn(async move {
                    if let Some(response) = rmi::dispatch_request(&registry, request).await {
                        if let Err(e) = rmi.send(&Envelope::Response(response)).await {
                            tracing::error!(error = %e, "rmi reply failed");
                        }
                    }
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "undecodable rmi envelope dropped");
            }
        }
    }

    tracing::info!(group, "primary channel closed, worker exiting");
    Ok(())
}
