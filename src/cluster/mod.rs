//! Cluster supervision and the primary side of RMI.
//!
//! # Responsibilities
//! - Fork the configured worker groups by re-executing this binary
//! - Re-fork a same-named worker after a fixed delay when one exits
//! - Route RMI envelopes: worker -> primary component, worker -> worker
//!   (through the primary), primary -> named worker
//!
//! # Design Decisions
//! - Worker stdio is the IPC channel: requests/responses are JSON lines on
//!   the child's stdin/stdout, diagnostics go to the inherited stderr
//! - The restart policy is an unconditional fixed delay, no backoff and no
//!   crash-loop breaker: a worker that dies on start is retried forever
//! - Only the primary can enumerate workers by name; workers address each
//!   other through it

pub mod rmi;
pub mod worker;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::component::{Block, Component, LoadContext, Registry, Role, StartContext};
use crate::error::{Error, Result};

use self::rmi::{CallbackTable, Envelope, RmiRequest, RmiResponse};

/// Environment variable carrying the worker's group name; its presence is
/// what makes a process a worker.
pub const WORKER_GROUP_ENV: &str = "GATEHOUSE_WORKER_GROUP";

fn default_worker_delay_restart() -> u64 {
    500
}
fn default_group() -> String {
    "app".to_string()
}
fn default_enable_uncaught_exception() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerGroup {
    pub name: String,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterConfig {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    enable: bool,
    #[serde(default)]
    number_of_workers: Option<usize>,
    #[serde(default = "default_worker_delay_restart")]
    worker_delay_restart: u64,
    #[serde(default)]
    workers: Option<Vec<WorkerGroup>>,
    #[serde(default = "default_group")]
    default_group: String,
    #[serde(default = "default_enable_uncaught_exception")]
    enable_uncaught_exception: bool,
}

/// Cluster supervisor component. Lives in the primary's section; a
/// disabled cluster block turns the process into a plain standalone run.
pub struct Cluster {
    config: ClusterConfig,
    hub: Arc<RmiHub>,
}

impl Cluster {
    pub fn factory(block: &Block) -> Result<Arc<dyn Component>> {
        let config: ClusterConfig = serde_json::from_value(Value::Object(block.clone()))
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(Arc::new(Self {
            config,
            hub: Arc::new(RmiHub::new()),
        }))
    }

    /// The worker groups this cluster will run: the explicit list, or
    /// `numberOfWorkers` (default: CPU count) of the default group.
    fn effective_workers(&self) -> Vec<WorkerGroup> {
        match &self.config.workers {
            Some(groups) => groups.clone(),
            None => {
                let count = self.config.number_of_workers.unwrap_or_else(|| {
                    std::thread::available_parallelism()
                        .map(|n| n.get())
                        .unwrap_or(1)
                });
                vec![WorkerGroup {
                    name: self.config.default_group.clone(),
                    count,
                }]
            }
        }
    }

    /// Invoke a method on a component owned by a named worker group.
    pub async fn call_worker(
        &self,
        group: &str,
        component_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.hub.call_worker(group, component_id, method, args).await
    }

    pub fn hub(&self) -> &Arc<RmiHub> {
        &self.hub
    }
}

#[async_trait]
impl Component for Cluster {
    fn namespace(&self) -> &'static str {
        "cluster"
    }

    fn id(&self) -> Option<&str> {
        self.config.id.as_deref()
    }

    fn load(&self, _ctx: &LoadContext<'_>) -> Result<()> {
        if let Some(groups) = &self.config.workers {
            for group in groups {
                if group.name.is_empty() {
                    return Err(Error::Config("cluster worker group needs a name".into()));
                }
                if group.count == 0 {
                    return Err(Error::Config(format!(
                        "cluster worker group {:?} needs a count greater than zero",
                        group.name
                    )));
                }
            }
        }
        if self.config.enable_uncaught_exception {
            install_panic_reporter();
        }
        Ok(())
    }

    async fn start(&self, ctx: &StartContext) -> Result<()> {
        if !self.config.enable {
            tracing::debug!("clustering disabled, running in-process only");
            return Ok(());
        }
        if ctx.role != Role::Main {
            return Ok(());
        }

        self.hub.bind_registry(ctx.registry.clone());
        let exe = std::env::current_exe()?;
        let delay = Duration::from_millis(self.config.worker_delay_restart);

        for group in self.effective_workers() {
            for slot in 0..group.count {
                let spec = SlotSpec {
                    group: group.name.clone(),
                    slot,
                    exe: exe.clone(),
                    config_path: ctx.config_path.clone(),
                    restart_delay: delay,
                };
                let hub = self.hub.clone();
                tokio::spawn(async move {
                    supervise_slot(hub, spec).await;
                });
            }
        }
        Ok(())
    }
}

/// Log panics instead of dying; the restart policy only reacts to real
/// process exits.
fn install_panic_reporter() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            tracing::error!(panic = %info, "uncaught panic");
            previous(info);
        }));
    });
}

struct SlotSpec {
    group: String,
    slot: usize,
    exe: PathBuf,
    config_path: PathBuf,
    restart_delay: Duration,
}

/// One worker slot: spawn, shuttle envelopes until exit, wait the fixed
/// delay, spawn again. Unconditionally, forever.
async fn supervise_slot(hub: Arc<RmiHub>, spec: SlotSpec) {
    loop {
        match spawn_worker(&spec) {
            Ok((child, link)) => {
                tracing::info!(group = %spec.group, slot = spec.slot, pid = link.pid, "worker started");
                hub.attach(link.clone());
                let status = shuttle_worker(&hub, &link, child).await;
                hub.detach(&link);
                tracing::warn!(
                    group = %spec.group,
                    slot = spec.slot,
                    pid = link.pid,
                    status = %status,
                    "worker exited"
                );
            }
            Err(e) => {
                tracing::error!(group = %spec.group, slot = spec.slot, error = %e, "worker spawn failed");
            }
        }
        tokio::time::sleep(spec.restart_delay).await;
        tracing::info!(group = %spec.group, slot = spec.slot, "restarting worker");
    }
}

fn spawn_worker(spec: &SlotSpec) -> Result<(tokio::process::Child, Arc<WorkerLink>)> {
    let mut child = tokio::process::Command::new(&spec.exe)
        .arg("--config")
        .arg(&spec.config_path)
        .env(WORKER_GROUP_ENV, &spec.group)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Rmi("worker stdin unavailable".into()))?;
    let link = Arc::new(WorkerLink {
        group: spec.group.clone(),
        pid: child.id().unwrap_or_default(),
        stdin: Mutex::new(stdin),
    });
    Ok((child, link))
}

/// Read the worker's stdout until it closes, dispatching each envelope,
/// then reap the process.
async fn shuttle_worker(
    hub: &Arc<RmiHub>,
    link: &Arc<WorkerLink>,
    mut child: tokio::process::Child,
) -> String {
    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => hub.handle_line(link, &line).await,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(pid = link.pid, error = %e, "worker channel read failed");
                    break;
                }
            }
        }
    }
    match child.wait().await {
        Ok(status) => status.to_string(),
        Err(e) => format!("wait failed: {e}"),
    }
}

/// A live worker's write end.
pub struct WorkerLink {
    pub group: String,
    pub pid: u32,
    stdin: Mutex<tokio::process::ChildStdin>,
}

impl WorkerLink {
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        let line = rmi::encode(envelope)?;
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }
}

/// Primary-side RMI router: owns the by-name worker index, the primary's
/// callback table, and the primary's component registry.
pub struct RmiHub {
    registry: OnceLock<Arc<Registry>>,
    workers: DashMap<String, Vec<Arc<WorkerLink>>>,
    callbacks: CallbackTable,
}

impl RmiHub {
    pub fn new() -> Self {
        Self {
            registry: OnceLock::new(),
            workers: DashMap::new(),
            callbacks: CallbackTable::new(),
        }
    }

    pub fn bind_registry(&self, registry: Arc<Registry>) {
        let _ = self.registry.set(registry);
    }

    pub fn attach(&self, link: Arc<WorkerLink>) {
        self.workers.entry(link.group.clone()).or_default().push(link);
    }

    pub fn detach(&self, link: &Arc<WorkerLink>) {
        if let Some(mut group) = self.workers.get_mut(&link.group) {
            group.retain(|candidate| candidate.pid != link.pid);
        }
    }

    /// Live workers in a group.
    pub fn group_len(&self, group: &str) -> usize {
        self.workers.get(group).map(|g| g.len()).unwrap_or(0)
    }

    fn worker(&self, group: &str) -> Option<Arc<WorkerLink>> {
        self.workers.get(group).and_then(|g| g.first().cloned())
    }

    /// Handle one envelope arriving from a worker.
    pub async fn handle_line(self: &Arc<Self>, origin: &Arc<WorkerLink>, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let envelope = match serde_json::from_str::<Envelope>(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(pid = origin.pid, error = %e, "undecodable rmi envelope dropped");
                return;
            }
        };
        match envelope {
            Envelope::Response(response) => {
                if !self.callbacks.complete(&response.return_id, response.result) {
                    tracing::error!(
                        return_id = %response.return_id,
                        "rmi response for unknown return id dropped"
                    );
                }
            }
            Envelope::Request(request) => match request.worker.clone() {
                Some(group) => self.forward_to_worker(origin, &group, request).await,
                None => self.dispatch_local(origin, request).await,
            },
        }
    }

    /// Invoke on a primary-owned component and answer the origin worker.
    async fn dispatch_local(&self, origin: &Arc<WorkerLink>, request: RmiRequest) {
        let Some(registry) = self.registry.get() else {
            tracing::error!("rmi request before the primary registry was bound");
            return;
        };
        if let Some(response) = rmi::dispatch_request(registry, request).await {
            if let Err(e) = origin.send(&Envelope::Response(response)).await {
                tracing::error!(pid = origin.pid, error = %e, "rmi reply failed");
            }
        }
    }

    /// Forward a worker-addressed request, relaying the eventual response
    /// back to the origin. Return ids are pid-scoped, so the origin's id
    /// is reused as-is.
    async fn forward_to_worker(
        self: &Arc<Self>,
        origin: &Arc<WorkerLink>,
        group: &str,
        mut request: RmiRequest,
    ) {
        let Some(target) = self.worker(group) else {
            tracing::error!(group, "rmi request for unknown worker group");
            if let Some(return_id) = request.return_id {
                let reply = Envelope::Response(RmiResponse {
                    return_id,
                    result: Value::Null,
                });
                if let Err(e) = origin.send(&reply).await {
                    tracing::error!(pid = origin.pid, error = %e, "rmi reply failed");
                }
            }
            return;
        };

        if let Some(return_id) = &request.return_id {
            let rx = self.callbacks.register(return_id);
            let origin = origin.clone();
            let return_id = return_id.clone();
            tokio::spawn(async move {
                if let Ok(result) = rx.await {
                    let reply = Envelope::Response(RmiResponse { return_id, result });
                    if let Err(e) = origin.send(&reply).await {
                        tracing::error!(pid = origin.pid, error = %e, "rmi relay failed");
                    }
                }
            });
        }

        request.worker = None;
        if let Err(e) = target.send(&Envelope::Request(request)).await {
            tracing::error!(group, error = %e, "rmi forward failed");
        }
    }

    /// Primary-initiated call into a named worker group.
    pub async fn call_worker(
        &self,
        group: &str,
        component_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let link = self
            .worker(group)
            .ok_or_else(|| Error::Rmi(format!("no live worker in group {group:?}")))?;
        let return_id = self.callbacks.next_return_id();
        let rx = self.callbacks.register(&return_id);
        link.send(&Envelope::Request(RmiRequest {
            component_id: component_id.to_string(),
            method: method.to_string(),
            args,
            return_id: Some(return_id),
            worker: None,
        }))
        .await?;
        rx.await
            .map_err(|_| Error::Rmi("worker exited before replying".into()))
    }
}

impl Default for RmiHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_from(json: Value) -> Cluster {
        let block = match json {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        };
        let config: ClusterConfig =
            serde_json::from_value(Value::Object(block)).unwrap();
        Cluster {
            config,
            hub: Arc::new(RmiHub::new()),
        }
    }

    #[test]
    fn explicit_worker_groups_are_used_as_given() {
        let cluster = cluster_from(serde_json::json!({
            "enable": true,
            "workers": [
                {"name": "app", "count": 4},
                {"name": "logger", "count": 1}
            ]
        }));
        let groups = cluster.effective_workers();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].name, "app");
        assert_eq!(groups[0].count, 4);
        assert_eq!(groups[1].name, "logger");
    }

    #[test]
    fn number_of_workers_fills_the_default_group() {
        let cluster = cluster_from(serde_json::json!({
            "enable": true,
            "numberOfWorkers": 2
        }));
        let groups = cluster.effective_workers();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "app");
        assert_eq!(groups[0].count, 2);
    }

    #[tokio::test]
    async fn worker_bookkeeping_tracks_attach_and_detach() {
        let hub = Arc::new(RmiHub::new());
        let mut children = Vec::new();
        let mut links = Vec::new();
        for _ in 0..2 {
            let mut child = tokio::process::Command::new("cat")
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .unwrap();
            let stdin = child.stdin.take().unwrap();
            let pid = child.id().unwrap_or_default();
            links.push(Arc::new(WorkerLink {
                group: "app".into(),
                pid,
                stdin: Mutex::new(stdin),
            }));
            children.push(child);
        }

        hub.attach(links[0].clone());
        hub.attach(links[1].clone());
        assert_eq!(hub.group_len("app"), 2);

        // Losing a worker leaves the rest of its group addressable.
        hub.detach(&links[0]);
        assert_eq!(hub.group_len("app"), 1);
        assert_eq!(hub.worker("app").unwrap().pid, links[1].pid);
        assert_eq!(hub.group_len("logger"), 0);

        for mut child in children {
            let _ = child.kill().await;
        }
    }

    #[test]
    fn zero_count_groups_fail_validation() {
        let cluster = cluster_from(serde_json::json!({
            "enable": true,
            "workers": [{"name": "app", "count": 0}]
        }));
        let registry = Registry::new();
        let err = cluster
            .load(&LoadContext {
                registry: &registry,
                rmi: None,
                role: &Role::Main,
            })
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
