//! Cross-process remote method invocation.
//!
//! # Wire format
//! Newline-delimited JSON envelopes over the worker's stdio pair:
//! requests `{componentId, method, args, returnId?, worker?}` and
//! responses `{returnId, result}`. A `returnId` (`<pid>-<counter>`) exists
//! only when the caller wants the result back; uniqueness rides on pid
//! uniqueness across concurrently live processes. The optional `worker`
//! field asks the primary to forward the request into a named worker
//! group.
//!
//! # Failure semantics
//! A response with an unknown `returnId` is logged and dropped. A request
//! naming an unknown component or method is logged and, when a reply is
//! expected, answered with `null` so the caller resolves instead of
//! leaking. There is no timeout: a caller whose peer never replies waits
//! indefinitely.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex};

use crate::component::Registry;
use crate::error::{Error, Result};

/// One unit of cross-process communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    Request(RmiRequest),
    Response(RmiResponse),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RmiRequest {
    pub component_id: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RmiResponse {
    pub return_id: String,
    #[serde(default)]
    pub result: Value,
}

/// Pending-callback table keyed by `returnId`. Each entry is consumed
/// exactly once by the response that names it.
pub struct CallbackTable {
    pending: DashMap<String, oneshot::Sender<Value>>,
    counter: AtomicU64,
}

impl CallbackTable {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            counter: AtomicU64::new(0),
        }
    }

    /// A process-unique return id.
    pub fn next_return_id(&self) -> String {
        format!(
            "{}-{}",
            std::process::id(),
            self.counter.fetch_add(1, Ordering::Relaxed)
        )
    }

    pub fn register(&self, return_id: &str) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(return_id.to_string(), tx);
        rx
    }

    /// Deliver a result, removing the entry. `false` when the id is
    /// unknown (already consumed, or never issued here).
    pub fn complete(&self, return_id: &str, result: Value) -> bool {
        match self.pending.remove(return_id) {
            Some((_, tx)) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Default for CallbackTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker-side handle on the channel to the primary.
///
/// Writes envelopes to this process's stdout; the worker runtime feeds
/// responses read from stdin back in through [`RmiClient::handle_response`].
pub struct RmiClient {
    callbacks: CallbackTable,
    out: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl RmiClient {
    /// A client writing to this process's stdout (the worker IPC channel).
    pub fn stdio() -> Self {
        Self::over(Box::new(tokio::io::stdout()))
    }

    /// A client over an arbitrary writer. Used by tests to capture the
    /// outbound side.
    pub fn over(writer: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        Self {
            callbacks: CallbackTable::new(),
            out: Mutex::new(writer),
        }
    }

    /// Invoke a method on a primary-owned component and wait for the
    /// result.
    pub async fn call(&self, component_id: &str, method: &str, args: Vec<Value>) -> Result<Value> {
        self.call_via(None, component_id, method, args).await
    }

    /// Invoke a method on a component owned by a named worker group,
    /// routed through the primary.
    pub async fn call_worker(
        &self,
        worker: &str,
        component_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.call_via(Some(worker), component_id, method, args).await
    }

    async fn call_via(
        &self,
        worker: Option<&str>,
        component_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let return_id = self.callbacks.next_return_id();
        let rx = self.callbacks.register(&return_id);
        self.send(&Envelope::Request(RmiRequest {
            component_id: component_id.to_string(),
            method: method.to_string(),
            args,
            return_id: Some(return_id),
            worker: worker.map(str::to_string),
        }))
        .await?;
        rx.await
            .map_err(|_| Error::Rmi("channel closed before the reply arrived".into()))
    }

    /// Fire-and-forget invocation: no return id is generated and no reply
    /// is ever expected.
    pub async fn notify(&self, component_id: &str, method: &str, args: Vec<Value>) -> Result<()> {
        self.send(&Envelope::Request(RmiRequest {
            component_id: component_id.to_string(),
            method: method.to_string(),
            args,
            return_id: None,
            worker: None,
        }))
        .await
    }

    /// Feed in a response read off the channel.
    pub fn handle_response(&self, response: RmiResponse) {
        if !self.callbacks.complete(&response.return_id, response.result) {
            tracing::error!(
                return_id = %response.return_id,
                "rmi response for unknown return id dropped"
            );
        }
    }

    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        let line = encode(envelope)?;
        let mut out = self.out.lock().await;
        out.write_all(line.as_bytes()).await?;
        out.flush().await?;
        Ok(())
    }

    pub fn callbacks(&self) -> &CallbackTable {
        &self.callbacks
    }
}

/// Serialize an envelope as one wire line.
pub fn encode(envelope: &Envelope) -> Result<String> {
    let mut line =
        serde_json::to_string(envelope).map_err(|e| Error::Rmi(format!("encode: {e}")))?;
    line.push('\n');
    Ok(line)
}

/// Resolve and invoke a locally-owned component method on behalf of a
/// remote caller. Returns the response to send back, when one is expected.
pub async fn dispatch_request(registry: &Registry, request: RmiRequest) -> Option<RmiResponse> {
    let result = match registry.by_id(&request.component_id) {
        Some(component) => match component.invoke(&request.method, &request.args).await {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(
                    component_id = %request.component_id,
                    method = %request.method,
                    error = %e,
                    "rmi invocation failed"
                );
                Value::Null
            }
        },
        None => {
            tracing::error!(
                component_id = %request.component_id,
                "rmi request for unknown component"
            );
            Value::Null
        }
    };
    request.return_id.map(|return_id| RmiResponse {
        return_id,
        result,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn envelopes_round_trip_over_the_wire() {
        let request = Envelope::Request(RmiRequest {
            component_id: "SharedStore".into(),
            method: "get".into(),
            args: vec![serde_json::json!("key")],
            return_id: Some("41-7".into()),
            worker: None,
        });
        let line = encode(&request).unwrap();
        assert!(line.ends_with('\n'));
        assert!(line.contains("\"componentId\":\"SharedStore\""));
        assert!(line.contains("\"returnId\":\"41-7\""));
        assert!(!line.contains("worker"));

        match serde_json::from_str::<Envelope>(line.trim()).unwrap() {
            Envelope::Request(parsed) => {
                assert_eq!(parsed.component_id, "SharedStore");
                assert_eq!(parsed.method, "get");
            }
            other => panic!("parsed as {other:?}"),
        }

        let response = r#"{"returnId":"41-7","result":{"hits":2}}"#;
        match serde_json::from_str::<Envelope>(response).unwrap() {
            Envelope::Response(parsed) => {
                assert_eq!(parsed.return_id, "41-7");
                assert_eq!(parsed.result, serde_json::json!({"hits": 2}));
            }
            other => panic!("parsed as {other:?}"),
        }
    }

    #[test]
    fn return_ids_are_unique_and_pid_scoped() {
        let table = CallbackTable::new();
        let a = table.next_return_id();
        let b = table.next_return_id();
        assert_ne!(a, b);
        let pid = std::process::id().to_string();
        assert!(a.starts_with(&format!("{pid}-")));
    }

    #[tokio::test]
    async fn callback_is_consumed_exactly_once() {
        let table = CallbackTable::new();
        let id = table.next_return_id();
        let rx = table.register(&id);

        assert!(table.complete(&id, serde_json::json!("done")));
        assert_eq!(table.pending_len(), 0);
        assert_eq!(rx.await.unwrap(), serde_json::json!("done"));

        // Second delivery finds nothing.
        assert!(!table.complete(&id, serde_json::json!("again")));
    }

    #[tokio::test]
    async fn unknown_component_answers_null_when_reply_expected() {
        let registry = Registry::new();
        let response = dispatch_request(
            &registry,
            RmiRequest {
                component_id: "missing".into(),
                method: "get".into(),
                args: vec![],
                return_id: Some("9-9".into()),
                worker: None,
            },
        )
        .await
        .expect("a reply was expected");
        assert_eq!(response.result, Value::Null);
    }

    #[tokio::test]
    async fn fire_and_forget_requests_produce_no_response() {
        let registry = Registry::new();
        let response = dispatch_request(
            &registry,
            RmiRequest {
                component_id: "missing".into(),
                method: "set".into(),
                args: vec![],
                return_id: None,
                worker: None,
            },
        )
        .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn worker_call_round_trips_through_the_channel() {
        use std::sync::Arc;
        use tokio::io::{AsyncBufReadExt, BufReader};

        let (tx, rx) = tokio::io::duplex(4096);
        let client = Arc::new(RmiClient::over(Box::new(tx)));

        let caller = client.clone();
        let pending = tokio::spawn(async move {
            caller
                .call("SharedStore", "get", vec![serde_json::json!("k")])
                .await
        });

        // The other side of the channel sees exactly one request line.
        let mut lines = BufReader::new(rx).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let request = match serde_json::from_str::<Envelope>(&line).unwrap() {
            Envelope::Request(request) => request,
            other => panic!("expected a request, got {other:?}"),
        };
        assert_eq!(request.component_id, "SharedStore");
        let return_id = request.return_id.expect("calls carry a return id");

        client.handle_response(RmiResponse {
            return_id,
            result: serde_json::json!({"hits": 2}),
        });

        let result = pending.await.unwrap().unwrap();
        assert_eq!(result, serde_json::json!({"hits": 2}));
        assert_eq!(client.callbacks().pending_len(), 0);
    }

    #[tokio::test]
    async fn dispatch_reaches_component_methods() {
        let mut registry = Registry::new();
        let store = std::sync::Arc::new(MemoryStore::new(Some("SharedStore".into())));
        registry.insert(store.clone()).unwrap();

        dispatch_request(
            &registry,
            RmiRequest {
                component_id: "SharedStore".into(),
                method: "set".into(),
                args: vec![serde_json::json!("k"), serde_json::json!(5)],
                return_id: None,
                worker: None,
            },
        )
        .await;

        let response = dispatch_request(
            &registry,
            RmiRequest {
                component_id: "SharedStore".into(),
                method: "get".into(),
                args: vec![serde_json::json!("k")],
                return_id: Some("1-1".into()),
                worker: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(response.result, serde_json::json!(5));
    }
}
