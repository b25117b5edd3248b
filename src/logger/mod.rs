//! Access logging.
//!
//! A logger formats one line per finished exchange from a `${...}`
//! template and hands it to its stream. Formatting and writing happen on a
//! spawned task so the response path never waits on log I/O.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::component::{Block, Component, LoadContext};
use crate::config::refs;
use crate::error::{Error, Result};
use crate::routes::RequestUrl;
use crate::stream::LogStream;

fn default_format() -> String {
    "${request.remoteAddress} - ${process.pid} - [${time}] \"${request.method} ${url.path} \
     HTTP/${request.httpVersion}\" ${response.statusCode} ${response.headers.content-length} \
     \"${request.headers.user-agent}\""
        .to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoggerConfig {
    #[serde(default)]
    id: Option<String>,
    stream_id: String,
    #[serde(default = "default_format")]
    format: String,
}

/// Snapshot of one finished exchange, everything a format template can
/// reference.
#[derive(Debug, Clone)]
pub struct AccessRecord {
    pub url: RequestUrl,
    pub peer: SocketAddr,
    pub http_version: &'static str,
    pub status: u16,
    pub request_headers: HeaderMap,
    pub response_headers: HeaderMap,
    pub time: DateTime<Utc>,
}

impl AccessRecord {
    fn resolve(&self, name: &str) -> Option<String> {
        if let Some(field) = name.strip_prefix("url.") {
            return self.url.field(field).map(str::to_string);
        }
        if let Some(header) = name.strip_prefix("request.headers.") {
            return header_value(&self.request_headers, header);
        }
        if let Some(header) = name.strip_prefix("response.headers.") {
            return header_value(&self.response_headers, header);
        }
        match name {
            "request.method" => Some(self.url.method.clone()),
            "request.remoteAddress" => Some(self.peer.ip().to_string()),
            "request.httpVersion" => Some(self.http_version.to_string()),
            "response.statusCode" => Some(self.status.to_string()),
            "process.pid" => Some(std::process::id().to_string()),
            "time" => Some(self.time.format("%d/%b/%Y:%H:%M:%S %z").to_string()),
            _ => None,
        }
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Formats access records and forwards them to its stream.
pub struct Logger {
    config: LoggerConfig,
    stream: OnceLock<Arc<dyn LogStream>>,
}

impl Logger {
    pub fn factory(block: &Block) -> Result<Arc<dyn Component>> {
        let config: LoggerConfig = serde_json::from_value(Value::Object(block.clone()))
            .map_err(|e| Error::Config(format!("logger requires a streamId: {e}")))?;
        Ok(Arc::new(Self {
            config,
            stream: OnceLock::new(),
        }))
    }

    /// Format the record; missing fields render as `-`.
    pub fn format(&self, record: &AccessRecord) -> String {
        refs::replace_str_or(&self.config.format, &|name| record.resolve(name), "-")
    }

    /// Fire-and-forget with respect to the response; the write completes
    /// on its own task.
    pub fn log(&self, record: AccessRecord) {
        let Some(stream) = self.stream.get().cloned() else {
            tracing::warn!("logger used before load");
            return;
        };
        let line = self.format(&record);
        tokio::spawn(async move {
            stream.write(&line).await;
        });
    }
}

#[async_trait]
impl Component for Logger {
    fn namespace(&self) -> &'static str {
        "logger"
    }

    fn id(&self) -> Option<&str> {
        self.config.id.as_deref()
    }

    fn load(&self, ctx: &LoadContext<'_>) -> Result<()> {
        let stream = ctx.registry.stream(&self.config.stream_id)?;
        let _ = self.stream.set(stream);
        Ok(())
    }

    fn as_logger(self: Arc<Self>) -> Option<Arc<Logger>> {
        Some(self)
    }
}
