//! File and stdout line sinks.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::component::{Block, Component, LoadContext};
use crate::error::{Error, Result};
use crate::stream::LogStream;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileStreamConfig {
    #[serde(default)]
    id: Option<String>,
    path: String,
}

/// Appends lines to a file opened at load time. Rotation is out of scope;
/// pair with external rotation if needed.
pub struct FileStream {
    config: FileStreamConfig,
    file: OnceLock<Mutex<tokio::fs::File>>,
}

impl FileStream {
    pub fn factory(block: &Block) -> Result<Arc<dyn Component>> {
        let config: FileStreamConfig = serde_json::from_value(Value::Object(block.clone()))
            .map_err(|e| Error::Config(format!("stream.file requires a path: {e}")))?;
        Ok(Arc::new(Self {
            config,
            file: OnceLock::new(),
        }))
    }
}

#[async_trait]
impl Component for FileStream {
    fn namespace(&self) -> &'static str {
        "stream.file"
    }

    fn id(&self) -> Option<&str> {
        self.config.id.as_deref()
    }

    fn load(&self, _ctx: &LoadContext<'_>) -> Result<()> {
        let path = PathBuf::from(&self.config.path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                Error::Config(format!("stream.file cannot open {}: {e}", path.display()))
            })?;
        let _ = self.file.set(Mutex::new(tokio::fs::File::from_std(file)));
        Ok(())
    }

    /// RMI surface: `write(line)`.
    async fn invoke(&self, method: &str, args: &[Value]) -> Result<Value> {
        match method {
            "write" => {
                if let Some(line) = args.first().and_then(Value::as_str) {
                    self.write(line).await;
                }
                Ok(Value::Null)
            }
            other => Err(Error::UnknownMethod {
                component: self.config.id.clone().unwrap_or_else(|| "stream.file".into()),
                method: other.to_string(),
            }),
        }
    }

    fn as_stream(self: Arc<Self>) -> Option<Arc<dyn LogStream>> {
        Some(self)
    }
}

#[async_trait]
impl LogStream for FileStream {
    async fn write(&self, line: &str) {
        let Some(file) = self.file.get() else {
            tracing::warn!(path = %self.config.path, "stream.file written before load");
            return;
        };
        let mut file = file.lock().await;
        let mut line = line.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        let result = async {
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(path = %self.config.path, error = %e, "access log write failed");
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StdoutStreamConfig {
    #[serde(default)]
    id: Option<String>,
}

/// Writes lines to standard output. Not for worker processes, whose
/// stdout carries the RMI channel.
pub struct StdoutStream {
    config: StdoutStreamConfig,
}

impl StdoutStream {
    pub fn factory(block: &Block) -> Result<Arc<dyn Component>> {
        let config: StdoutStreamConfig = serde_json::from_value(Value::Object(block.clone()))
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(Arc::new(Self { config }))
    }
}

#[async_trait]
impl Component for StdoutStream {
    fn namespace(&self) -> &'static str {
        "stream.stdout"
    }

    fn id(&self) -> Option<&str> {
        self.config.id.as_deref()
    }

    fn load(&self, ctx: &LoadContext<'_>) -> Result<()> {
        if ctx.rmi.is_some() {
            return Err(Error::Config(
                "stream.stdout cannot run in a cluster worker; its stdout is the rmi channel"
                    .into(),
            ));
        }
        Ok(())
    }

    async fn invoke(&self, method: &str, args: &[Value]) -> Result<Value> {
        match method {
            "write" => {
                if let Some(line) = args.first().and_then(Value::as_str) {
                    self.write(line).await;
                }
                Ok(Value::Null)
            }
            other => Err(Error::UnknownMethod {
                component: self
                    .config
                    .id
                    .clone()
                    .unwrap_or_else(|| "stream.stdout".into()),
                method: other.to_string(),
            }),
        }
    }

    fn as_stream(self: Arc<Self>) -> Option<Arc<dyn LogStream>> {
        Some(self)
    }
}

#[async_trait]
impl LogStream for StdoutStream {
    async fn write(&self, line: &str) {
        let mut out = tokio::io::stdout();
        let mut line = line.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        if let Err(e) = out.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "stdout stream write failed");
        }
    }
}
