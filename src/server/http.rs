//! HTTP(S) listener component.
//!
//! # Responsibilities
//! - Bind the configured address, with TLS when key/cert are given
//! - Hand every request to the dispatch pipeline with peer info
//! - Watch the TLS key file and re-read the PEM pair after a delay, so
//!   certificates rotate without downtime
//!
//! # Design Decisions
//! - The route list is snapshotted from the registry at load time; it is
//!   immutable while serving
//! - Certificate reload swaps the rustls config in place; established
//!   connections drain naturally

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::Request;
use axum::response::Response;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use serde_json::Value;

use crate::component::{Block, Component, LoadContext, StartContext};
use crate::error::{Error, Result};
use crate::server::pipeline::Dispatcher;

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_watch() -> bool {
    true
}
fn default_watch_restart_delay() -> u64 {
    10_000
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpServerConfig {
    #[serde(default)]
    id: Option<String>,
    #[serde(default = "default_host")]
    host: String,
    port: u16,
    /// PEM private key path; together with `cert` enables TLS.
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    cert: Option<String>,
    /// Watch the key file and reload certificates on change.
    #[serde(default = "default_watch")]
    watch: bool,
    #[serde(default = "default_watch_restart_delay")]
    watch_restart_delay: u64,
}

pub struct HttpServer {
    config: HttpServerConfig,
    dispatcher: OnceLock<Arc<Dispatcher>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl HttpServer {
    pub fn factory(block: &Block) -> Result<Arc<dyn Component>> {
        let config: HttpServerConfig = serde_json::from_value(Value::Object(block.clone()))
            .map_err(|e| Error::Config(format!("server.http requires a port: {e}")))?;
        if config.key.is_some() != config.cert.is_some() {
            return Err(Error::Config(
                "server.http needs both key and cert for TLS, or neither".into(),
            ));
        }
        Ok(Arc::new(Self {
            config,
            dispatcher: OnceLock::new(),
            watcher: Mutex::new(None),
        }))
    }

    fn encrypted(&self) -> bool {
        self.config.key.is_some()
    }

    fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| {
                Error::Config(format!(
                    "server.http bind address {}:{}: {e}",
                    self.config.host, self.config.port
                ))
            })
    }

    fn router(&self) -> Result<Router> {
        let dispatcher = self
            .dispatcher
            .get()
            .cloned()
            .ok_or_else(|| Error::Config("server started before load".into()))?;
        Ok(Router::new().fallback(handle).with_state(dispatcher))
    }

    /// Same-group workers all bind the listener address; SO_REUSEPORT lets
    /// the kernel spread connections across them (the moral equivalent of
    /// the shared listening socket a forking supervisor would hand out).
    fn bind(&self, addr: SocketAddr, reuse_port: bool) -> Result<tokio::net::TcpListener> {
        let socket = match addr {
            SocketAddr::V4(_) => tokio::net::TcpSocket::new_v4()?,
            SocketAddr::V6(_) => tokio::net::TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        #[cfg(unix)]
        if reuse_port {
            socket.set_reuseport(true)?;
        }
        #[cfg(not(unix))]
        let _ = reuse_port;
        socket.bind(addr)?;
        Ok(socket.listen(1024)?)
    }

    async fn serve_plain(&self, addr: SocketAddr, reuse_port: bool) -> Result<()> {
        let listener = self.bind(addr, reuse_port)?;
        let app = self
            .router()?
            .into_make_service_with_connect_info::<SocketAddr>();
        tracing::info!(address = %addr, "http server listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "http server stopped");
            }
        });
        Ok(())
    }

    async fn serve_tls(&self, addr: SocketAddr, reuse_port: bool) -> Result<()> {
        let key = PathBuf::from(self.config.key.as_deref().unwrap_or_default());
        let cert = PathBuf::from(self.config.cert.as_deref().unwrap_or_default());
        for path in [&key, &cert] {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "server.http tls file does not exist: {}",
                    path.display()
                )));
            }
        }

        let rustls = RustlsConfig::from_pem_file(&cert, &key)
            .await
            .map_err(|e| Error::Config(format!("server.http tls material: {e}")))?;

        let listener = self.bind(addr, reuse_port)?.into_std()?;
        let app = self
            .router()?
            .into_make_service_with_connect_info::<SocketAddr>();
        tracing::info!(address = %addr, "https server listening");

        let server = axum_server::from_tcp_rustls(listener, rustls.clone());
        tokio::spawn(async move {
            if let Err(e) = server.serve(app).await {
                tracing::error!(error = %e, "https server stopped");
            }
        });

        if self.config.watch {
            self.watch_key_material(rustls, key, cert)?;
        }
        Ok(())
    }

    /// Reload certificates some time after the key file changes. The delay
    /// leaves room for the matching cert file to be written too.
    fn watch_key_material(&self, rustls: RustlsConfig, key: PathBuf, cert: PathBuf) -> Result<()> {
        let delay = Duration::from_millis(self.config.watch_restart_delay);
        let handle = tokio::runtime::Handle::current();
        let pending = Arc::new(AtomicBool::new(false));
        let watch_target = key.clone();

        let mut watcher = RecommendedWatcher::new(
            move |event: std::result::Result<notify::Event, notify::Error>| {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::error!(error = %e, "tls key watch error");
                        return;
                    }
                };
                if !(event.kind.is_modify() || event.kind.is_create()) {
                    return;
                }
                // Collapse bursts of file events into one reload.
                if pending.swap(true, Ordering::SeqCst) {
                    return;
                }
                tracing::info!(delay_ms = delay.as_millis() as u64, "tls key changed, scheduling reload");

                let rustls = rustls.clone();
                let key = key.clone();
                let cert = cert.clone();
                let pending = pending.clone();
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    pending.store(false, Ordering::SeqCst);
                    match rustls.reload_from_pem_file(&cert, &key).await {
                        Ok(()) => tracing::info!("tls certificates reloaded"),
                        Err(e) => {
                            tracing::error!(error = %e, "tls reload failed, keeping current certificates")
                        }
                    }
                });
            },
            notify::Config::default(),
        )
        .map_err(|e| Error::Config(format!("tls key watcher: {e}")))?;

        watcher
            .watch(Path::new(&watch_target), RecursiveMode::NonRecursive)
            .map_err(|e| Error::Config(format!("tls key watcher: {e}")))?;

        *self.watcher.lock().expect("watcher mutex poisoned") = Some(watcher);
        Ok(())
    }
}

async fn handle(
    State(dispatcher): State<Arc<Dispatcher>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    dispatcher.dispatch(peer, request).await
}

#[async_trait]
impl Component for HttpServer {
    fn namespace(&self) -> &'static str {
        "server.http"
    }

    fn id(&self) -> Option<&str> {
        self.config.id.as_deref()
    }

    fn load(&self, ctx: &LoadContext<'_>) -> Result<()> {
        let scheme = if self.encrypted() { "https" } else { "http" };
        let dispatcher = Arc::new(Dispatcher::new(ctx.registry.routes(), scheme));
        let _ = self.dispatcher.set(dispatcher);
        self.bind_addr().map(|_| ())
    }

    async fn start(&self, ctx: &StartContext) -> Result<()> {
        let addr = self.bind_addr()?;
        let reuse_port = matches!(ctx.role, crate::component::Role::Worker(_));
        if self.encrypted() {
            self.serve_tls(addr, reuse_port).await
        } else {
            self.serve_plain(addr, reuse_port).await
        }
    }
}
