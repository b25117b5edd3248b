//! Rate limiting.
//!
//! # Responsibilities
//! - Key requests by client identity (remote address)
//! - Apply window-reset-or-increment semantics over a pluggable store
//! - Attach standard RateLimit-* headers
//! - Produce the rejection response once the limit is exceeded
//!
//! # Design Decisions
//! - The limiter holds no storage beyond a store reference: it only
//!   orchestrates get -> mutate -> set, so the store may be process-local
//!   or a cross-process round trip
//! - Store failures fail open: a broken store must not take the proxy down
//!   with it

use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::component::{Block, Component, LoadContext};
use crate::error::{Error, Result};
use crate::store::Store;

fn default_max() -> u64 {
    100
}
fn default_window_ms() -> u64 {
    60_000
}
fn default_status_code() -> u16 {
    429
}
fn default_status_message() -> String {
    "Too many requests, please try again later.".to_string()
}
fn default_set_headers() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitConfig {
    #[serde(default)]
    id: Option<String>,
    store_id: String,
    #[serde(default = "default_max")]
    max: u64,
    #[serde(default = "default_window_ms")]
    window_ms: u64,
    #[serde(default = "default_status_code")]
    status_code: u16,
    #[serde(default = "default_status_message")]
    status_message: String,
    #[serde(default = "default_set_headers")]
    set_headers: bool,
}

/// One client's window entry, as stored.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WindowEntry {
    hits: u64,
    reset_time: u64,
}

/// The outcome of a check: headers to attach to whatever response goes
/// out, plus the completed rejection when the limit was exceeded.
pub struct Decision {
    pub headers: HeaderMap,
    pub rejection: Option<Response>,
}

impl Decision {
    pub fn limited(&self) -> bool {
        self.rejection.is_some()
    }
}

pub struct RateLimit {
    config: RateLimitConfig,
    status: StatusCode,
    store: OnceLock<Arc<dyn Store>>,
}

impl RateLimit {
    pub fn factory(block: &Block) -> Result<Arc<dyn Component>> {
        let config: RateLimitConfig = serde_json::from_value(Value::Object(block.clone()))
            .map_err(|e| Error::Config(format!("rate-limit requires a storeId: {e}")))?;
        let status = StatusCode::from_u16(config.status_code)
            .map_err(|_| Error::InvalidStatusCode(config.status_code))?;
        Ok(Arc::new(Self {
            config,
            status,
            store: OnceLock::new(),
        }))
    }

    /// Count one request for `key` and decide whether it may proceed.
    pub async fn check(&self, key: &str) -> Decision {
        let store = match self.store.get() {
            Some(store) => store,
            None => {
                tracing::error!("rate limiter used before load; allowing request");
                return Decision {
                    headers: HeaderMap::new(),
                    rejection: None,
                };
            }
        };

        let now = now_millis();
        let mut entry = match store.get(key).await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or(WindowEntry {
                hits: 0,
                reset_time: now + self.config.window_ms,
            }),
            Ok(None) => WindowEntry {
                hits: 0,
                reset_time: now + self.config.window_ms,
            },
            Err(e) => {
                tracing::error!(error = %e, "rate limit store read failed; allowing request");
                return Decision {
                    headers: HeaderMap::new(),
                    rejection: None,
                };
            }
        };

        if now >= entry.reset_time {
            entry.hits = 0;
            entry.reset_time = now + self.config.window_ms;
        }
        entry.hits += 1;

        let ttl = Duration::from_millis(entry.reset_time.saturating_sub(now));
        if let Err(e) = store
            .set(
                key,
                serde_json::to_value(&entry).unwrap_or(Value::Null),
                Some(ttl),
            )
            .await
        {
            tracing::error!(error = %e, "rate limit store write failed");
        }

        let limited = entry.hits > self.config.max;
        let mut headers = HeaderMap::new();
        if self.config.set_headers {
            let remaining = self.config.max.saturating_sub(entry.hits);
            let reset_secs = entry.reset_time.saturating_sub(now).div_ceil(1000);
            insert_header(&mut headers, "ratelimit-limit", self.config.max.to_string());
            insert_header(&mut headers, "ratelimit-remaining", remaining.to_string());
            insert_header(&mut headers, "ratelimit-reset", reset_secs.to_string());
            if limited {
                let retry_secs = self.config.window_ms.div_ceil(1000);
                insert_header(&mut headers, "retry-after", retry_secs.to_string());
            }
        }

        let rejection = limited.then(|| {
            let mut response = Response::new(Body::from(self.config.status_message.clone()));
            *response.status_mut() = self.status;
            response
        });

        Decision { headers, rejection }
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: String) {
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(name, value);
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[async_trait]
impl Component for RateLimit {
    fn namespace(&self) -> &'static str {
        "rate-limit"
    }

    fn id(&self) -> Option<&str> {
        self.config.id.as_deref()
    }

    fn load(&self, ctx: &LoadContext<'_>) -> Result<()> {
        let store = ctx.registry.store(&self.config.store_id)?;
        let _ = self.store.set(store);
        Ok(())
    }

    fn as_rate_limit(self: Arc<Self>) -> Option<Arc<RateLimit>> {
        Some(self)
    }
}
