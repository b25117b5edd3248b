//! Redirect route.
//!
//! Answers a matched request with a Location header built from a `${...}`
//! URL template evaluated against the request context.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::Value;

use crate::component::{Block, Component, LoadContext};
use crate::config::refs;
use crate::error::{Error, Result};
use crate::limiter::RateLimit;
use crate::logger::Logger;
use crate::routes::{MatchResult, RequestContext, RequestUrl, RequestVars, Route, RouteBase};

fn default_status_code() -> u16 {
    307
}

fn default_body() -> String {
    "${redirect.statusMessage}. Redirecting to ${redirect.url}".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RedirectConfig {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "match")]
    match_: serde_json::Map<String, Value>,
    #[serde(default)]
    logger_id: Option<String>,
    #[serde(default)]
    rate_limit_id: Option<String>,
    url: String,
    #[serde(default = "default_status_code")]
    status_code: u16,
    #[serde(default)]
    status_message: Option<String>,
    #[serde(default = "default_body")]
    body: String,
}

pub struct Redirect {
    config: RedirectConfig,
    base: RouteBase,
    status: StatusCode,
    status_message: String,
}

impl Redirect {
    pub fn factory(block: &Block) -> Result<Arc<dyn Component>> {
        let config: RedirectConfig = serde_json::from_value(Value::Object(block.clone()))
            .map_err(|e| Error::Config(format!("route.redirect requires a url: {e}")))?;
        let status = StatusCode::from_u16(config.status_code)
            .map_err(|_| Error::InvalidStatusCode(config.status_code))?;
        let status_message = config
            .status_message
            .clone()
            .or_else(|| status.canonical_reason().map(str::to_string))
            .unwrap_or_else(|| status.as_str().to_string());
        let base = RouteBase::compile(
            &config.match_,
            config.logger_id.clone(),
            config.rate_limit_id.clone(),
        )?;
        Ok(Arc::new(Self {
            config,
            base,
            status,
            status_message,
        }))
    }
}

#[async_trait]
impl Route for Redirect {
    fn is_match(&self, url: &RequestUrl) -> Option<MatchResult> {
        self.base.is_match(url)
    }

    fn logger(&self) -> Option<Arc<Logger>> {
        self.base.logger()
    }

    fn rate_limit(&self) -> Option<Arc<RateLimit>> {
        self.base.rate_limit()
    }

    async fn execute(&self, ctx: RequestContext) -> Response {
        let vars = RequestVars {
            url: &ctx.url,
            matched: &ctx.matched,
            headers: ctx.request.headers(),
            peer: ctx.peer,
        };
        let location = refs::replace_str(&self.config.url, &|name| vars.resolve(name));
        let body = refs::replace_str(&self.config.body, &|name| match name {
            "redirect.url" => Some(location.clone()),
            "redirect.statusCode" => Some(self.status.as_u16().to_string()),
            "redirect.statusMessage" => Some(self.status_message.clone()),
            other => vars.resolve(other),
        });

        let location = match HeaderValue::from_str(&location) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(url = %location, error = %e, "redirect target is not a valid header value");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };

        let body = if ctx.url.method == "HEAD" {
            Body::empty()
        } else {
            Body::from(body)
        };
        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        response
            .headers_mut()
            .insert(axum::http::header::LOCATION, location);
        response
    }
}

#[async_trait]
impl Component for Redirect {
    fn namespace(&self) -> &'static str {
        "route.redirect"
    }

    fn id(&self) -> Option<&str> {
        self.config.id.as_deref()
    }

    fn load(&self, ctx: &LoadContext<'_>) -> Result<()> {
        self.base.load(ctx)
    }

    fn as_route(self: Arc<Self>) -> Option<Arc<dyn Route>> {
        Some(self)
    }
}
