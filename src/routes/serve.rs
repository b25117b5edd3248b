//! Static file route.
//!
//! Resolution, MIME lookup and conditional-request handling are delegated
//! to tower-http's services; this route only validates its root at load
//! time and strips the matched path prefix before handing the request on.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::Value;
use tower::util::ServiceExt;
use tower_http::services::{ServeDir, ServeFile};

use crate::component::{Block, Component, LoadContext};
use crate::error::{Error, Result};
use crate::limiter::RateLimit;
use crate::logger::Logger;
use crate::routes::{MatchResult, RequestContext, RequestUrl, Route, RouteBase};

fn default_index() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServeConfig {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "match")]
    match_: serde_json::Map<String, Value>,
    #[serde(default)]
    logger_id: Option<String>,
    #[serde(default)]
    rate_limit_id: Option<String>,
    root: String,
    /// Append index.html when a directory is requested.
    #[serde(default = "default_index")]
    index: bool,
}

enum Files {
    Dir(ServeDir),
    File(ServeFile),
}

pub struct Serve {
    config: ServeConfig,
    base: RouteBase,
    files: Files,
}

impl Serve {
    pub fn factory(block: &Block) -> Result<Arc<dyn Component>> {
        let config: ServeConfig = serde_json::from_value(Value::Object(block.clone()))
            .map_err(|e| Error::Config(format!("route.serve requires a root: {e}")))?;
        let base = RouteBase::compile(
            &config.match_,
            config.logger_id.clone(),
            config.rate_limit_id.clone(),
        )?;

        let root = PathBuf::from(&config.root);
        if !root.exists() {
            return Err(Error::Config(format!(
                "route.serve root does not exist: {}",
                root.display()
            )));
        }
        let files = if root.is_file() {
            Files::File(ServeFile::new(&root))
        } else {
            Files::Dir(ServeDir::new(&root).append_index_html_on_directories(config.index))
        };

        Ok(Arc::new(Self {
            config,
            base,
            files,
        }))
    }
}

#[async_trait]
impl Route for Serve {
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
        let mut request = ctx.request;

        // Strip the matched path prefix so `/static/app.js` under a match
        // of `/static` resolves `app.js` inside the root.
        if let Some(prefix) = ctx.matched.get("pathname") {
            let stripped = ctx
                .url
                .pathname
                .strip_prefix(prefix.as_str())
                .unwrap_or(&ctx.url.pathname);
            let mut path = if stripped.starts_with('/') {
                stripped.to_string()
            } else {
                format!("/{stripped}")
            };
            if !ctx.url.search.is_empty() {
                path.push_str(&ctx.url.search);
            }
            if let Ok(uri) = path.parse::<Uri>() {
                *request.uri_mut() = uri;
            }
        }

        let result = match &self.files {
            Files::Dir(files) => files.clone().oneshot(with_empty_body(request)).await,
            Files::File(file) => file.clone().oneshot(with_empty_body(request)).await,
        };
        match result {
            Ok(response) => response.map(Body::new).into_response(),
            Err(e) => {
                tracing::error!(root = %self.config.root, error = %e, "static serve failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

/// The file services never read a request body.
fn with_empty_body(request: Request<Body>) -> Request<Body> {
    let (parts, _) = request.into_parts();
    Request::from_parts(parts, Body::empty())
}

#[async_trait]
impl Component for Serve {
    fn namespace(&self) -> &'static str {
        "route.serve"
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
