//! Route layer: request matching and the execute contract.
//!
//! # Responsibilities
//! - Normalize raw requests into a URL-like record
//! - Compile `match` blocks once at load time (literal or `//`-pattern)
//! - Combine conditions with AND semantics, first mismatch short-circuits
//! - Resolve each route's logger / rate-limiter references by id
//!
//! # Design Decisions
//! - Routes are evaluated in configuration order; the first match wins.
//!   This is a total order, not best-match.
//! - Patterns compile at load time, never per request
//! - The match result records which substring satisfied which field, so
//!   downstream logic can strip a matched path prefix

pub mod proxy;
pub mod redirect;
pub mod serve;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Request, Version};
use axum::response::Response;
use regex::Regex;
use serde_json::Value;

use crate::component::LoadContext;
use crate::error::{Error, Result};
use crate::limiter::RateLimit;
use crate::logger::Logger;

pub use proxy::HttpProxy;
pub use redirect::Redirect;
pub use serve::Serve;

/// Marks a match value as a pattern rather than a literal.
pub const PATTERN_PREFIX: &str = "//";

/// The substrings that satisfied each matched field.
pub type MatchResult = HashMap<String, String>;

/// Normalized view of an inbound request, the record match rules run
/// against. Field names follow the URL vocabulary used in configuration
/// (`protocol`, `hostname`, `pathname`, ...).
#[derive(Debug, Clone)]
pub struct RequestUrl {
    pub protocol: String,
    pub host: String,
    pub hostname: String,
    pub port: String,
    pub pathname: String,
    pub search: String,
    pub query: String,
    pub path: String,
    pub href: String,
    pub method: String,
}

impl RequestUrl {
    /// Build the record from request parts. `scheme` is `"http"` or
    /// `"https"` depending on which listener accepted the connection.
    pub fn from_request(scheme: &str, request: &Request<Body>) -> Self {
        let host = request
            .headers()
            .get(axum::http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| request.uri().authority().map(|a| a.to_string()))
            .unwrap_or_default();
        let (hostname, port) = match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
                (name.to_string(), port.to_string())
            }
            _ => (
                host.clone(),
                if scheme == "https" { "443" } else { "80" }.to_string(),
            ),
        };
        let pathname = request.uri().path().to_string();
        let query = request.uri().query().unwrap_or_default().to_string();
        let search = if query.is_empty() {
            String::new()
        } else {
            format!("?{query}")
        };
        let path = format!("{pathname}{search}");
        let protocol = format!("{scheme}:");
        let href = format!("{protocol}//{host}{path}");

        Self {
            protocol,
            host,
            hostname,
            port,
            pathname,
            search,
            query,
            path,
            href,
            method: request.method().as_str().to_string(),
        }
    }

    /// Look up a field by its configuration name.
    pub fn field(&self, name: &str) -> Option<&str> {
        let value = match name {
            "protocol" => &self.protocol,
            "host" => &self.host,
            "hostname" => &self.hostname,
            "port" => &self.port,
            "pathname" => &self.pathname,
            "search" => &self.search,
            "query" => &self.query,
            "path" => &self.path,
            "href" => &self.href,
            "method" => &self.method,
            _ => return None,
        };
        Some(value)
    }
}

/// One compiled `match` condition.
#[derive(Debug)]
pub struct MatchRule {
    field: String,
    matcher: Matcher,
}

#[derive(Debug)]
enum Matcher {
    Literal(String),
    Pattern(Regex),
}

impl MatchRule {
    /// Compile a configured value. A string starting with `//` compiles the
    /// remainder as a regular expression; everything else is an exact
    /// literal.
    pub fn compile(field: &str, value: &Value) -> Result<Self> {
        let matcher = match value {
            Value::String(s) if s.starts_with(PATTERN_PREFIX) => {
                let pattern = &s[PATTERN_PREFIX.len()..];
                let regex = Regex::new(pattern).map_err(|source| Error::Pattern {
                    pattern: pattern.to_string(),
                    source,
                })?;
                Matcher::Pattern(regex)
            }
            Value::String(s) => Matcher::Literal(s.clone()),
            Value::Number(n) => Matcher::Literal(n.to_string()),
            Value::Bool(b) => Matcher::Literal(b.to_string()),
            other => {
                return Err(Error::Config(format!(
                    "match value for {field:?} must be a scalar, got: {other}"
                )))
            }
        };
        Ok(Self {
            field: field.to_string(),
            matcher,
        })
    }

    /// The matched substring, or `None` when the rule does not apply.
    fn apply(&self, url: &RequestUrl) -> Option<String> {
        let value = url.field(&self.field)?;
        match &self.matcher {
            Matcher::Literal(expected) => (value == expected).then(|| expected.clone()),
            Matcher::Pattern(regex) => regex.find(value).map(|m| m.as_str().to_string()),
        }
    }
}

/// The per-request bundle handed to a route's execute operation.
pub struct RequestContext {
    pub request: Request<Body>,
    pub url: RequestUrl,
    pub matched: MatchResult,
    pub peer: SocketAddr,
}

/// A component that matches incoming requests and executes a forwarding,
/// serving or redirecting action.
#[async_trait]
pub trait Route: Send + Sync {
    /// Evaluate the compiled match conditions against a normalized URL.
    fn is_match(&self, url: &RequestUrl) -> Option<MatchResult>;

    fn logger(&self) -> Option<Arc<Logger>>;

    fn rate_limit(&self) -> Option<Arc<RateLimit>>;

    /// Process a matched request. Must never panic the worker; failures
    /// turn into error responses.
    async fn execute(&self, ctx: RequestContext) -> Response;
}

/// Shared state of every route variant: compiled rules plus the optional
/// logger / rate-limiter references.
#[derive(Default)]
pub struct RouteBase {
    rules: Vec<MatchRule>,
    logger_id: Option<String>,
    rate_limit_id: Option<String>,
    logger: OnceLock<Arc<Logger>>,
    rate_limit: OnceLock<Arc<RateLimit>>,
}

impl RouteBase {
    pub fn compile(
        matches: &serde_json::Map<String, Value>,
        logger_id: Option<String>,
        rate_limit_id: Option<String>,
    ) -> Result<Self> {
        let rules = matches
            .iter()
            .map(|(field, value)| MatchRule::compile(field, value))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            rules,
            logger_id,
            rate_limit_id,
            logger: OnceLock::new(),
            rate_limit: OnceLock::new(),
        })
    }

    /// Resolve the id references. Missing references abort startup.
    pub fn load(&self, ctx: &LoadContext<'_>) -> Result<()> {
        if let Some(id) = &self.logger_id {
            let _ = self.logger.set(ctx.registry.logger(id)?);
        }
        if let Some(id) = &self.rate_limit_id {
            let _ = self.rate_limit.set(ctx.registry.rate_limit(id)?);
        }
        Ok(())
    }

    /// All fields must match; the first mismatch short-circuits.
    pub fn is_match(&self, url: &RequestUrl) -> Option<MatchResult> {
        let mut result = MatchResult::with_capacity(self.rules.len());
        for rule in &self.rules {
            let matched = rule.apply(url)?;
            result.insert(rule.field.clone(), matched);
        }
        Some(result)
    }

    pub fn logger(&self) -> Option<Arc<Logger>> {
        self.logger.get().cloned()
    }

    pub fn rate_limit(&self) -> Option<Arc<RateLimit>> {
        self.rate_limit.get().cloned()
    }
}

/// Request-time `${...}` resolution scope: URL fields, match captures,
/// request metadata and headers.
pub struct RequestVars<'a> {
    pub url: &'a RequestUrl,
    pub matched: &'a MatchResult,
    pub headers: &'a HeaderMap,
    pub peer: SocketAddr,
}

impl RequestVars<'_> {
    pub fn resolve(&self, name: &str) -> Option<String> {
        if let Some(field) = name.strip_prefix("url.") {
            return self.url.field(field).map(str::to_string);
        }
        if let Some(field) = name.strip_prefix("match.") {
            return self.matched.get(field).cloned();
        }
        if let Some(header) = name.strip_prefix("request.headers.") {
            return self
                .headers
                .get(header)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
        }
        match name {
            "request.method" => Some(self.url.method.clone()),
            "request.remoteAddress" => Some(self.peer.ip().to_string()),
            "process.pid" => Some(std::process::id().to_string()),
            _ => None,
        }
    }
}

/// `"1.1"` for `HTTP/1.1`, matching access-log conventions.
pub fn version_label(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "1.0"
    } else if version == Version::HTTP_2 {
        "2"
    } else if version == Version::HTTP_3 {
        "3"
    } else if version == Version::HTTP_09 {
        "0.9"
    } else {
        "1.1"
    }
}
