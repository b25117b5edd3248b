//! HTTP/HTTPS proxy route.
//!
//! # Responsibilities
//! - Select an upstream (balancer or fixed single server)
//! - Substitute request references in the upstream address template
//! - Mirror method/headers/body outbound, stream the response back
//! - Tunnel WebSocket/Upgrade exchanges when the route allows them
//!
//! # Design Decisions
//! - The forwarding header only trusts a pre-existing x-forwarded-for when
//!   the immediate peer is a private/internal address; otherwise the peer
//!   address is authoritative (header spoofing)
//! - Upstream failures before the response starts answer 503 and are never
//!   fatal to the worker
//! - The tunnel is two copy loops under one task: either side closing or
//!   erroring tears down both

use std::net::IpAddr;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{request::Parts, StatusCode};
use axum::response::{IntoResponse, Response};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::Value;

use crate::balancer::{Balancer, Upstream};
use crate::component::{Block, Component, LoadContext};
use crate::config::refs;
use crate::error::{Error, Result};
use crate::limiter::RateLimit;
use crate::logger::Logger;
use crate::routes::{MatchResult, RequestContext, RequestUrl, RequestVars, Route, RouteBase};

/// Hop-by-hop headers never forwarded on a plain exchange.
const HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_REQUEST_ID: &str = "x-request-id";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProxyConfig {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "match")]
    match_: serde_json::Map<String, Value>,
    #[serde(default)]
    logger_id: Option<String>,
    #[serde(default)]
    rate_limit_id: Option<String>,
    #[serde(default)]
    balancer_id: Option<String>,
    /// Fixed upstream address template, used when no balancer is set.
    #[serde(default)]
    server: Option<String>,
    /// Allow WebSocket/Upgrade tunneling through this route.
    #[serde(default)]
    upgrades: bool,
}

pub struct HttpProxy {
    config: ProxyConfig,
    base: RouteBase,
    single: Option<Arc<Upstream>>,
    balancer: OnceLock<Arc<dyn Balancer>>,
    client: reqwest::Client,
}

impl HttpProxy {
    pub fn factory(block: &Block) -> Result<Arc<dyn Component>> {
        let config: ProxyConfig = serde_json::from_value(Value::Object(block.clone()))
            .map_err(|e| Error::Config(e.to_string()))?;
        let base = RouteBase::compile(
            &config.match_,
            config.logger_id.clone(),
            config.rate_limit_id.clone(),
        )?;

        if config.balancer_id.is_none() && config.server.is_none() {
            return Err(Error::Config(
                "route.proxy requires a server or a balancerId".into(),
            ));
        }
        let single = match (&config.balancer_id, &config.server) {
            (None, Some(server)) => Some(Arc::new(Upstream::new(server.clone(), false))),
            _ => None,
        };

        // Redirects are the client's business, not the proxy's; upstream
        // certificate validation is not enforced.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| Error::Config(format!("proxy client: {e}")))?;

        Ok(Arc::new(Self {
            config,
            base,
            single,
            balancer: OnceLock::new(),
            client,
        }))
    }

    fn select(&self) -> Option<Arc<Upstream>> {
        match self.balancer.get() {
            Some(balancer) => balancer.next(),
            None => self.single.clone(),
        }
    }

    /// Render the upstream address for this request and graft the inbound
    /// path onto bare-origin targets.
    fn target_url(&self, upstream: &Upstream, vars: &RequestVars<'_>) -> Result<url::Url> {
        let rendered = refs::replace_str(&upstream.address, &|name| vars.resolve(name));
        let mut target = url::Url::parse(&rendered)
            .map_err(|e| Error::Config(format!("upstream address {rendered:?}: {e}")))?;
        if target.path() == "/" && target.query().is_none() {
            target.set_path(&vars.url.pathname);
            if !vars.url.query.is_empty() {
                target.set_query(Some(&vars.url.query));
            }
        }
        Ok(target)
    }

    async fn proxy_plain(
        &self,
        parts: Parts,
        body: Body,
        target: url::Url,
        upstream: &Arc<Upstream>,
    ) -> Response {
        let _guard = upstream.begin();

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::CONTENT_LENGTH);

        let request = self
            .client
            .request(parts.method, target.clone())
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()));

        match request.send().await {
            Ok(outcome) => {
                let status = outcome.status();
                let mut response_headers = outcome.headers().clone();
                strip_hop_by_hop(&mut response_headers);
                let mut response = Response::new(Body::from_stream(outcome.bytes_stream()));
                *response.status_mut() = status;
                *response.headers_mut() = response_headers;
                response
            }
            Err(e) => {
                tracing::error!(upstream = %target, error = %e, "upstream request failed");
                service_unavailable()
            }
        }
    }

    async fn proxy_upgrade(
        &self,
        mut parts: Parts,
        target: url::Url,
        upstream: &Arc<Upstream>,
    ) -> Response {
        if !self.config.upgrades {
            return (
                StatusCode::NOT_ACCEPTABLE,
                "protocol upgrades are not enabled on this route",
            )
                .into_response();
        }
        let Some(client_upgrade) = parts.extensions.remove::<OnUpgrade>() else {
            tracing::warn!("upgrade requested but the connection cannot upgrade");
            return (StatusCode::NOT_ACCEPTABLE, "connection cannot upgrade").into_response();
        };

        let _guard = upstream.begin();

        // The inbound handshake headers travel verbatim; reqwest performs
        // the outbound upgrade when it sees them.
        let request = self
            .client
            .request(parts.method, target.clone())
            .headers(parts.headers);

        let outcome = match request.send().await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(upstream = %target, error = %e, "upstream upgrade failed");
                return service_unavailable();
            }
        };

        if outcome.status() != StatusCode::SWITCHING_PROTOCOLS {
            // The upstream declined; relay its answer as a plain response.
            let status = outcome.status();
            let headers = outcome.headers().clone();
            let mut response = Response::new(Body::from_stream(outcome.bytes_stream()));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            return response;
        }

        let handshake_headers = outcome.headers().clone();
        let mut upstream_io = match outcome.upgrade().await {
            Ok(io) => io,
            Err(e) => {
                tracing::error!(upstream = %target, error = %e, "upstream upgrade handshake failed");
                return service_unavailable();
            }
        };

        // Bridge both raw sockets until either side closes, then close the
        // other.
        let target_label = target.to_string();
        tokio::spawn(async move {
            match client_upgrade.await {
                Ok(client_io) => {
                    let mut client_io = TokioIo::new(client_io);
                    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
                        Ok((up, down)) => tracing::debug!(
                            upstream = %target_label,
                            bytes_up = up,
                            bytes_down = down,
                            "tunnel closed"
                        ),
                        Err(e) => tracing::debug!(
                            upstream = %target_label,
                            error = %e,
                            "tunnel aborted"
                        ),
                    }
                }
                Err(e) => tracing::error!(error = %e, "client upgrade handshake failed"),
            }
        });

        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        *response.headers_mut() = handshake_headers;
        response
    }
}

#[async_trait]
impl Route for HttpProxy {
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
        let Some(upstream) = self.select() else {
            tracing::error!(id = self.config.id.as_deref().unwrap_or("-"), "no upstream available");
            return service_unavailable();
        };

        let (mut parts, body) = ctx.request.into_parts();
        let target = {
            let vars = RequestVars {
                url: &ctx.url,
                matched: &ctx.matched,
                headers: &parts.headers,
                peer: ctx.peer,
            };
            match self.target_url(&upstream, &vars) {
                Ok(target) => target,
                Err(e) => {
                    tracing::error!(error = %e, "invalid upstream address");
                    return service_unavailable();
                }
            }
        };

        apply_forwarding_headers(&mut parts.headers, ctx.peer.ip());

        if wants_upgrade(&parts.headers) {
            self.proxy_upgrade(parts, target, &upstream).await
        } else {
            self.proxy_plain(parts, body, target, &upstream).await
        }
    }
}

#[async_trait]
impl Component for HttpProxy {
    fn namespace(&self) -> &'static str {
        "route.proxy"
    }

    fn id(&self) -> Option<&str> {
        self.config.id.as_deref()
    }

    fn load(&self, ctx: &LoadContext<'_>) -> Result<()> {
        self.base.load(ctx)?;
        if let Some(id) = &self.config.balancer_id {
            let _ = self.balancer.set(ctx.registry.balancer(id)?);
        }
        Ok(())
    }

    fn as_route(self: Arc<Self>) -> Option<Arc<dyn Route>> {
        Some(self)
    }
}

fn service_unavailable() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "upstream unavailable").into_response()
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(header::UPGRADE);
}

/// True when the request asks for a protocol upgrade.
fn wants_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);
    connection_upgrade && headers.contains_key(header::UPGRADE)
}

/// Set the forwarding headers. A pre-existing x-forwarded-for is only
/// trusted when the immediate peer is itself private/internal.
fn apply_forwarding_headers(headers: &mut HeaderMap, peer: IpAddr) {
    let forwarded = forwarded_for(headers.get(X_FORWARDED_FOR), peer);
    if let Ok(value) = HeaderValue::from_str(&forwarded) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if !headers.contains_key(X_REQUEST_ID) {
        if let Ok(value) = HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()) {
            headers.insert(X_REQUEST_ID, value);
        }
    }
}

fn forwarded_for(existing: Option<&HeaderValue>, peer: IpAddr) -> String {
    if is_internal(peer) {
        if let Some(value) = existing.and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }
    peer.to_string()
}

fn is_internal(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        // fc00::/7 unique-local plus loopback.
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_peers_overwrite_forwarded_for() {
        let existing = HeaderValue::from_static("1.2.3.4");
        let peer: IpAddr = "203.0.113.7".parse().unwrap();
        assert_eq!(forwarded_for(Some(&existing), peer), "203.0.113.7");
    }

    #[test]
    fn private_peers_keep_the_existing_header() {
        let existing = HeaderValue::from_static("198.51.100.9");
        let peer: IpAddr = "10.1.2.3".parse().unwrap();
        assert_eq!(forwarded_for(Some(&existing), peer), "198.51.100.9");
    }

    #[test]
    fn private_peers_without_header_use_their_own_address() {
        let peer: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(forwarded_for(None, peer), "127.0.0.1");
    }

    #[test]
    fn upgrade_detection_needs_both_headers() {
        let mut headers = HeaderMap::new();
        assert!(!wants_upgrade(&headers));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert!(!wants_upgrade(&headers));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        assert!(wants_upgrade(&headers));
    }

    fn proxy_from(json: Value) -> Arc<HttpProxy> {
        let block = match json {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let config: ProxyConfig =
            serde_json::from_value(Value::Object(block.clone())).unwrap();
        let base = RouteBase::compile(&config.match_, None, None).unwrap();
        let single = config
            .server
            .as_ref()
            .map(|s| Arc::new(Upstream::new(s.clone(), false)));
        Arc::new(HttpProxy {
            config,
            base,
            single,
            balancer: OnceLock::new(),
            client: reqwest::Client::new(),
        })
    }

    fn vars_for(href: &str) -> (RequestUrl, MatchResult, HeaderMap) {
        let request = axum::http::Request::builder()
            .method("GET")
            .uri(href)
            .header("host", url::Url::parse(href).unwrap().authority())
            .body(axum::body::Body::empty())
            .unwrap();
        let url = RequestUrl::from_request("http", &request);
        (url, MatchResult::new(), HeaderMap::new())
    }

    #[test]
    fn bare_origin_targets_take_the_inbound_path() {
        let proxy = proxy_from(serde_json::json!({
            "namespace": "route.proxy",
            "server": "http://127.0.0.1:9000"
        }));
        let upstream = proxy.select().unwrap();
        let (url, matched, headers) = vars_for("http://gateway.test/api/users?limit=3");
        let vars = RequestVars {
            url: &url,
            matched: &matched,
            headers: &headers,
            peer: "127.0.0.1:4000".parse().unwrap(),
        };
        let target = proxy.target_url(&upstream, &vars).unwrap();
        assert_eq!(target.as_str(), "http://127.0.0.1:9000/api/users?limit=3");
    }

    #[test]
    fn templated_targets_are_used_as_rendered() {
        let proxy = proxy_from(serde_json::json!({
            "namespace": "route.proxy",
            "server": "http://127.0.0.1:9000/v1${url.pathname}"
        }));
        let upstream = proxy.select().unwrap();
        let (url, matched, headers) = vars_for("http://gateway.test/users");
        let vars = RequestVars {
            url: &url,
            matched: &matched,
            headers: &headers,
            peer: "127.0.0.1:4000".parse().unwrap(),
        };
        let target = proxy.target_url(&upstream, &vars).unwrap();
        assert_eq!(target.as_str(), "http://127.0.0.1:9000/v1/users");
    }

    #[test]
    fn missing_server_and_balancer_fails_at_construction() {
        let block = match serde_json::json!({"namespace": "route.proxy"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        assert!(HttpProxy::factory(&block).is_err());
    }
}
