//! Per-request dispatch pipeline.
//!
//! For one request the stages run strictly in order: match, rate-limit,
//! execute, then the access-log notification. Different requests
//! interleave freely. A rate-limit rejection is the final response and the
//! route never runs; an unroutable request gets an empty response.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;

use crate::logger::AccessRecord;
use crate::routes::{version_label, MatchResult, RequestContext, RequestUrl, Route};

/// The ordered route list bound to one listener.
pub struct Dispatcher {
    routes: Vec<Arc<dyn Route>>,
    scheme: &'static str,
}

impl Dispatcher {
    pub fn new(routes: Vec<Arc<dyn Route>>, scheme: &'static str) -> Self {
        Self { routes, scheme }
    }

    /// First route whose predicate succeeds, in configuration order.
    pub fn match_route(&self, url: &RequestUrl) -> Option<(Arc<dyn Route>, MatchResult)> {
        self.routes
            .iter()
            .find_map(|route| route.is_match(url).map(|m| (route.clone(), m)))
    }

    pub async fn dispatch(&self, peer: SocketAddr, request: Request<Body>) -> Response {
        let url = RequestUrl::from_request(self.scheme, &request);

        let Some((route, matched)) = self.match_route(&url) else {
            tracing::debug!(href = %url.href, "no route matched");
            return StatusCode::NOT_FOUND.into_response();
        };

        // Rate limit before the route runs; a rejection is already the
        // complete response.
        let mut limit_headers = HeaderMap::new();
        if let Some(limiter) = route.rate_limit() {
            let decision = limiter.check(&peer.ip().to_string()).await;
            limit_headers = decision.headers;
            if let Some(mut rejection) = decision.rejection {
                tracing::debug!(peer = %peer, href = %url.href, "rate limit exceeded");
                merge_headers(rejection.headers_mut(), &limit_headers);
                return rejection;
            }
        }

        let logger = route.logger();
        let log_seed = logger.as_ref().map(|_| {
            (
                url.clone(),
                request.headers().clone(),
                version_label(request.version()),
                Utc::now(),
            )
        });

        let ctx = RequestContext {
            request,
            url,
            matched,
            peer,
        };
        let mut response = route.execute(ctx).await;
        merge_headers(response.headers_mut(), &limit_headers);

        if let (Some(logger), Some((url, request_headers, http_version, time))) =
            (logger, log_seed)
        {
            logger.log(AccessRecord {
                url,
                peer,
                http_version,
                status: response.status().as_u16(),
                request_headers,
                response_headers: response.headers().clone(),
                time,
            });
        }

        response
    }
}

fn merge_headers(target: &mut HeaderMap, extra: &HeaderMap) {
    for (name, value) in extra {
        target.insert(name.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Arc;

    use crate::limiter::RateLimit;
    use crate::logger::Logger;
    use crate::routes::RouteBase;

    struct TagRoute {
        base: RouteBase,
        tag: &'static str,
    }

    impl TagRoute {
        fn new(matches: Value, tag: &'static str) -> Arc<Self> {
            let map = match matches {
                Value::Object(map) => map,
                _ => panic!("expected object"),
            };
            Arc::new(Self {
                base: RouteBase::compile(&map, None, None).unwrap(),
                tag,
            })
        }
    }

    #[async_trait]
    impl Route for TagRoute {
        fn is_match(&self, url: &RequestUrl) -> Option<MatchResult> {
            self.base.is_match(url)
        }
        fn logger(&self) -> Option<Arc<Logger>> {
            None
        }
        fn rate_limit(&self) -> Option<Arc<RateLimit>> {
            None
        }
        async fn execute(&self, _ctx: RequestContext) -> Response {
            self.tag.to_string().into_response()
        }
    }

    fn request(href: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(href)
            .header("host", url::Url::parse(href).unwrap().authority())
            .body(Body::empty())
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn first_matching_route_wins_in_configuration_order() {
        let dispatcher = Dispatcher::new(
            vec![
                TagRoute::new(serde_json::json!({"pathname": "///api"}), "api"),
                TagRoute::new(serde_json::json!({}), "catch-all"),
            ],
            "http",
        );
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let response = dispatcher
            .dispatch(peer, request("http://h.test/api/users"))
            .await;
        assert_eq!(body_text(response).await, "api");

        let response = dispatcher
            .dispatch(peer, request("http://h.test/other"))
            .await;
        assert_eq!(body_text(response).await, "catch-all");
    }

    #[tokio::test]
    async fn unroutable_requests_get_an_empty_not_found() {
        let dispatcher = Dispatcher::new(
            vec![TagRoute::new(serde_json::json!({"pathname": "/only"}), "only")],
            "http",
        );
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let response = dispatcher
            .dispatch(peer, request("http://h.test/elsewhere"))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_text(response).await.is_empty());
    }
}
