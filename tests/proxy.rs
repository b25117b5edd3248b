//! End-to-end scenarios over real sockets: forwarding, redirects,
//! balancing, rate limiting and the no-route answer.

mod common;

use axum::http::StatusCode;

#[tokio::test]
async fn single_upstream_forwards_method_path_and_headers() {
    let upstream = common::start_upstream("api").await;
    let gateway = common::start_gateway(serde_json::json!([
        {
            "namespace": "route.proxy",
            "match": {"pathname": "/api"},
            "server": format!("http://{upstream}")
        }
    ]))
    .await;

    let response = common::client()
        .get(format!("http://{gateway}/api/users?limit=3"))
        .header("user-agent", "gatehouse-test/1")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-upstream-tag"], "api");

    let echo: serde_json::Value = response.json().await.unwrap();
    assert_eq!(echo["method"], "GET");
    assert_eq!(echo["path"], "/api/users?limit=3");
    assert_eq!(echo["userAgent"], "gatehouse-test/1");
    // The peer is loopback with no inbound forwarding header, so its own
    // address is recorded.
    assert_eq!(echo["forwardedFor"], "127.0.0.1");
    assert!(echo["requestId"].as_str().is_some_and(|id| !id.is_empty()));
}

#[tokio::test]
async fn post_bodies_stream_through_verbatim() {
    let upstream_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = upstream_listener.local_addr().unwrap();
    let app = axum::Router::new().fallback(|body: String| async move { format!("got:{body}") });
    tokio::spawn(async move {
        axum::serve(upstream_listener, app).await.unwrap();
    });

    let gateway = common::start_gateway(serde_json::json!([
        {"namespace": "route.proxy", "server": format!("http://{upstream}")}
    ]))
    .await;

    let response = common::client()
        .post(format!("http://{gateway}/submit"))
        .body("payload-123")
        .send()
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "got:payload-123");
}

#[tokio::test]
async fn http_requests_redirect_to_https_with_the_original_path() {
    let gateway = common::start_gateway(serde_json::json!([
        {
            "namespace": "route.redirect",
            "match": {"protocol": "http:"},
            "url": "https://${url.hostname}${url.pathname}",
            "statusCode": 307
        }
    ]))
    .await;

    let response = common::client()
        .get(format!("http://{gateway}/x"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        response.headers()["location"],
        "https://127.0.0.1/x"
    );
}

#[tokio::test]
async fn unroutable_requests_get_an_empty_404() {
    let gateway = common::start_gateway(serde_json::json!([
        {
            "namespace": "route.redirect",
            "match": {"pathname": "/only-this"},
            "url": "https://elsewhere.test/"
        }
    ]))
    .await;

    let response = common::client()
        .get(format!("http://{gateway}/unknown"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.text().await.unwrap().is_empty());
}

#[tokio::test]
async fn balanced_routes_rotate_across_upstreams() {
    let first = common::start_upstream("one").await;
    let second = common::start_upstream("two").await;
    let gateway = common::start_gateway(serde_json::json!([
        {
            "namespace": "balancer.round-robin",
            "id": "pool",
            "upstream": [format!("http://{first}"), format!("http://{second}")]
        },
        {
            "namespace": "route.proxy",
            "balancerId": "pool"
        }
    ]))
    .await;

    let client = common::client();
    let mut tags = Vec::new();
    for _ in 0..4 {
        let response = client
            .get(format!("http://{gateway}/"))
            .send()
            .await
            .unwrap();
        tags.push(response.headers()["x-upstream-tag"].to_str().unwrap().to_string());
    }
    assert_eq!(tags, vec!["one", "two", "one", "two"]);
}

#[tokio::test]
async fn the_fourth_request_in_a_window_is_rejected() {
    let upstream = common::start_upstream("limited").await;
    let gateway = common::start_gateway(serde_json::json!([
        {"namespace": "store.memory", "id": "window-store"},
        {
            "namespace": "rate-limit",
            "id": "limiter",
            "storeId": "window-store",
            "max": 3,
            "windowMs": 60000
        },
        {
            "namespace": "route.proxy",
            "rateLimitId": "limiter",
            "server": format!("http://{upstream}")
        }
    ]))
    .await;

    let client = common::client();
    for i in 1..=3 {
        let response = client
            .get(format!("http://{gateway}/"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "request {i} should pass");
        assert!(response.headers().contains_key("ratelimit-remaining"));
    }

    let response = client
        .get(format!("http://{gateway}/"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["ratelimit-remaining"], "0");
    assert!(response.headers().contains_key("retry-after"));
    assert_eq!(
        response.text().await.unwrap(),
        "Too many requests, please try again later."
    );
}

#[tokio::test]
async fn upstream_refusal_becomes_service_unavailable() {
    // Bind then drop, so the port is very likely unbound.
    let dead = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let gateway = common::start_gateway(serde_json::json!([
        {"namespace": "route.proxy", "server": format!("http://{dead}")}
    ]))
    .await;

    let response = common::client()
        .get(format!("http://{gateway}/"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn upgrades_are_refused_unless_the_route_allows_them() {
    use axum::body::Body;
    use axum::http::Request;
    use gatehouse::component::{loader, Registry, Role};
    use gatehouse::config::AppConfig;
    use gatehouse::server::Dispatcher;
    use std::sync::Arc;

    let config = AppConfig::from_value(serde_json::json!({
        "app": [
            {"namespace": "route.proxy", "server": "http://127.0.0.1:1", "upgrades": false}
        ]
    }))
    .unwrap();
    let mut registry = Registry::builtin();
    loader::construct_and_load(
        &mut registry,
        config.section("app").unwrap(),
        None,
        &Role::Main,
    )
    .unwrap();
    let dispatcher = Arc::new(Dispatcher::new(registry.routes(), "http"));

    let request = Request::builder()
        .method("GET")
        .uri("http://gateway.test/socket")
        .header("host", "gateway.test")
        .header("connection", "Upgrade")
        .header("upgrade", "websocket")
        .body(Body::empty())
        .unwrap();
    let response = dispatcher
        .dispatch("127.0.0.1:5000".parse().unwrap(), request)
        .await;
    assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
}
