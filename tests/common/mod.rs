//! Shared utilities for integration testing.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderValue, Request};
use axum::response::{IntoResponse, Response};
use axum::Router;

use gatehouse::component::{loader, Registry, Role};
use gatehouse::config::AppConfig;
use gatehouse::server::Dispatcher;

/// Start an upstream that answers every request with a JSON echo of what
/// it received, tagged so tests can tell upstreams apart.
pub async fn start_upstream(tag: &'static str) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let app = Router::new().fallback(move |request: Request<Body>| async move {
        let echo = serde_json::json!({
            "tag": tag,
            "method": request.method().as_str(),
            "path": request
                .uri()
                .path_and_query()
                .map(|pq| pq.to_string())
                .unwrap_or_default(),
            "forwardedFor": header(&request, "x-forwarded-for"),
            "requestId": header(&request, "x-request-id"),
            "userAgent": header(&request, "user-agent"),
        });
        let mut response = echo.to_string().into_response();
        response
            .headers_mut()
            .insert("x-upstream-tag", HeaderValue::from_static(tag));
        response
    });

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn header(request: &Request<Body>, name: &str) -> Option<String> {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Load an `app` section of component blocks and serve its route list on
/// an ephemeral port. Returns the gateway address.
pub async fn start_gateway(section: serde_json::Value) -> SocketAddr {
    let config = AppConfig::from_value(serde_json::json!({ "app": section })).unwrap();

    let mut registry = Registry::builtin();
    loader::construct_and_load(
        &mut registry,
        config.section("app").unwrap(),
        None,
        &Role::Main,
    )
    .unwrap();
    let dispatcher = Arc::new(Dispatcher::new(registry.routes(), "http"));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new()
        .fallback(dispatch)
        .with_state(dispatcher);
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

async fn dispatch(
    State(dispatcher): State<Arc<Dispatcher>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    dispatcher.dispatch(peer, request).await
}

/// An HTTP client that follows nothing and trusts the test.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}
