//! Admin router tests, driven in-process with tower's `oneshot`.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use tower::util::ServiceExt;

use common::{start_proxy, test_config, FakeRedis};
use redis_proxy::proxy::{admin, ProxyState, StaticConfigLoader};

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn cmd_request(cmd: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/cmd/")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(format!("cmd={}", cmd)))
        .unwrap()
}

#[tokio::test]
async fn test_info_json_masks_passwords() {
    let srv = FakeRedis::start("fake").await;
    let mut config = test_config(&srv.addr());
    config.uplink.pass = "uplink-secret".into();
    config.listen.pass = "client-secret".into();
    let loader = Arc::new(StaticConfigLoader::new(config));
    let mut proxy = start_proxy(loader).await;

    let app = admin::router(proxy.handle());
    let response = app
        .oneshot(Request::get("/info.json").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_string(response).await;
    assert!(body.contains("\"state_str\":\"running\""), "{}", body);
    assert!(body.contains("\"active_requests\":0"), "{}", body);
    assert!(body.contains("[removed]"), "{}", body);
    assert!(!body.contains("uplink-secret"), "{}", body);
    assert!(!body.contains("client-secret"), "{}", body);

    proxy.stop().await;
}

#[tokio::test]
async fn test_legacy_status_json_shape() {
    let srv = FakeRedis::start("fake").await;
    let loader = Arc::new(StaticConfigLoader::new(test_config(&srv.addr())));
    let mut proxy = start_proxy(loader).await;

    let app = admin::router(proxy.handle());
    let response = app
        .oneshot(Request::get("/status.json").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["stateStr"], "running");
    assert_eq!(body["activeRequests"], 0);
    assert!(body["config"].is_object());

    proxy.stop().await;
}

#[tokio::test]
async fn test_cmd_pause_and_unpause() {
    let srv = FakeRedis::start("fake").await;
    let loader = Arc::new(StaticConfigLoader::new(test_config(&srv.addr())));
    let mut proxy = start_proxy(loader).await;
    let handle = proxy.handle();

    let app = admin::router(handle.clone());

    let response = app.clone().oneshot(cmd_request("pause")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["ok"], true);
    assert!(matches!(
        handle.state().await,
        ProxyState::Pausing | ProxyState::Paused
    ));

    let response = app.clone().oneshot(cmd_request("unpause")).await.unwrap();
    let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(handle.state().await, ProxyState::Running);

    proxy.stop().await;
}

#[tokio::test]
async fn test_cmd_unknown_is_rejected() {
    let srv = FakeRedis::start("fake").await;
    let loader = Arc::new(StaticConfigLoader::new(test_config(&srv.addr())));
    let mut proxy = start_proxy(loader).await;

    let app = admin::router(proxy.handle());
    let response = app.oneshot(cmd_request("explode")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["ok"], false);
    assert!(body["error"].as_str().unwrap().contains("explode"));

    proxy.stop().await;
}

#[tokio::test]
async fn test_status_page_renders() {
    let srv = FakeRedis::start("fake").await;
    let loader = Arc::new(StaticConfigLoader::new(test_config(&srv.addr())));
    let mut proxy = start_proxy(loader).await;

    let app = admin::router(proxy.handle());
    let response = app
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("Proxy status"));
    assert!(body.contains("running"));

    proxy.stop().await;
}

#[tokio::test]
async fn test_admin_served_over_http() {
    // The admin endpoint is reachable over a real socket, not just via the
    // in-process router.
    let srv = FakeRedis::start("fake").await;
    let mut config = test_config(&srv.addr());
    config.admin.addr = "127.0.0.1:0".into();
    let loader = Arc::new(StaticConfigLoader::new(config));
    let mut proxy = start_proxy(loader).await;

    let addr = proxy.admin_addr().unwrap();
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    tokio::io::AsyncWriteExt::write_all(
        &mut stream,
        format!(
            "GET /info.json HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            addr
        )
        .as_bytes(),
    )
    .await
    .unwrap();

    let mut response = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut response)
        .await
        .unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains("\"state_str\":\"running\""), "{}", response);

    proxy.stop().await;
}
