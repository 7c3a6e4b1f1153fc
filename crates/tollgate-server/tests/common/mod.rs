#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::post;
use axum::{Json, Router};
use http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;
use url::Url;

use tollgate_server::config::{Config, Policy, RelayEndpoint, RunEnv};
use tollgate_server::context::AppContext;
use tollgate_server::notify::NotificationHub;
use tollgate_server::paths::SitePaths;
use tollgate_server::store::{FileRow, SiteStore};

// BIP32 test vector 1 master public key.
pub const XPUB: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";

pub const RULES: &str = r#"{
    "/posts/*": { "outputs": [{ "amount": 100, "description": "article" }] },
    "/album/*": { "outputs": [{ "amount": 100 }, { "amount": 50, "description": "tip" }] }
}"#;

pub fn relay(name: &str, url: &str) -> RelayEndpoint {
    RelayEndpoint {
        name: name.to_string(),
        url: Url::parse(url).unwrap(),
        extra_headers: HashMap::new(),
    }
}

/// Publish a minimal site into `dir` and open a worker context over it.
pub fn open_site(dir: &TempDir, relays: Vec<RelayEndpoint>, policy: Policy) -> Arc<AppContext> {
    let paths = SitePaths::new(dir.path());
    paths.ensure_dirs().unwrap();
    std::fs::write(paths.file("paywalls.json"), RULES).unwrap();

    {
        let site = SiteStore::open(&paths.site_db()).unwrap();
        site.config_set(&[("$.config.masterPubKey", XPUB)]).unwrap();
        site.upsert_file(&FileRow {
            url_path: "/paywalls.json".into(),
            hash: String::new(),
            size: RULES.len() as u64,
            storage_path: "paywalls.json".into(),
            mime_type: "application/json".into(),
        })
        .unwrap();
    }

    let config = Config {
        listen: "127.0.0.1:0".parse().unwrap(),
        domain: "example.test".into(),
        site_dir: dir.path().to_path_buf(),
        network: "bitcoin".into(),
        env: RunEnv::Dev,
        worker_id: 0,
        relays,
        policy,
    };

    AppContext::open(config, Arc::new(NotificationHub::new())).unwrap()
}

/// Serve a stub relay answering every submission with `payload`.
pub async fn spawn_relay(payload: &'static str) -> SocketAddr {
    let app = Router::new().route(
        "/tx",
        post(move || async move { Json(serde_json::json!({ "payload": payload })) }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

pub async fn request_json(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(axum::body::Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, value)
}
