// tests/api_http.rs
//
// HTTP-level tests for the operator Router without opening sockets.
// The router is exercised directly via tower::ServiceExt::oneshot.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tower::ServiceExt as _; // for `oneshot`

use channel_postgen::api::{self, AppState};
use channel_postgen::config::GenerationConfig;
use channel_postgen::ingest::ingest_items;
use channel_postgen::ingest::providers::StaticFeedFetcher;
use channel_postgen::metrics::Metrics;
use channel_postgen::models::{NewSource, ParserKind, RawItem};
use channel_postgen::publish::PublishSettings;
use channel_postgen::retry::RetryPolicy;
use channel_postgen::transport::memory::InMemoryConnector;
use channel_postgen::{Pipeline, Store, WorkerPool};

const BODY_LIMIT: usize = 1024 * 1024;

const FEED: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Feed</title>
  <item><title>Alpha</title><link>https://feed.example/a</link><description>first</description></item>
</channel></rss>"#;

struct Harness {
    app: Router,
    store: Store,
    connector: InMemoryConnector,
}

async fn harness() -> Harness {
    let store = Store::in_memory().await.unwrap();
    store
        .create_source(&NewSource {
            name: "Feed".into(),
            url: "https://feed.example/rss".into(),
            is_active: true,
            parser: ParserKind::Feed,
        })
        .await
        .unwrap();
    let connector = InMemoryConnector::new();
    let pipeline = Arc::new(Pipeline {
        store: store.clone(),
        connector: Arc::new(connector.clone()),
        fetcher: Arc::new(StaticFeedFetcher::new().with_doc("https://feed.example/rss", FEED)),
        generator: None,
        generation: GenerationConfig::default(),
        publish: PublishSettings {
            outbound_channel: "@out".into(),
            max_batch_size: 5,
            claim_ttl: Duration::from_secs(3600),
            retry: RetryPolicy::immediate(),
        },
        channel_recent_limit: 15,
    });
    let pool = Arc::new(WorkerPool::start(pipeline.registry(), 2));
    let app = api::router(
        AppState {
            store: store.clone(),
            pool,
        },
        &Metrics::detached(),
    );
    Harness {
        app,
        store,
        connector,
    }
}

async fn seed_draft(store: &Store, title: &str) {
    ingest_items(
        store,
        vec![RawItem {
            title: title.into(),
            url: None,
            summary: "s".into(),
            source_name: "test".into(),
            published_at: Utc::now(),
            raw_text: None,
        }],
    )
    .await
    .unwrap();
    let item = store
        .list_news_items(0, 100)
        .await
        .unwrap()
        .into_iter()
        .find(|n| n.title == title)
        .unwrap();
    store
        .create_draft_post(item.id, title, "body")
        .await
        .unwrap()
        .unwrap();
}

async fn call(app: &Router, method: &str, uri: &str, body: Body) -> (StatusCode, Vec<u8>) {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .expect("build request");
    let resp = app.clone().oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body")
        .to_vec();
    (status, bytes)
}

async fn call_json(app: &Router, method: &str, uri: &str, body: Body) -> (StatusCode, Value) {
    let (status, bytes) = call(app, method, uri, body).await;
    (status, serde_json::from_slice(&bytes).expect("json body"))
}

#[tokio::test]
async fn health_returns_ok() {
    let h = harness().await;
    let (status, body) = call(&h.app, "GET", "/health", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"ok");
}

#[tokio::test]
async fn stats_counts_news_and_posts() {
    let h = harness().await;
    seed_draft(&h.store, "One").await;
    let (status, v) = call_json(&h.app, "GET", "/stats", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["news"]["total"], json!(1));
    assert_eq!(v["news"]["processed"], json!(1));
    assert_eq!(v["posts"]["draft"], json!(1));
    assert_eq!(v["posts"]["published"], json!(0));
}

#[tokio::test]
async fn publish_endpoint_sends_drafts_and_reports() {
    let h = harness().await;
    seed_draft(&h.store, "One").await;
    seed_draft(&h.store, "Two").await;

    let (status, v) = call_json(&h.app, "POST", "/posts/publish?limit=1", Body::empty()).await;
    assert_eq!(status, StatusCode::OK, "{v}");
    assert_eq!(v["published"], json!(1));
    assert_eq!(h.connector.sent().len(), 1);

    let (_, posts) = call_json(&h.app, "GET", "/posts?status=published", Body::empty()).await;
    assert_eq!(posts.as_array().unwrap().len(), 1);
    let (_, drafts) = call_json(&h.app, "GET", "/posts", Body::empty()).await;
    assert_eq!(drafts.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn publish_with_revoked_session_is_a_server_error() {
    let h = harness().await;
    seed_draft(&h.store, "One").await;
    h.connector.set_authorized(false);

    let (status, v) = call_json(&h.app, "POST", "/posts/publish", Body::empty()).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(v["error"].as_str().unwrap().contains("not authorized"));
    assert_eq!(h.store.post_stats().await.unwrap().draft, 1);
}

#[tokio::test]
async fn bad_post_status_is_rejected() {
    let h = harness().await;
    let (status, v) = call_json(&h.app, "GET", "/posts?status=lost", Body::empty()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(v.get("error").is_some());
}

#[tokio::test]
async fn unknown_task_is_404() {
    let h = harness().await;
    let (status, v) = call_json(&h.app, "POST", "/tasks/nope", Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(v["error"], json!("unknown task: nope"));
}

#[tokio::test]
async fn task_can_be_awaited_or_queued() {
    let h = harness().await;
    let (status, v) =
        call_json(&h.app, "POST", "/tasks/ingest_feeds?wait=true", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["task"], json!("ingest_feeds"));
    assert_eq!(v["result"], json!({ "fetched": 1, "added": 1 }));

    let (status, v) = call_json(
        &h.app,
        "POST",
        "/tasks/publish_drafts",
        Body::from(json!({ "limit": 2 }).to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(v["status"], json!("queued"));
    assert!(v["id"].is_string());
}

#[tokio::test]
async fn malformed_task_body_is_400() {
    let h = harness().await;
    let (status, _) =
        call_json(&h.app, "POST", "/tasks/ingest_feeds", Body::from("{not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn task_and_source_listings() {
    let h = harness().await;
    let (_, tasks) = call_json(&h.app, "GET", "/tasks", Body::empty()).await;
    let names: Vec<_> = tasks
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t.as_str().unwrap().to_string())
        .collect();
    assert!(names.contains(&"publish_drafts".to_string()));
    assert_eq!(names.len(), 5);

    let (_, sources) = call_json(&h.app, "GET", "/sources", Body::empty()).await;
    assert_eq!(sources[0]["name"], json!("Feed"));
    assert_eq!(sources[0]["parser"], json!("feed"));
}

#[tokio::test]
async fn metrics_endpoint_is_mounted() {
    let h = harness().await;
    let (status, _) = call(&h.app, "GET", "/metrics", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
}
