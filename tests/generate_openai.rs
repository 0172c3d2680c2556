// tests/generate_openai.rs
//
// OpenAiGenerator against a fake chat-completions endpoint on a loopback port.

use std::sync::{Arc, Mutex};

use axum::{extract::State, routing::post, Json, Router};
use chrono::Utc;
use serde_json::{json, Value};

use channel_postgen::config::AiConfig;
use channel_postgen::generate::{run_generation, ContentGenerator, OpenAiGenerator};
use channel_postgen::ingest::ingest_items;
use channel_postgen::models::RawItem;
use channel_postgen::retry::RetryPolicy;
use channel_postgen::Store;

#[derive(Clone)]
struct Completions {
    reply: Arc<Mutex<String>>,
}

async fn complete(State(c): State<Completions>, Json(_req): Json<Value>) -> Json<Value> {
    let content = c.reply.lock().unwrap().clone();
    Json(json!({ "choices": [{ "message": { "role": "assistant", "content": content } }] }))
}

async fn spawn_endpoint(reply: &str) -> (String, Completions) {
    let state = Completions {
        reply: Arc::new(Mutex::new(reply.to_string())),
    };
    let app = Router::new()
        .route("/v1/chat/completions", post(complete))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/v1"), state)
}

fn generator(base_url: String) -> ContentGenerator {
    let cfg = AiConfig {
        api_key: "sk-test".into(),
        base_url,
        timeout_secs: 5,
        ..AiConfig::default()
    };
    ContentGenerator::new(Arc::new(OpenAiGenerator::from_config(&cfg).unwrap()))
}

async fn store_with_one_item() -> Store {
    let store = Store::in_memory().await.unwrap();
    ingest_items(
        &store,
        vec![RawItem {
            title: "Rates held".into(),
            url: Some("https://n.example/rates".into()),
            summary: "The central bank kept rates unchanged.".into(),
            source_name: "test".into(),
            published_at: Utc::now(),
            raw_text: None,
        }],
    )
    .await
    .unwrap();
    store
}

#[tokio::test]
async fn blank_completion_is_a_failed_attempt_not_an_empty_post() {
    let (base, endpoint) = spawn_endpoint("   ").await;
    let store = store_with_one_item().await;
    let generator = generator(base);
    let policy = RetryPolicy::immediate();

    let report = run_generation(&store, &generator, &policy, None).await.unwrap();
    assert_eq!(report.created, 0);
    assert_eq!(report.failed, 1);
    assert_eq!(store.post_stats().await.unwrap().total, 0);
    assert_eq!(store.news_stats().await.unwrap().unprocessed, 1);

    // Once the backend answers, the same item gets its post.
    *endpoint.reply.lock().unwrap() = "Rates held\n\nNo change this month.".into();
    let report = run_generation(&store, &generator, &policy, None).await.unwrap();
    assert_eq!(report.created, 1);
    assert_eq!(store.news_stats().await.unwrap().unprocessed, 0);
}
