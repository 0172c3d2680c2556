// tests/generate_posts.rs
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use channel_postgen::generate::{
    run_generation, CompletionRequest, ContentGenerator, GenerationReport, TextGenerator,
};
use channel_postgen::ingest::ingest_items;
use channel_postgen::models::{PostStatus, RawItem};
use channel_postgen::retry::RetryPolicy;
use channel_postgen::Store;

/// Echoes the prompt back as "Title\n\nBody"; fails when the prompt contains FAIL.
#[derive(Default)]
struct ScriptedGenerator {
    calls: AtomicUsize,
    prompts: Mutex<Vec<CompletionRequest>>,
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.clone());
        if request.user.contains("FAIL") {
            bail!("upstream 503");
        }
        let summary = request.user.trim_start_matches("News: ");
        Ok(format!("Post about {summary}\n\n{summary} #news"))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

fn raw(title: &str, summary: &str, minutes_ago: i64) -> RawItem {
    RawItem {
        title: title.into(),
        url: None,
        summary: summary.into(),
        source_name: "test".into(),
        published_at: Utc::now() - Duration::minutes(minutes_ago),
        raw_text: None,
    }
}

async fn setup(items: Vec<RawItem>) -> (Store, Arc<ScriptedGenerator>, ContentGenerator) {
    let store = Store::in_memory().await.unwrap();
    ingest_items(&store, items).await.unwrap();
    let backend = Arc::new(ScriptedGenerator::default());
    let generator = ContentGenerator::new(backend.clone());
    (store, backend, generator)
}

#[tokio::test]
async fn each_item_gets_exactly_one_draft() {
    let (store, backend, generator) =
        setup(vec![raw("a", "alpha", 3), raw("b", "beta", 2), raw("c", "gamma", 1)]).await;
    let policy = RetryPolicy::immediate();

    let report = run_generation(&store, &generator, &policy, None).await.unwrap();
    assert_eq!(
        report,
        GenerationReport {
            selected: 3,
            created: 3,
            failed: 0,
            skipped: 0
        }
    );

    let drafts = store.posts_by_status(PostStatus::Draft, 0, 100).await.unwrap();
    assert_eq!(drafts.len(), 3);
    assert_eq!(drafts[0].title, "Post about alpha");
    assert_eq!(drafts[0].content, "alpha #news");

    let again = run_generation(&store, &generator, &policy, None).await.unwrap();
    assert_eq!(again.selected, 0);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn prompt_carries_persona_and_sampling() {
    let (store, backend, generator) = setup(vec![raw("a", "alpha", 1)]).await;
    run_generation(&store, &generator, &RetryPolicy::immediate(), None)
        .await
        .unwrap();

    let prompts = backend.prompts.lock().unwrap();
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0].user, "News: alpha");
    assert!(prompts[0].system.contains("Do not mention the source"));
    assert_eq!(prompts[0].temperature, 0.7);
    assert_eq!(prompts[0].max_tokens, 500);
}

#[tokio::test]
async fn failed_call_creates_nothing_and_is_retried_later() {
    let (store, _backend, generator) =
        setup(vec![raw("ok", "fine", 2), raw("bad", "FAIL please", 1)]).await;
    let policy = RetryPolicy::immediate();

    let report = run_generation(&store, &generator, &policy, None).await.unwrap();
    assert_eq!(report.created, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(store.news_stats().await.unwrap().unprocessed, 1);

    // No cooldown: the failed item is picked up again straight away.
    let report = run_generation(&store, &generator, &policy, None).await.unwrap();
    assert_eq!(report.selected, 1);
    assert_eq!(report.failed, 1);
}

#[tokio::test]
async fn item_inside_backoff_window_is_not_selected() {
    let (store, backend, generator) = setup(vec![raw("bad", "FAIL always", 1)]).await;
    let item_id = store.list_news_items(0, 10).await.unwrap()[0].id;

    let cooling = RetryPolicy {
        base_backoff_secs: 3600,
        max_backoff_secs: 3600,
        max_attempts: None,
    };
    run_generation(&store, &generator, &cooling, None).await.unwrap();
    assert_eq!(store.generation_attempts(item_id).await.unwrap(), 1);

    let second = run_generation(&store, &generator, &cooling, None).await.unwrap();
    assert_eq!(second.selected, 0);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn item_at_attempt_cap_is_not_selected() {
    let (store, backend, generator) = setup(vec![raw("bad", "FAIL always", 1)]).await;
    let capped = RetryPolicy {
        max_attempts: Some(2),
        ..RetryPolicy::immediate()
    };

    assert_eq!(run_generation(&store, &generator, &capped, None).await.unwrap().failed, 1);
    assert_eq!(run_generation(&store, &generator, &capped, None).await.unwrap().failed, 1);
    let third = run_generation(&store, &generator, &capped, None).await.unwrap();
    assert_eq!(third.selected, 0);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn max_items_bounds_a_run_oldest_first() {
    let (store, _backend, generator) =
        setup(vec![raw("new", "newest", 1), raw("old", "oldest", 30), raw("mid", "middle", 10)]).await;

    let report = run_generation(&store, &generator, &RetryPolicy::immediate(), Some(2))
        .await
        .unwrap();
    assert_eq!(report.created, 2);

    let drafts = store.posts_by_status(PostStatus::Draft, 0, 10).await.unwrap();
    let titles: Vec<_> = drafts.iter().map(|p| p.title.as_str()).collect();
    assert!(titles.contains(&"Post about oldest"));
    assert!(titles.contains(&"Post about middle"));
    assert!(!titles.contains(&"Post about newest"));
}
