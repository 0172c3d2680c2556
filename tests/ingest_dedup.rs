// tests/ingest_dedup.rs
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use channel_postgen::ingest::types::{IngestReport, SourceAdapter};
use channel_postgen::ingest::{ingest_items, run_ingestion};
use channel_postgen::models::RawItem;
use channel_postgen::Store;

fn raw(title: &str, url: Option<&str>) -> RawItem {
    RawItem {
        title: title.to_string(),
        url: url.map(str::to_string),
        summary: format!("summary of {title}"),
        source_name: "test".into(),
        published_at: Utc::now(),
        raw_text: None,
    }
}

/// Adapter returning the concatenation of fixed per-source batches.
struct FixedAdapter {
    per_source: Vec<Vec<RawItem>>,
}

#[async_trait]
impl SourceAdapter for FixedAdapter {
    async fn list_items(&self) -> Result<Vec<RawItem>> {
        Ok(self.per_source.concat())
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

#[tokio::test]
async fn three_sources_with_one_known_url() {
    let store = Store::in_memory().await.unwrap();
    ingest_items(&store, vec![raw("Old news", Some("https://a.example/known"))])
        .await
        .unwrap();

    let first: Vec<_> = (1..=4)
        .map(|i| raw(&format!("A{i}"), Some(&format!("https://a.example/{i}"))))
        .chain(std::iter::once(raw("Renamed", Some("https://a.example/known"))))
        .collect();
    let third = vec![
        raw("C1", Some("https://c.example/1")),
        raw("C2", Some("https://c.example/2")),
    ];
    let adapter = FixedAdapter {
        per_source: vec![first, Vec::new(), third],
    };

    let report = run_ingestion(&adapter, &store).await.unwrap();
    assert_eq!(report, IngestReport { fetched: 7, added: 6 });
    assert_eq!(store.news_stats().await.unwrap().total, 7);
}

#[tokio::test]
async fn same_title_different_url_is_a_duplicate() {
    let store = Store::in_memory().await.unwrap();
    ingest_items(&store, vec![raw("Breaking", Some("https://x.example/1"))])
        .await
        .unwrap();
    let report = ingest_items(&store, vec![raw("Breaking", Some("https://y.example/2"))])
        .await
        .unwrap();
    assert_eq!(report.added, 0);
}

#[tokio::test]
async fn missing_url_dedups_on_title_only() {
    let store = Store::in_memory().await.unwrap();
    let report = ingest_items(
        &store,
        vec![raw("No link", None), raw("Other", None), raw("No link", None)],
    )
    .await
    .unwrap();
    assert_eq!(report, IngestReport { fetched: 3, added: 2 });
}

#[tokio::test]
async fn rerunning_the_same_batch_adds_nothing() {
    let store = Store::in_memory().await.unwrap();
    let batch = vec![raw("One", Some("https://o.example/1")), raw("Two", None)];
    assert_eq!(ingest_items(&store, batch.clone()).await.unwrap().added, 2);
    assert_eq!(ingest_items(&store, batch).await.unwrap().added, 0);
}

#[tokio::test]
async fn write_failure_rolls_back_whole_batch() {
    let store = Store::in_memory().await.unwrap();
    sqlx::query(
        "CREATE TRIGGER reject_poison BEFORE INSERT ON news_items \
         WHEN NEW.title = 'poison' BEGIN SELECT RAISE(ABORT, 'boom'); END;",
    )
    .execute(store.pool())
    .await
    .unwrap();

    let batch = vec![
        raw("fine 1", Some("https://f.example/1")),
        raw("fine 2", Some("https://f.example/2")),
        raw("poison", Some("https://f.example/3")),
        raw("fine 3", Some("https://f.example/4")),
    ];
    let err = ingest_items(&store, batch).await.unwrap_err();
    assert!(format!("{err:#}").contains("poison"));
    assert_eq!(store.news_stats().await.unwrap().total, 0, "no partial commit");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_ingestion_runs_both_commit() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("news.db").display());
    let store = Store::connect(&url, 4).await.unwrap();

    for round in 0..5 {
        let feed: Vec<_> = (0..200)
            .map(|i| raw(&format!("feed {round}-{i}"), Some(&format!("https://f.example/{round}/{i}"))))
            .collect();
        let channel: Vec<_> = (0..200)
            .map(|i| raw(&format!("chan {round}-{i}"), Some(&format!("https://t.me/c/{round}{i}"))))
            .collect();

        let (a, b) = tokio::join!(
            ingest_items(&store, feed),
            ingest_items(&store, channel)
        );
        assert_eq!(a.unwrap().added, 200, "round {round}");
        assert_eq!(b.unwrap().added, 200, "round {round}");
    }
    assert_eq!(store.news_stats().await.unwrap().total, 2000);
}
