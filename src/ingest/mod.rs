// src/ingest/mod.rs
pub mod providers;
pub mod types;

use anyhow::{Context, Result};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::OnceCell;
use tracing::{debug, error, info};

use crate::ingest::types::{IngestReport, SourceAdapter};
use crate::models::{NewsItem, RawItem};
use crate::store::Store;

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_fetched_total", "Raw items returned by adapters.");
        describe_counter!("ingest_added_total", "News items persisted after dedup.");
        describe_counter!(
            "ingest_duplicates_total",
            "Raw items skipped because URL or title already exists."
        );
        describe_counter!(
            "ingest_source_errors_total",
            "Per-source fetch/parse errors (source skipped)."
        );
        describe_counter!(
            "ingest_batch_failures_total",
            "Ingestion batches rolled back on write failure."
        );
        describe_histogram!("ingest_parse_ms", "Feed parse time in milliseconds.");
        describe_histogram!("ingest_run_ms", "Adapter fetch + ingest time in milliseconds.");
        describe_gauge!(
            "ingest_last_run_ts",
            "Unix ts when an ingestion pass last committed."
        );
    });
}

/// Decode entities, strip tags, collapse whitespace. Used for feed titles and
/// summaries; channel text is kept verbatim.
pub fn clean_text(s: &str) -> String {
    // 1) Strip HTML tags
    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)<[^>]+>").unwrap());
    let out = re_tags.replace_all(s, " ");

    // 2) HTML entity decode (after tag stripping so `&lt;b&gt;` survives as text)
    let out = html_escape::decode_html_entities(&out).to_string();

    // 3) Collapse whitespace, including decoded &nbsp;
    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"[\s\u{00A0}]+").unwrap());
    re_ws.replace_all(&out, " ").trim().to_string()
}

/// First `max` characters of `s` (char boundary safe).
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Persist every item that has no URL or title match, in one transaction.
///
/// Matches are checked against rows committed earlier and rows inserted
/// earlier in this batch. Any write failure rolls the whole batch back.
pub async fn ingest_items(store: &Store, items: Vec<RawItem>) -> Result<IngestReport> {
    ensure_metrics_described();
    let fetched = items.len();
    counter!("ingest_fetched_total").increment(fetched as u64);

    match insert_batch(store, items).await {
        Ok(added) => {
            counter!("ingest_added_total").increment(added as u64);
            counter!("ingest_duplicates_total").increment((fetched - added) as u64);
            gauge!("ingest_last_run_ts").set(chrono::Utc::now().timestamp() as f64);
            info!(fetched, added, "ingestion batch committed");
            Ok(IngestReport { fetched, added })
        }
        Err(e) => {
            counter!("ingest_batch_failures_total").increment(1);
            error!(fetched, error = %format!("{e:#}"), "ingestion batch rolled back");
            Err(e)
        }
    }
}

async fn insert_batch(store: &Store, items: Vec<RawItem>) -> Result<usize> {
    let mut tx = store.begin().await.context("begin ingestion transaction")?;
    let mut added = 0usize;
    for raw in items {
        let dup = Store::find_duplicate_in(&mut tx, raw.url.as_deref(), &raw.title)
            .await
            .context("duplicate lookup")?;
        if let Some(existing) = dup {
            debug!(%existing, title = %raw.title, "skipping duplicate");
            continue;
        }
        let item = NewsItem::from_raw(raw);
        Store::insert_news_item_in(&mut tx, &item)
            .await
            .with_context(|| format!("inserting news item {:?}", item.title))?;
        added += 1;
    }
    // Dropping `tx` on any `?` above rolls back.
    tx.commit().await.context("commit ingestion batch")?;
    Ok(added)
}

/// Pull from one adapter and ingest the result.
pub async fn run_ingestion(adapter: &dyn SourceAdapter, store: &Store) -> Result<IngestReport> {
    let t0 = std::time::Instant::now();
    let items = adapter
        .list_items()
        .await
        .with_context(|| format!("{} adapter", adapter.name()))?;
    let report = ingest_items(store, items).await?;
    histogram!("ingest_run_ms", "adapter" => adapter.name())
        .record(t0.elapsed().as_secs_f64() * 1_000.0);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_text_strips_tags_and_entities() {
        let s = "  <p>Hello,&nbsp;&nbsp;<b>world</b>!</p>\n\n ";
        assert_eq!(clean_text(s), "Hello, world !");
        assert_eq!(clean_text("a &lt;b&gt; c"), "a <b> c");
    }

    #[test]
    fn truncate_counts_chars_not_bytes() {
        let s = "Привет мир";
        assert_eq!(truncate_chars(s, 6), "Привет");
        assert_eq!(truncate_chars("short", 80), "short");
    }

    #[tokio::test]
    async fn in_batch_duplicates_are_skipped() {
        let store = Store::in_memory().await.unwrap();
        let now = chrono::Utc::now();
        let mk = |title: &str, url: Option<&str>| RawItem {
            title: title.into(),
            url: url.map(Into::into),
            summary: "s".into(),
            source_name: "src".into(),
            published_at: now,
            raw_text: None,
        };
        let items = vec![
            mk("One", Some("https://x/1")),
            mk("One", Some("https://x/2")),
            mk("Two", Some("https://x/1")),
            mk("Three", None),
        ];
        let report = ingest_items(&store, items).await.unwrap();
        assert_eq!(report, IngestReport { fetched: 4, added: 2 });
    }
}
