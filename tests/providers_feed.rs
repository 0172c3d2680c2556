// tests/providers_feed.rs
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use channel_postgen::ingest::providers::feed::parse_feed;
use channel_postgen::ingest::providers::{FeedAdapter, StaticFeedFetcher};
use channel_postgen::ingest::types::SourceAdapter;
use channel_postgen::models::{NewSource, ParserKind};
use channel_postgen::Store;

const HABR_XML: &str = include_str!("fixtures/habr_rss.xml");
const ATOM_XML: &str = include_str!("fixtures/blog_atom.xml");
const RDF_XML: &str = include_str!("fixtures/news_rdf.xml");

#[test]
fn rss_fixture_maps_title_link_summary_and_date() {
    let items = parse_feed(HABR_XML, "Habr").expect("rss parse ok");
    assert_eq!(items.len(), 3);

    let first = &items[0];
    assert_eq!(first.title, "Rust 1.80 stabilizes LazyCell & LazyLock");
    assert_eq!(first.url.as_deref(), Some("https://habr.com/ru/articles/800001/"));
    assert_eq!(first.summary, "The new release brings lazy statics to std.");
    assert_eq!(first.source_name, "Habr");
    assert_eq!(
        first.published_at,
        Utc.with_ymd_and_hms(2024, 7, 25, 10, 0, 0).unwrap()
    );
    assert!(first.raw_text.is_none());
}

#[test]
fn rss_empty_description_falls_back_to_content_encoded() {
    let items = parse_feed(HABR_XML, "Habr").unwrap();
    assert_eq!(items[1].summary, "The most deployed database keeps going.");
    assert_eq!(
        items[1].published_at,
        Utc.with_ymd_and_hms(2024, 7, 26, 5, 30, 0).unwrap()
    );
}

#[test]
fn rss_html_entities_and_bad_dates_are_tolerated() {
    let before = Utc::now();
    let items = parse_feed(HABR_XML, "Habr").unwrap();
    let third = &items[2];
    assert_eq!(third.summary, "Roadmap «draft» published…");
    assert!(third.published_at >= before, "unparsable date falls back to now");
}

#[test]
fn atom_fixture_uses_alternate_link_and_published_date() {
    let items = parse_feed(ATOM_XML, "Example").expect("atom parse ok");
    assert_eq!(items.len(), 2);

    assert_eq!(items[0].title, "Zero-copy parsing & you");
    assert_eq!(
        items[0].url.as_deref(),
        Some("https://blog.example.com/posts/zero-copy")
    );
    assert_eq!(items[0].summary, "Borrowing from the input buffer.");
    assert_eq!(
        items[0].published_at,
        Utc.with_ymd_and_hms(2024, 7, 25, 7, 0, 0).unwrap()
    );

    assert_eq!(items[1].summary, "Full body of the post.");
    assert_eq!(
        items[1].published_at,
        Utc.with_ymd_and_hms(2024, 7, 24, 18, 15, 0).unwrap()
    );
}

#[test]
fn rdf_fixture_reads_top_level_items() {
    let items = parse_feed(RDF_XML, "Example News").expect("rdf parse ok");
    let titles: Vec<_> = items.iter().map(|i| i.title.as_str()).collect();
    assert_eq!(titles, vec!["First RDF item", "Second RDF item"]);
    assert_eq!(
        items[0].published_at,
        Utc.with_ymd_and_hms(2024, 7, 20, 10, 0, 0).unwrap()
    );
}

async fn store_with_sources(defs: &[(&str, &str, bool)]) -> Store {
    let store = Store::in_memory().await.unwrap();
    for (name, url, active) in defs {
        store
            .create_source(&NewSource {
                name: (*name).into(),
                url: (*url).into(),
                is_active: *active,
                parser: ParserKind::Feed,
            })
            .await
            .unwrap();
    }
    store
}

#[tokio::test]
async fn broken_source_is_skipped_and_others_still_parsed() {
    let store = store_with_sources(&[
        ("Habr", "https://habr.example/rss", true),
        ("Broken", "https://broken.example/rss", true),
        ("Blog", "https://blog.example/atom", true),
    ])
    .await;
    let fetcher = StaticFeedFetcher::new()
        .with_doc("https://habr.example/rss", HABR_XML)
        .with_doc("https://broken.example/rss", "<rss><channel><item><title>oops")
        .with_doc("https://blog.example/atom", ATOM_XML);

    let adapter = FeedAdapter::new(store, Arc::new(fetcher));
    let items = adapter.list_items().await.expect("adapter never fails on a bad source");
    assert_eq!(items.len(), 5);
    assert!(items[..3].iter().all(|i| i.source_name == "Habr"));
    assert!(items[3..].iter().all(|i| i.source_name == "Blog"));
}

#[tokio::test]
async fn inactive_and_unreachable_sources_contribute_nothing() {
    let store = store_with_sources(&[
        ("Disabled", "https://habr.example/rss", false),
        ("Unreachable", "https://nowhere.example/rss", true),
    ])
    .await;
    let fetcher = StaticFeedFetcher::new().with_doc("https://habr.example/rss", HABR_XML);

    let adapter = FeedAdapter::new(store, Arc::new(fetcher));
    let items = adapter.list_items().await.unwrap();
    assert!(items.is_empty());
}
