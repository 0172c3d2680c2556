use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use quick_xml::de::from_str;
use quick_xml::events::Event;
use serde::Deserialize;
use time::format_description::well_known::{Rfc2822, Rfc3339};
use time::OffsetDateTime;

use crate::ingest::types::SourceAdapter;
use crate::ingest::{clean_text, truncate_chars};
use crate::models::{ParserKind, RawItem};
use crate::store::Store;

/// Retrieves a feed document by URL.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String>;
}

pub struct HttpFeedFetcher {
    client: reqwest::Client,
}

impl HttpFeedFetcher {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("channel-postgen/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building feed http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        let rsp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        let rsp = rsp
            .error_for_status()
            .with_context(|| format!("GET {url}"))?;
        rsp.text().await.with_context(|| format!("reading body of {url}"))
    }
}

/// Serves documents from memory, keyed by URL. Unknown URLs fail.
#[derive(Default, Clone)]
pub struct StaticFeedFetcher {
    docs: HashMap<String, String>,
}

impl StaticFeedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_doc(mut self, url: &str, body: impl Into<String>) -> Self {
        self.docs.insert(url.to_string(), body.into());
        self
    }
}

#[async_trait]
impl FeedFetcher for StaticFeedFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        self.docs
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("no document for {url}"))
    }
}

/// Reads every active feed source from the store at call time.
pub struct FeedAdapter {
    store: Store,
    fetcher: Arc<dyn FeedFetcher>,
}

impl FeedAdapter {
    pub fn new(store: Store, fetcher: Arc<dyn FeedFetcher>) -> Self {
        Self { store, fetcher }
    }
}

#[async_trait]
impl SourceAdapter for FeedAdapter {
    async fn list_items(&self) -> Result<Vec<RawItem>> {
        let sources = self
            .store
            .active_sources(ParserKind::Feed)
            .await
            .context("loading active feed sources")?;

        let mut out = Vec::new();
        for src in sources {
            let parsed = match self.fetcher.fetch(&src.url).await {
                Ok(body) => parse_feed(&body, &src.name),
                Err(e) => Err(e),
            };
            match parsed {
                Ok(items) => {
                    tracing::debug!(source = %src.name, items = items.len(), "feed parsed");
                    out.extend(items);
                }
                Err(e) => {
                    tracing::warn!(error = ?e, source = %src.name, url = %src.url, "feed source error");
                    counter!("ingest_source_errors_total", "adapter" => "feed").increment(1);
                }
            }
        }
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "feed"
    }
}

// ---- RSS 2.0 / RSS 1.0 (RDF) ----

#[derive(Debug, Deserialize)]
struct Rss {
    channel: RssChannel,
}

#[derive(Debug, Deserialize)]
struct RssChannel {
    #[serde(rename = "item", default)]
    items: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
struct Rdf {
    #[serde(rename = "item", default)]
    items: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
struct RssItem {
    title: Option<String>,
    link: Option<String>,
    description: Option<String>,
    #[serde(rename = "content:encoded", alias = "encoded")]
    content_encoded: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    #[serde(rename = "dc:date", alias = "date")]
    dc_date: Option<String>,
}

// ---- Atom ----

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entries: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    title: Option<AtomText>,
    #[serde(rename = "link", default)]
    links: Vec<AtomLink>,
    summary: Option<AtomText>,
    content: Option<AtomText>,
    published: Option<String>,
    updated: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomText {
    #[serde(rename = "$text", default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href")]
    href: Option<String>,
    #[serde(rename = "@rel")]
    rel: Option<String>,
}

impl AtomEntry {
    fn alternate_link(&self) -> Option<String> {
        self.links
            .iter()
            .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
            .or_else(|| self.links.first())
            .and_then(|l| l.href.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedFormat {
    Rss,
    Rdf,
    Atom,
}

fn detect_format(xml: &str) -> Result<FeedFormat> {
    let mut reader = quick_xml::Reader::from_str(xml);
    loop {
        match reader.read_event().context("reading feed root element")? {
            Event::Start(e) | Event::Empty(e) => {
                return match e.local_name().as_ref() {
                    b"rss" => Ok(FeedFormat::Rss),
                    b"RDF" => Ok(FeedFormat::Rdf),
                    b"feed" => Ok(FeedFormat::Atom),
                    other => bail!(
                        "unsupported feed root element <{}>",
                        String::from_utf8_lossy(other)
                    ),
                };
            }
            Event::Eof => bail!("empty feed document"),
            _ => {}
        }
    }
}

/// Parse an RSS 2.0, RDF or Atom document into raw items tagged with
/// `source_name`. Entries with neither title nor summary are dropped.
pub fn parse_feed(xml: &str, source_name: &str) -> Result<Vec<RawItem>> {
    let t0 = std::time::Instant::now();
    let xml = scrub_html_entities_for_xml(xml);
    let now = Utc::now();

    let items: Vec<RawItem> = match detect_format(&xml)? {
        FeedFormat::Rss => {
            let rss: Rss = from_str(&xml).context("parsing rss xml")?;
            rss.channel
                .items
                .into_iter()
                .filter_map(|it| rss_item(it, source_name, now))
                .collect()
        }
        FeedFormat::Rdf => {
            let rdf: Rdf = from_str(&xml).context("parsing rdf xml")?;
            rdf.items
                .into_iter()
                .filter_map(|it| rss_item(it, source_name, now))
                .collect()
        }
        FeedFormat::Atom => {
            let feed: AtomFeed = from_str(&xml).context("parsing atom xml")?;
            feed.entries
                .into_iter()
                .filter_map(|e| atom_entry(e, source_name, now))
                .collect()
        }
    };

    histogram!("ingest_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
    Ok(items)
}

fn rss_item(it: RssItem, source_name: &str, now: DateTime<Utc>) -> Option<RawItem> {
    let summary_src = it
        .description
        .filter(|d| !d.trim().is_empty())
        .or(it.content_encoded);
    let date = it.pub_date.or(it.dc_date);
    build_item(
        it.title.as_deref(),
        it.link,
        summary_src.as_deref(),
        date.as_deref(),
        source_name,
        now,
    )
}

fn atom_entry(e: AtomEntry, source_name: &str, now: DateTime<Utc>) -> Option<RawItem> {
    let link = e.alternate_link();
    let summary_src = e
        .summary
        .map(|t| t.value)
        .filter(|s| !s.trim().is_empty())
        .or(e.content.map(|t| t.value));
    let date = e.published.or(e.updated);
    build_item(
        e.title.as_ref().map(|t| t.value.as_str()),
        link,
        summary_src.as_deref(),
        date.as_deref(),
        source_name,
        now,
    )
}

fn build_item(
    title: Option<&str>,
    link: Option<String>,
    summary: Option<&str>,
    date: Option<&str>,
    source_name: &str,
    now: DateTime<Utc>,
) -> Option<RawItem> {
    let title = title.map(clean_text).unwrap_or_default();
    let summary = summary.map(clean_text).unwrap_or_default();
    if title.is_empty() && summary.is_empty() {
        return None;
    }
    // Title-less entries still need a dedup key.
    let title = if title.is_empty() {
        truncate_chars(&summary, 80)
    } else {
        title
    };
    let url = link
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty());

    Some(RawItem {
        title,
        url,
        summary,
        source_name: source_name.to_string(),
        published_at: date.and_then(parse_feed_date).unwrap_or(now),
        raw_text: None,
    })
}

/// RFC 2822 (RSS) or RFC 3339 (Atom, dc:date).
pub fn parse_feed_date(ts: &str) -> Option<DateTime<Utc>> {
    let ts = ts.trim();
    let odt = OffsetDateTime::parse(ts, &Rfc2822)
        .or_else(|_| OffsetDateTime::parse(ts, &Rfc3339))
        .ok();
    if let Some(odt) = odt {
        return DateTime::<Utc>::from_timestamp(odt.unix_timestamp(), odt.nanosecond());
    }
    // Named zones ("GMT", "EST") that `time` rejects.
    DateTime::parse_from_rfc2822(ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// HTML entities that are not valid XML and show up in real feeds.
fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", "\u{00A0}")
        .replace("&ndash;", "\u{2013}")
        .replace("&mdash;", "\u{2014}")
        .replace("&laquo;", "\u{00AB}")
        .replace("&raquo;", "\u{00BB}")
        .replace("&hellip;", "\u{2026}")
        .replace("&ldquo;", "\u{201C}")
        .replace("&rdquo;", "\u{201D}")
        .replace("&lsquo;", "\u{2018}")
        .replace("&rsquo;", "\u{2019}")
}
