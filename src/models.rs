//! # Domain records
//! Persisted entities (`NewsItem`, `Post`, `NewsSource`), the adapter output
//! (`RawItem`) and the partial-update structures applied by the store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Normalized item produced by a source adapter, not yet persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawItem {
    pub title: String,
    pub url: Option<String>,
    pub summary: String,
    pub source_name: String,
    pub published_at: DateTime<Utc>,
    pub raw_text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewsItem {
    pub id: Uuid,
    pub title: String,
    pub url: Option<String>,
    pub summary: String,
    pub source: String,
    pub published_at: DateTime<Utc>,
    pub raw_text: Option<String>,
}

impl NewsItem {
    pub fn from_raw(raw: RawItem) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: raw.title,
            url: raw.url,
            summary: raw.summary,
            source: raw.source_name,
            published_at: raw.published_at,
            raw_text: raw.raw_text,
        }
    }
}

/// Lifecycle of a post.
///
/// `Claimed` is held only while a publish run owns the post; it always ends
/// in `Published`, `Failed`, or back in `Draft` when the claim is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Draft,
    Claimed,
    Published,
    Failed,
}

impl PostStatus {
    pub const ALL: [PostStatus; 4] = [
        PostStatus::Draft,
        PostStatus::Claimed,
        PostStatus::Published,
        PostStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Claimed => "claimed",
            PostStatus::Published => "published",
            PostStatus::Failed => "failed",
        }
    }

    /// Whether `self -> next` is a legal edge of the post state machine.
    pub fn can_transition_to(self, next: PostStatus) -> bool {
        use PostStatus::*;
        matches!(
            (self, next),
            (Draft, Claimed)
                | (Claimed, Published)
                | (Claimed, Failed)
                | (Claimed, Draft)
                | (Failed, Draft)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == PostStatus::Published
    }
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "draft" => Ok(PostStatus::Draft),
            "claimed" => Ok(PostStatus::Claimed),
            "published" => Ok(PostStatus::Published),
            "failed" => Ok(PostStatus::Failed),
            other => anyhow::bail!("unknown post status: {other}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Post {
    pub id: Uuid,
    pub news_item_id: Uuid,
    pub title: String,
    pub content: String,
    pub status: PostStatus,
    pub created_at: DateTime<Utc>,
    /// Publish attempts made so far (success or failure).
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Earliest time a failed-then-reset draft may be claimed again.
    pub retry_after: Option<DateTime<Utc>>,
}

impl Post {
    /// Outbound message body: title, blank line, content.
    pub fn compose_message(&self) -> String {
        format!("{}\n\n{}", self.title, self.content)
    }
}

/// How a source is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParserKind {
    #[serde(alias = "rss", alias = "atom")]
    Feed,
    #[serde(alias = "telegram")]
    Channel,
}

impl ParserKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ParserKind::Feed => "feed",
            ParserKind::Channel => "channel",
        }
    }
}

impl fmt::Display for ParserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParserKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "feed" | "rss" | "atom" => Ok(ParserKind::Feed),
            "channel" | "telegram" => Ok(ParserKind::Channel),
            other => anyhow::bail!("unknown parser kind: {other}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewsSource {
    pub id: i64,
    pub name: String,
    /// Feed URL, or channel identifier for `ParserKind::Channel`.
    pub url: String,
    pub is_active: bool,
    pub parser: ParserKind,
}

/// Definition used to create a source (config seeding, CLI).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewSource {
    pub name: String,
    pub url: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default = "default_parser")]
    pub parser: ParserKind,
}

fn default_active() -> bool {
    true
}

fn default_parser() -> ParserKind {
    ParserKind::Feed
}

// ---- Partial updates: only `Some` fields are written ----

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewsItemUpdate {
    pub title: Option<String>,
    pub url: Option<String>,
    pub summary: Option<String>,
    pub raw_text: Option<String>,
}

impl NewsItemUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.url.is_none() && self.summary.is_none() && self.raw_text.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
    pub status: Option<PostStatus>,
}

impl PostUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.content.is_none() && self.status.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewsSourceUpdate {
    pub name: Option<String>,
    pub url: Option<String>,
    pub is_active: Option<bool>,
    pub parser: Option<ParserKind>,
}

impl NewsSourceUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.url.is_none() && self.is_active.is_none() && self.parser.is_none()
    }
}

// ---- Read-only counters ----

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewsStats {
    pub total: i64,
    pub processed: i64,
    pub unprocessed: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostStats {
    pub total: i64,
    pub draft: i64,
    pub claimed: i64,
    pub published: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stats {
    pub news: NewsStats,
    pub posts: PostStats,
}
