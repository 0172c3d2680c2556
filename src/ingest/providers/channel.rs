use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;

use crate::ingest::truncate_chars;
use crate::ingest::types::SourceAdapter;
use crate::models::{ParserKind, RawItem};
use crate::store::Store;
use crate::transport::{normalize_channel, ChannelMessage, ChannelSession, TransportConnector};

pub const DEFAULT_RECENT_LIMIT: usize = 15;
const TITLE_MAX_CHARS: usize = 80;
const SUMMARY_MAX_CHARS: usize = 2000;

/// Reads recent messages of every active channel source over one session.
pub struct ChannelAdapter {
    store: Store,
    connector: Arc<dyn TransportConnector>,
    recent_limit: usize,
}

impl ChannelAdapter {
    pub fn new(store: Store, connector: Arc<dyn TransportConnector>) -> Self {
        Self {
            store,
            connector,
            recent_limit: DEFAULT_RECENT_LIMIT,
        }
    }

    pub fn with_recent_limit(mut self, limit: usize) -> Self {
        self.recent_limit = limit.max(1);
        self
    }

    async fn read_channels(
        &self,
        session: &mut dyn ChannelSession,
        channels: &[String],
    ) -> Result<Vec<RawItem>> {
        let now = Utc::now();
        let mut out = Vec::new();
        for channel in channels {
            match session.recent_messages(channel, self.recent_limit).await {
                Ok(msgs) => {
                    let before = out.len();
                    out.extend(msgs.iter().filter_map(|m| message_to_item(channel, m, now)));
                    tracing::debug!(channel = %channel, items = out.len() - before, "channel read");
                }
                Err(e) if e.is_unauthorized() => {
                    return Err(anyhow!(e)).context("channel session lost authorization");
                }
                Err(e) => {
                    tracing::warn!(error = %e, channel = %channel, "channel source error");
                    counter!("ingest_source_errors_total", "adapter" => "channel").increment(1);
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl SourceAdapter for ChannelAdapter {
    async fn list_items(&self) -> Result<Vec<RawItem>> {
        let channels: Vec<String> = self
            .store
            .active_sources(ParserKind::Channel)
            .await
            .context("loading active channel sources")?
            .into_iter()
            .map(|s| s.url)
            .collect();
        if channels.is_empty() {
            tracing::debug!("no active channel sources");
            return Ok(Vec::new());
        }

        let mut session = self
            .connector
            .connect()
            .await
            .map_err(|e| anyhow!(e))
            .with_context(|| format!("opening {} session", self.connector.name()))?;
        let res = self.read_channels(session.as_mut(), &channels).await;
        session.close().await;
        res
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}

/// `None` for empty or whitespace-only messages.
pub fn message_to_item(channel: &str, msg: &ChannelMessage, now: DateTime<Utc>) -> Option<RawItem> {
    let text = msg.text.as_deref()?;
    if text.trim().is_empty() {
        return None;
    }
    let channel = normalize_channel(channel);
    let title = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| truncate_chars(l, TITLE_MAX_CHARS))
        .unwrap_or_else(|| truncate_chars(text, TITLE_MAX_CHARS));

    Some(RawItem {
        title,
        url: Some(format!("https://t.me/{channel}/{}", msg.id)),
        summary: truncate_chars(text, SUMMARY_MAX_CHARS),
        source_name: format!("t.me/{channel}"),
        published_at: msg.date.unwrap_or(now),
        raw_text: Some(text.to_string()),
    })
}
