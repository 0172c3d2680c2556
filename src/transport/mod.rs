//! # Channel transport
//! Session-based access to the messaging network: read recent channel
//! messages, send a message to a destination channel.
//!
//! A [`TransportConnector`] opens a [`ChannelSession`]; opening checks that
//! the persisted credential is still authorized. Sessions must be closed by
//! the caller on every exit path (`close` is idempotent).

pub mod gateway;
pub mod memory;
pub mod session;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message as returned by the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelMessage {
    pub id: i64,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Credential missing, revoked or never authorized. Fatal for the invocation.
    #[error("transport session is not authorized: {0}")]
    Unauthorized(String),

    #[error("channel {0} not found")]
    ChannelNotFound(String),

    #[error("channel {0} is private or inaccessible")]
    ChannelInaccessible(String),

    #[error("transport request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, TransportError::Unauthorized(_))
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

#[async_trait]
pub trait ChannelSession: Send {
    /// Most recent messages of `channel`, newest first, at most `limit`.
    async fn recent_messages(
        &mut self,
        channel: &str,
        limit: usize,
    ) -> TransportResult<Vec<ChannelMessage>>;

    /// Send `text` to `destination` (channel id or handle).
    async fn send_message(&mut self, destination: &str, text: &str) -> TransportResult<()>;

    /// Release the session. Safe to call more than once.
    async fn close(&mut self);
}

#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Open a fresh session. Fails with `Unauthorized` when the credential is
    /// not (or no longer) authorized.
    async fn connect(&self) -> TransportResult<Box<dyn ChannelSession>>;

    fn name(&self) -> &'static str;
}

/// Bare channel name from `@name`, `name` or a `t.me/name` link.
pub fn normalize_channel(channel: &str) -> &str {
    let c = channel.trim();
    let c = ["https://t.me/", "http://t.me/", "t.me/"]
        .iter()
        .find_map(|prefix| c.strip_prefix(*prefix))
        .unwrap_or(c);
    c.trim_end_matches('/').trim_start_matches('@')
}
