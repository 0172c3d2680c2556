//! In-process transport for tests and local dry runs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    normalize_channel, ChannelMessage, ChannelSession, TransportConnector, TransportError,
    TransportResult,
};

#[derive(Debug, Clone)]
enum ChannelState {
    Messages(Vec<ChannelMessage>),
    Missing,
    Private,
}

#[derive(Debug, Default)]
struct Inner {
    authorized: bool,
    channels: HashMap<String, ChannelState>,
    fail_markers: Vec<String>,
    sent: Vec<(String, String)>,
    opened: usize,
    closed: usize,
}

/// Cloneable handle; all clones share state.
#[derive(Clone)]
pub struct InMemoryConnector {
    inner: Arc<Mutex<Inner>>,
}

impl Default for InMemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                authorized: true,
                ..Inner::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }

    pub fn set_authorized(&self, authorized: bool) {
        self.lock().authorized = authorized;
    }

    /// Messages are stored newest first, as the network returns them.
    pub fn with_channel(self, channel: &str, messages: Vec<ChannelMessage>) -> Self {
        self.lock().channels.insert(
            normalize_channel(channel).to_string(),
            ChannelState::Messages(messages),
        );
        self
    }

    pub fn with_missing_channel(self, channel: &str) -> Self {
        self.lock()
            .channels
            .insert(normalize_channel(channel).to_string(), ChannelState::Missing);
        self
    }

    pub fn with_private_channel(self, channel: &str) -> Self {
        self.lock()
            .channels
            .insert(normalize_channel(channel).to_string(), ChannelState::Private);
        self
    }

    /// Any send whose text contains `marker` fails.
    pub fn fail_sends_containing(self, marker: &str) -> Self {
        self.lock().fail_markers.push(marker.to_string());
        self
    }

    /// `(destination, text)` of every successful send, in order.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.lock().sent.clone()
    }

    /// `(opened, closed)` session counters.
    pub fn session_counts(&self) -> (usize, usize) {
        let g = self.lock();
        (g.opened, g.closed)
    }
}

#[async_trait]
impl TransportConnector for InMemoryConnector {
    async fn connect(&self) -> TransportResult<Box<dyn ChannelSession>> {
        let mut g = self.lock();
        if !g.authorized {
            return Err(TransportError::Unauthorized("in-memory session revoked".into()));
        }
        g.opened += 1;
        Ok(Box::new(InMemorySession {
            inner: self.inner.clone(),
            closed: false,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct InMemorySession {
    inner: Arc<Mutex<Inner>>,
    closed: bool,
}

impl InMemorySession {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }
}

#[async_trait]
impl ChannelSession for InMemorySession {
    async fn recent_messages(
        &mut self,
        channel: &str,
        limit: usize,
    ) -> TransportResult<Vec<ChannelMessage>> {
        let key = normalize_channel(channel).to_string();
        let g = self.lock();
        match g.channels.get(&key) {
            Some(ChannelState::Messages(msgs)) => Ok(msgs.iter().take(limit).cloned().collect()),
            Some(ChannelState::Private) => Err(TransportError::ChannelInaccessible(key)),
            Some(ChannelState::Missing) | None => Err(TransportError::ChannelNotFound(key)),
        }
    }

    async fn send_message(&mut self, destination: &str, text: &str) -> TransportResult<()> {
        let mut g = self.lock();
        if g.fail_markers.iter().any(|m| text.contains(m.as_str())) {
            return Err(TransportError::Other(format!(
                "send to {destination} rejected"
            )));
        }
        g.sent.push((destination.to_string(), text.to_string()));
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.lock().closed += 1;
        }
    }
}
