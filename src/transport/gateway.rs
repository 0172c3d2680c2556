use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::session::SessionCredential;
use super::{
    normalize_channel, ChannelMessage, ChannelSession, TransportConnector, TransportError,
    TransportResult,
};

/// Connects to an HTTP messaging gateway using the persisted session credential.
///
/// Protocol (JSON, `Authorization: Bearer <session_token>`):
/// - `GET    /session`                        → `{"authorized": bool}`
/// - `GET    /channels/{channel}/messages?limit=N` → `[ChannelMessage]`
/// - `POST   /channels/{channel}/messages`    ← `{"text": "..."}`
/// - `DELETE /session`                        (ends this connection; the credential stays valid)
#[derive(Clone)]
pub struct GatewayConnector {
    credential_path: PathBuf,
    client: Client,
    timeout: Duration,
}

impl GatewayConnector {
    pub fn new(credential_path: PathBuf) -> Self {
        Self {
            credential_path,
            client: Client::new(),
            timeout: Duration::from_secs(20),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }
}

#[derive(Deserialize)]
struct SessionState {
    authorized: bool,
}

#[derive(Serialize)]
struct SendBody<'a> {
    text: &'a str,
}

#[async_trait]
impl TransportConnector for GatewayConnector {
    async fn connect(&self) -> TransportResult<Box<dyn ChannelSession>> {
        let cred = SessionCredential::load(&self.credential_path).map_err(|e| {
            TransportError::Unauthorized(format!(
                "{e:#}; run `postgen provision-session` first"
            ))
        })?;

        let rsp = self
            .client
            .get(format!("{}/session", cred.gateway_url))
            .bearer_auth(&cred.session_token)
            .timeout(self.timeout)
            .send()
            .await?;
        if matches!(rsp.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(TransportError::Unauthorized(format!(
                "gateway rejected session {} ({})",
                cred.redacted_token(),
                rsp.status()
            )));
        }
        let state: SessionState = rsp.error_for_status()?.json().await?;
        if !state.authorized {
            return Err(TransportError::Unauthorized(format!(
                "session {} for {} is not authorized",
                cred.redacted_token(),
                cred.account
            )));
        }

        tracing::debug!(account = %cred.account, "gateway session opened");
        Ok(Box::new(GatewaySession {
            client: self.client.clone(),
            cred,
            timeout: self.timeout,
            closed: false,
        }))
    }

    fn name(&self) -> &'static str {
        "gateway"
    }
}

struct GatewaySession {
    client: Client,
    cred: SessionCredential,
    timeout: Duration,
    closed: bool,
}

impl GatewaySession {
    fn channel_url(&self, channel: &str) -> String {
        format!(
            "{}/channels/{}/messages",
            self.cred.gateway_url,
            normalize_channel(channel)
        )
    }

    fn map_status(&self, channel: &str, status: StatusCode) -> Option<TransportError> {
        match status {
            StatusCode::UNAUTHORIZED => Some(TransportError::Unauthorized(format!(
                "session {} revoked",
                self.cred.redacted_token()
            ))),
            StatusCode::NOT_FOUND => Some(TransportError::ChannelNotFound(channel.to_string())),
            StatusCode::FORBIDDEN => {
                Some(TransportError::ChannelInaccessible(channel.to_string()))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl ChannelSession for GatewaySession {
    async fn recent_messages(
        &mut self,
        channel: &str,
        limit: usize,
    ) -> TransportResult<Vec<ChannelMessage>> {
        if self.closed {
            return Err(TransportError::Other("session already closed".into()));
        }
        let rsp = self
            .client
            .get(self.channel_url(channel))
            .query(&[("limit", limit)])
            .bearer_auth(&self.cred.session_token)
            .timeout(self.timeout)
            .send()
            .await?;
        if let Some(err) = self.map_status(channel, rsp.status()) {
            return Err(err);
        }
        let mut msgs: Vec<ChannelMessage> = rsp.error_for_status()?.json().await?;
        msgs.truncate(limit);
        Ok(msgs)
    }

    async fn send_message(&mut self, destination: &str, text: &str) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::Other("session already closed".into()));
        }
        let rsp = self
            .client
            .post(self.channel_url(destination))
            .bearer_auth(&self.cred.session_token)
            .timeout(self.timeout)
            .json(&SendBody { text })
            .send()
            .await?;
        if let Some(err) = self.map_status(destination, rsp.status()) {
            return Err(err);
        }
        rsp.error_for_status()?;
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let res = self
            .client
            .delete(format!("{}/session", self.cred.gateway_url))
            .bearer_auth(&self.cred.session_token)
            .timeout(self.timeout)
            .send()
            .await;
        if let Err(e) = res {
            tracing::debug!(error = ?e, "gateway session close failed");
        }
    }
}
