// src/transport/session.rs
//! Durable session credential, produced once by `postgen provision-session`
//! and only read by the pipeline.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionCredential {
    /// Account the session belongs to (phone number, username…). Diagnostics only.
    pub account: String,
    /// Base URL of the messaging gateway.
    pub gateway_url: String,
    /// Bearer token issued by the gateway after device authorization.
    pub session_token: String,
    pub created_at: DateTime<Utc>,
}

impl SessionCredential {
    pub fn new(account: String, gateway_url: String, session_token: String) -> Result<Self> {
        if session_token.trim().is_empty() {
            return Err(anyhow!("session token must not be empty"));
        }
        let gateway_url = gateway_url.trim().trim_end_matches('/').to_string();
        if !(gateway_url.starts_with("http://") || gateway_url.starts_with("https://")) {
            return Err(anyhow!("gateway url must be http(s): {gateway_url}"));
        }
        Ok(Self {
            account: account.trim().to_string(),
            gateway_url,
            session_token: session_token.trim().to_string(),
            created_at: Utc::now(),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let s = fs::read_to_string(path)
            .with_context(|| format!("reading session credential {}", path.display()))?;
        let cred: SessionCredential = serde_json::from_str(&s)
            .with_context(|| format!("parsing session credential {}", path.display()))?;
        Ok(cred)
    }

    /// Write atomically (tmp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(self).context("serializing session credential")?;
        fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("renaming to {}", path.display()))?;
        Ok(())
    }

    /// Token fingerprint safe for logs.
    pub fn redacted_token(&self) -> String {
        let tail: String = self
            .session_token
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("***{tail}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_keeps_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/session.json");
        let cred = SessionCredential::new(
            "+10000000000".into(),
            "https://gw.example/".into(),
            "tok-abcdef".into(),
        )
        .unwrap();
        cred.save(&path).unwrap();
        let loaded = SessionCredential::load(&path).unwrap();
        assert_eq!(loaded, cred);
        assert_eq!(loaded.gateway_url, "https://gw.example");
    }

    #[test]
    fn empty_token_is_rejected() {
        assert!(SessionCredential::new("a".into(), "https://gw".into(), "  ".into()).is_err());
    }

    #[test]
    fn redaction_keeps_only_tail() {
        let cred =
            SessionCredential::new("a".into(), "https://gw".into(), "secret-1234".into()).unwrap();
        assert_eq!(cred.redacted_token(), "***1234");
    }
}
