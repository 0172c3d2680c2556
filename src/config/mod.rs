// src/config/mod.rs
pub mod ai;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::{NewSource, ParserKind};
use crate::retry::RetryPolicy;
pub use ai::AiConfig;

const ENV_PATH: &str = "POSTGEN_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_url() -> String {
    "sqlite://data/postgen.db".into()
}
fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_db_url(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    /// Credential written by `postgen provision-session`.
    #[serde(default = "default_session_path")]
    pub session_path: PathBuf,
    #[serde(default = "default_transport_timeout")]
    pub request_timeout_secs: u64,
}

fn default_session_path() -> PathBuf {
    PathBuf::from("data/channel_session.json")
}
fn default_transport_timeout() -> u64 {
    20
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            session_path: default_session_path(),
            request_timeout_secs: default_transport_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestConfig {
    #[serde(default = "default_feed_timeout")]
    pub feed_timeout_secs: u64,
    /// Messages read per channel source.
    #[serde(default = "default_recent_limit")]
    pub channel_recent_limit: usize,
}

fn default_feed_timeout() -> u64 {
    20
}
fn default_recent_limit() -> usize {
    crate::ingest::providers::channel::DEFAULT_RECENT_LIMIT
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            feed_timeout_secs: default_feed_timeout(),
            channel_recent_limit: default_recent_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationConfig {
    /// Upper bound of items processed per run; `None` processes all.
    #[serde(default = "default_max_items")]
    pub max_items_per_run: Option<usize>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_max_items() -> Option<usize> {
    Some(50)
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_items_per_run: default_max_items(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishConfig {
    /// Destination channel id or `@handle`.
    #[serde(default)]
    pub outbound_channel: String,
    #[serde(default = "default_batch")]
    pub max_batch_size: usize,
    /// Claims older than this are considered abandoned.
    #[serde(default = "default_claim_ttl")]
    pub claim_ttl_secs: u64,
    #[serde(default = "RetryPolicy::immediate")]
    pub retry: RetryPolicy,
}

fn default_batch() -> usize {
    5
}
fn default_claim_ttl() -> u64 {
    3600
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            outbound_channel: String::new(),
            max_batch_size: default_batch(),
            claim_ttl_secs: default_claim_ttl(),
            retry: RetryPolicy::immediate(),
        }
    }
}

/// Interval per scheduled task, in seconds. `None` = on demand only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleConfig {
    #[serde(default = "default_ingest_interval")]
    pub ingest_feeds_secs: Option<u64>,
    #[serde(default = "default_ingest_interval")]
    pub ingest_channels_secs: Option<u64>,
    #[serde(default)]
    pub generate_posts_secs: Option<u64>,
    #[serde(default)]
    pub publish_drafts_secs: Option<u64>,
}

fn default_ingest_interval() -> Option<u64> {
    Some(30 * 60)
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            ingest_feeds_secs: default_ingest_interval(),
            ingest_channels_secs: default_ingest_interval(),
            generate_posts_secs: None,
            publish_drafts_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_bind() -> String {
    "0.0.0.0:8000".into()
}
fn default_workers() -> usize {
    2
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Seeded into the source table; existing names are left alone.
    #[serde(default = "default_sources")]
    pub sources: Vec<NewSource>,
}

pub fn default_sources() -> Vec<NewSource> {
    vec![
        NewSource {
            name: "Habr".into(),
            url: "https://habr.com/ru/rss/articles/".into(),
            is_active: true,
            parser: ParserKind::Feed,
        },
        NewSource {
            name: "VC.ru".into(),
            url: "https://vc.ru/rss".into(),
            is_active: true,
            parser: ParserKind::Feed,
        },
        NewSource {
            name: "Telegram Channel".into(),
            url: "@your_channel".into(),
            is_active: false,
            parser: ParserKind::Channel,
        },
    ]
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            ai: AiConfig::default(),
            transport: TransportConfig::default(),
            ingest: IngestConfig::default(),
            generation: GenerationConfig::default(),
            publish: PublishConfig::default(),
            schedule: ScheduleConfig::default(),
            server: ServerConfig::default(),
            sources: default_sources(),
        }
    }
}

impl PipelineConfig {
    /// Load from an explicit path. Supports TOML or JSON formats.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let mut cfg = parse_config(&content, &ext)
            .with_context(|| format!("parsing config {}", path.display()))?;
        cfg.ai.sanitize();
        Ok(cfg)
    }

    /// Load using env var + fallbacks, then apply env overrides:
    /// 1) $POSTGEN_CONFIG
    /// 2) config/postgen.toml
    /// 3) config/postgen.json
    /// 4) built-in defaults
    pub fn load_default() -> Result<Self> {
        let mut cfg = Self::load_file_default()?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    fn load_file_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(anyhow!("{ENV_PATH} points to non-existent path {}", pb.display()));
        }
        let toml_p = PathBuf::from("config/postgen.toml");
        if toml_p.exists() {
            return Self::load_from(&toml_p);
        }
        let json_p = PathBuf::from("config/postgen.json");
        if json_p.exists() {
            return Self::load_from(&json_p);
        }
        Ok(Self::default())
    }

    /// Environment wins over file values for deployment-specific settings.
    pub fn apply_env_overrides(&mut self) {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.trim().is_empty())
        }
        if let Some(v) = var("DATABASE_URL") {
            self.database.url = v;
        }
        if let Some(v) = var("OPENAI_API_KEY") {
            if !self.ai.api_key.trim().eq_ignore_ascii_case("env") {
                tracing::debug!("OPENAI_API_KEY overrides api_key from config file");
            }
            self.ai.api_key = v;
        }
        if let Some(v) = var("OPENAI_MODEL") {
            self.ai.model = v;
        }
        if let Some(v) = var("OPENAI_PROXY") {
            self.ai.proxy = Some(v);
        }
        if let Some(v) = var("OUTBOUND_CHANNEL") {
            self.publish.outbound_channel = v;
        }
        if let Some(v) = var("CHANNEL_SESSION_PATH") {
            self.transport.session_path = PathBuf::from(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.publish.max_batch_size == 0 {
            return Err(anyhow!("publish.max_batch_size must be at least 1"));
        }
        for (name, secs) in [
            ("ingest_feeds", self.schedule.ingest_feeds_secs),
            ("ingest_channels", self.schedule.ingest_channels_secs),
            ("generate_posts", self.schedule.generate_posts_secs),
            ("publish_drafts", self.schedule.publish_drafts_secs),
        ] {
            if secs == Some(0) {
                return Err(anyhow!("schedule interval for {name} must be > 0"));
            }
        }
        Ok(())
    }
}

fn parse_config(s: &str, hint_ext: &str) -> Result<PipelineConfig> {
    match hint_ext {
        "toml" => Ok(toml::from_str(s)?),
        "json" => Ok(serde_json::from_str(s)?),
        _ => {
            // Unknown extension: JSON documents start with `{`.
            if s.trim_start().starts_with('{') {
                Ok(serde_json::from_str(s)?)
            } else {
                Ok(toml::from_str(s)?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let cfg = parse_config("", "toml").unwrap();
        assert_eq!(cfg, PipelineConfig::default());
        assert_eq!(cfg.schedule.ingest_feeds_secs, Some(1800));
        assert_eq!(cfg.schedule.publish_drafts_secs, None);
        assert_eq!(cfg.sources.len(), 3);
    }

    #[test]
    fn toml_sections_override_defaults() {
        let s = r#"
            [publish]
            outbound_channel = "@my_channel"
            max_batch_size = 3

            [generation.retry]
            base_backoff_secs = 10
            max_attempts = 4

            [[sources]]
            name = "Lenta"
            url = "https://lenta.ru/rss"
            parser = "rss"
        "#;
        let cfg = parse_config(s, "toml").unwrap();
        assert_eq!(cfg.publish.outbound_channel, "@my_channel");
        assert_eq!(cfg.publish.max_batch_size, 3);
        assert_eq!(cfg.publish.claim_ttl_secs, 3600);
        assert_eq!(cfg.generation.retry.max_attempts, Some(4));
        assert_eq!(cfg.generation.retry.max_backoff_secs, 6 * 3600);
        assert_eq!(cfg.sources.len(), 1);
        assert!(cfg.sources[0].is_active);
        assert_eq!(cfg.sources[0].parser, ParserKind::Feed);
    }

    #[test]
    fn json_without_extension_is_detected() {
        let cfg = parse_config(r#"{"server": {"bind": "127.0.0.1:9000"}}"#, "").unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:9000");
        assert_eq!(cfg.server.workers, 2);
    }

    #[test]
    fn zero_interval_is_invalid() {
        let mut cfg = PipelineConfig::default();
        cfg.schedule.generate_posts_secs = Some(0);
        assert!(cfg.validate().is_err());
    }
}
