//! Wiring: one [`Pipeline`] context shared by every task handler.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::{GenerationConfig, PipelineConfig};
use crate::generate::{run_generation, ContentGenerator, GenerationReport, OpenAiGenerator};
use crate::ingest::providers::{ChannelAdapter, FeedAdapter, FeedFetcher, HttpFeedFetcher};
use crate::ingest::run_ingestion;
use crate::ingest::types::IngestReport;
use crate::publish::{self, PublishReport, PublishSettings};
use crate::store::Store;
use crate::tasks::{TaskHandler, TaskRegistry};
use crate::transport::gateway::GatewayConnector;
use crate::transport::TransportConnector;

pub mod task_names {
    pub const INGEST_FEEDS: &str = "ingest_feeds";
    pub const INGEST_CHANNELS: &str = "ingest_channels";
    pub const GENERATE_POSTS: &str = "generate_posts";
    pub const PUBLISH_DRAFTS: &str = "publish_drafts";
    pub const RETRY_FAILED: &str = "retry_failed";
}

pub struct Pipeline {
    pub store: Store,
    pub connector: Arc<dyn TransportConnector>,
    pub fetcher: Arc<dyn FeedFetcher>,
    /// `None` when no generation backend could be built (e.g. missing key).
    pub generator: Option<ContentGenerator>,
    pub generation: GenerationConfig,
    pub publish: PublishSettings,
    pub channel_recent_limit: usize,
}

impl Pipeline {
    /// Production wiring: HTTP feeds, gateway transport, OpenAI backend.
    pub async fn from_config(cfg: &PipelineConfig) -> Result<Self> {
        let store = Store::connect(&cfg.database.url, cfg.database.max_connections)
            .await
            .with_context(|| format!("opening database {}", cfg.database.url))?;
        let fetcher = Arc::new(HttpFeedFetcher::new(cfg.ingest.feed_timeout_secs)?);
        let connector = Arc::new(
            GatewayConnector::new(cfg.transport.session_path.clone())
                .with_timeout(cfg.transport.request_timeout_secs),
        );
        let generator = match OpenAiGenerator::from_config(&cfg.ai) {
            Ok(backend) => {
                tracing::info!(model = backend.model(), "generation backend ready");
                let mut g = ContentGenerator::new(Arc::new(backend))
                    .with_sampling(cfg.ai.temperature, cfg.ai.max_tokens);
                if let Some(prompt) = &cfg.ai.system_prompt {
                    g = g.with_system_prompt(prompt.clone());
                }
                Some(g)
            }
            Err(e) => {
                tracing::warn!(error = %e, "generation backend unavailable; generate_posts will fail");
                None
            }
        };
        Ok(Self {
            store,
            connector,
            fetcher,
            generator,
            generation: cfg.generation.clone(),
            publish: PublishSettings::from(&cfg.publish),
            channel_recent_limit: cfg.ingest.channel_recent_limit,
        })
    }

    pub async fn ingest_feeds(&self) -> Result<IngestReport> {
        let adapter = FeedAdapter::new(self.store.clone(), self.fetcher.clone());
        run_ingestion(&adapter, &self.store).await
    }

    pub async fn ingest_channels(&self) -> Result<IngestReport> {
        let adapter = ChannelAdapter::new(self.store.clone(), self.connector.clone())
            .with_recent_limit(self.channel_recent_limit);
        run_ingestion(&adapter, &self.store).await
    }

    pub async fn generate_posts(&self, max_items: Option<usize>) -> Result<GenerationReport> {
        let generator = self
            .generator
            .as_ref()
            .ok_or_else(|| anyhow!("no generation backend configured"))?;
        let max_items = max_items.or(self.generation.max_items_per_run);
        run_generation(&self.store, generator, &self.generation.retry, max_items).await
    }

    pub async fn publish_drafts(&self, limit: Option<usize>) -> Result<PublishReport> {
        let limit = limit.unwrap_or(self.publish.max_batch_size);
        publish::publish_drafts(&self.store, self.connector.as_ref(), &self.publish, limit).await
    }

    pub async fn retry_failed(&self) -> Result<Vec<uuid::Uuid>> {
        publish::retry_failed(&self.store).await
    }

    /// Every pipeline step, by name.
    pub fn registry(self: &Arc<Self>) -> TaskRegistry {
        let mut reg = TaskRegistry::new();
        for kind in [
            TaskKind::IngestFeeds,
            TaskKind::IngestChannels,
            TaskKind::GeneratePosts,
            TaskKind::PublishDrafts,
            TaskKind::RetryFailed,
        ] {
            reg.register(
                kind.name(),
                Arc::new(PipelineTask {
                    pipeline: self.clone(),
                    kind,
                }),
            );
        }
        reg
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskKind {
    IngestFeeds,
    IngestChannels,
    GeneratePosts,
    PublishDrafts,
    RetryFailed,
}

impl TaskKind {
    fn name(self) -> &'static str {
        match self {
            TaskKind::IngestFeeds => task_names::INGEST_FEEDS,
            TaskKind::IngestChannels => task_names::INGEST_CHANNELS,
            TaskKind::GeneratePosts => task_names::GENERATE_POSTS,
            TaskKind::PublishDrafts => task_names::PUBLISH_DRAFTS,
            TaskKind::RetryFailed => task_names::RETRY_FAILED,
        }
    }
}

/// Optional arguments accepted by the pipeline tasks.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskArgs {
    limit: Option<usize>,
    max_items: Option<usize>,
}

impl TaskArgs {
    fn parse(v: Value) -> Result<Self> {
        if v.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(v).context("invalid task arguments")
    }
}

struct PipelineTask {
    pipeline: Arc<Pipeline>,
    kind: TaskKind,
}

#[async_trait]
impl TaskHandler for PipelineTask {
    async fn run(&self, args: Value) -> Result<Value> {
        let args = TaskArgs::parse(args)?;
        let p = &self.pipeline;
        let out = match self.kind {
            TaskKind::IngestFeeds => serde_json::to_value(p.ingest_feeds().await?)?,
            TaskKind::IngestChannels => serde_json::to_value(p.ingest_channels().await?)?,
            TaskKind::GeneratePosts => serde_json::to_value(p.generate_posts(args.max_items).await?)?,
            TaskKind::PublishDrafts => serde_json::to_value(p.publish_drafts(args.limit).await?)?,
            TaskKind::RetryFailed => {
                let ids = p.retry_failed().await?;
                json!({ "reset": ids.len(), "ids": ids })
            }
        };
        Ok(out)
    }
}
