//! # Content generation
//! Turns stored news items into draft posts through a text-generation
//! backend. One call per item, one item at a time.

pub mod openai;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::retry::RetryPolicy;
use crate::store::Store;

pub use openai::OpenAiGenerator;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are the editor of a popular IT channel. \
Write a short, engaging post (up to 1000 characters) based on the news. \
Use emoji, hashtags and a friendly tone. \
Do not mention the source of the news. \
Format: a title (one line), then an empty line, then the post text.";

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 500;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Backend producing raw text for a prompt.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeneratedPost {
    pub title: String,
    pub content: String,
}

/// Split generated text into title and body.
///
/// A blank line separates them when present; otherwise the first line is the
/// title. Single-line output is used as both.
pub fn parse_generated(raw: &str) -> GeneratedPost {
    let text = raw.replace("\r\n", "\n");
    let text = text.trim();
    let (title, content) = if let Some((t, c)) = text.split_once("\n\n") {
        (t, c)
    } else if let Some((t, c)) = text.split_once('\n') {
        (t, c)
    } else {
        (text, text)
    };
    GeneratedPost {
        title: title.trim().to_string(),
        content: content.trim().to_string(),
    }
}

/// Short, stable fingerprint used in logs instead of the text itself.
pub fn text_fingerprint(s: &str) -> String {
    let digest = Sha256::digest(s.as_bytes());
    digest[..6].iter().map(|b| format!("{b:02x}")).collect()
}

/// Fixed persona + prompt settings around a backend.
#[derive(Clone)]
pub struct ContentGenerator {
    backend: Arc<dyn TextGenerator>,
    system_prompt: String,
    temperature: f32,
    max_tokens: u32,
}

impl ContentGenerator {
    pub fn new(backend: Arc<dyn TextGenerator>) -> Self {
        Self {
            backend,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// One backend call; errors propagate to the caller.
    pub async fn generate(&self, summary: &str) -> Result<GeneratedPost> {
        let req = CompletionRequest {
            system: self.system_prompt.clone(),
            user: format!("News: {summary}"),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        let t0 = std::time::Instant::now();
        let raw = self.backend.complete(&req).await;
        histogram!("generate_call_ms", "backend" => self.backend.name())
            .record(t0.elapsed().as_secs_f64() * 1_000.0);
        let raw = raw.with_context(|| format!("{} completion", self.backend.name()))?;
        Ok(parse_generated(&raw))
    }
}

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("generate_posts_created_total", "Draft posts created.");
        describe_counter!(
            "generate_failures_total",
            "Generation calls that failed (item retried on a later run)."
        );
        describe_histogram!("generate_call_ms", "Text-generation call latency in milliseconds.");
    });
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerationReport {
    /// Items without a post that were eligible this run.
    pub selected: usize,
    pub created: usize,
    pub failed: usize,
    /// A post appeared for the item while it was being generated.
    pub skipped: usize,
}

/// Generate one draft per eligible item, oldest first, sequentially.
///
/// A failed call creates nothing; the attempt is recorded and the item comes
/// back once its backoff window has passed.
pub async fn run_generation(
    store: &Store,
    generator: &ContentGenerator,
    policy: &RetryPolicy,
    max_items: Option<usize>,
) -> Result<GenerationReport> {
    ensure_metrics_described();
    let items = store
        .items_needing_posts(Utc::now(), policy.max_attempts, max_items)
        .await
        .context("selecting items without posts")?;

    let mut report = GenerationReport {
        selected: items.len(),
        ..Default::default()
    };
    for item in items {
        let fp = text_fingerprint(&item.summary);
        match generator.generate(&item.summary).await {
            Ok(post) => {
                let created = store
                    .create_draft_post(item.id, &post.title, &post.content)
                    .await
                    .with_context(|| format!("storing draft for item {}", item.id))?;
                match created {
                    Some(p) => {
                        counter!("generate_posts_created_total").increment(1);
                        report.created += 1;
                        tracing::debug!(item = %item.id, post = %p.id, summary = %fp, "draft created");
                    }
                    None => {
                        report.skipped += 1;
                        tracing::debug!(item = %item.id, "post already exists, generated text dropped");
                    }
                }
            }
            Err(e) => {
                counter!("generate_failures_total").increment(1);
                report.failed += 1;
                let attempts = store
                    .record_generation_failure(item.id, &format!("{e:#}"), policy, Utc::now())
                    .await
                    .with_context(|| format!("recording generation failure for {}", item.id))?;
                warn!(
                    error = ?e,
                    item = %item.id,
                    summary = %fp,
                    attempts,
                    exhausted = policy.exhausted(attempts),
                    "generation failed"
                );
            }
        }
    }

    info!(
        selected = report.selected,
        created = report.created,
        failed = report.failed,
        backend = generator.backend_name(),
        "generation run finished"
    );
    Ok(report)
}
