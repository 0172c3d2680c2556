//! # Publish orchestrator
//! Claims a bounded batch of drafts and sends them one by one to the
//! outbound channel, committing each outcome as soon as it is known.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::PublishConfig;
use crate::models::Post;
use crate::retry::RetryPolicy;
use crate::store::Store;
use crate::transport::{TransportConnector, TransportError};

#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub outbound_channel: String,
    pub max_batch_size: usize,
    pub claim_ttl: Duration,
    pub retry: RetryPolicy,
}

impl From<&PublishConfig> for PublishSettings {
    fn from(cfg: &PublishConfig) -> Self {
        Self {
            outbound_channel: cfg.outbound_channel.clone(),
            max_batch_size: cfg.max_batch_size,
            claim_ttl: Duration::from_secs(cfg.claim_ttl_secs),
            retry: cfg.retry,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishReport {
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
    /// Posts of this run's claim handed back to `draft` unsent.
    pub released: usize,
}

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("publish_sent_total", "Posts published to the outbound channel.");
        describe_counter!("publish_failed_total", "Posts whose send failed.");
        describe_counter!(
            "publish_released_total",
            "Claimed posts released back to draft (stale or aborted run)."
        );
        describe_counter!("publish_auth_failures_total", "Runs aborted on an unauthorized session.");
        describe_histogram!("publish_send_ms", "Outbound send latency in milliseconds.");
    });
}

enum SendOutcome {
    Sent,
    Failed(String),
    Unauthorized(TransportError),
}

async fn send_one(connector: &dyn TransportConnector, destination: &str, post: &Post) -> SendOutcome {
    let mut session = match connector.connect().await {
        Ok(s) => s,
        Err(e) if e.is_unauthorized() => return SendOutcome::Unauthorized(e),
        Err(e) => return SendOutcome::Failed(format!("opening session: {e}")),
    };
    let t0 = std::time::Instant::now();
    let res = session.send_message(destination, &post.compose_message()).await;
    session.close().await;
    histogram!("publish_send_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
    match res {
        Ok(()) => SendOutcome::Sent,
        Err(e) if e.is_unauthorized() => SendOutcome::Unauthorized(e),
        Err(e) => SendOutcome::Failed(e.to_string()),
    }
}

/// Hand the unsent rest of a claim back to `draft` after a status write
/// failed, keeping `delivered` out of the release.
async fn abandon_claim(
    store: &Store,
    token: &str,
    delivered: Option<Uuid>,
    report: &mut PublishReport,
    cause: anyhow::Error,
) -> anyhow::Error {
    match store.release_claim_except(token, delivered).await {
        Ok(released) => {
            counter!("publish_released_total").increment(released);
            report.released += released as usize;
            error!(
                error = %format!("{cause:#}"),
                released,
                published = report.published,
                failed = report.failed,
                "publish aborted: status write failed"
            );
        }
        Err(e) => {
            error!(error = %e, "releasing claim after a failed status write");
        }
    }
    cause.context("publish aborted")
}

/// Publish up to `limit` drafts (capped at the configured batch size).
///
/// Sends are sequential with a fresh session per post. An unauthorized
/// session aborts the run: every post of this claim not yet sent goes back
/// to `draft` and the error is returned. A failed status write aborts the
/// same way; a post already delivered is parked as `failed` instead.
pub async fn publish_drafts(
    store: &Store,
    connector: &dyn TransportConnector,
    settings: &PublishSettings,
    limit: usize,
) -> Result<PublishReport> {
    ensure_metrics_described();
    let destination = settings.outbound_channel.trim();
    if destination.is_empty() {
        return Err(anyhow!("no outbound channel configured"));
    }
    let limit = limit.min(settings.max_batch_size);
    let mut report = PublishReport::default();

    let ttl = chrono::Duration::from_std(settings.claim_ttl).unwrap_or(chrono::Duration::hours(1));
    let stale = store
        .release_stale_claims(Utc::now() - ttl)
        .await
        .context("releasing stale claims")?;
    if stale > 0 {
        counter!("publish_released_total").increment(stale);
        warn!(released = stale, "released stale publish claims");
    }
    if limit == 0 {
        return Ok(report);
    }

    let claim = store
        .claim_drafts(limit, Utc::now(), settings.retry.max_attempts)
        .await
        .context("claiming drafts")?;
    report.claimed = claim.posts.len();

    for post in &claim.posts {
        match send_one(connector, destination, post).await {
            SendOutcome::Sent => {
                let kept = match store.mark_published(post.id, &claim.token).await {
                    Ok(kept) => kept,
                    Err(e) => {
                        // Already delivered: park as failed, never back to draft.
                        let note =
                            format!("delivered, but recording the published status failed: {e}");
                        if let Err(e2) =
                            store.mark_failed(post.id, &claim.token, &note, None).await
                        {
                            error!(post = %post.id, error = %e2, "could not park delivered post");
                        }
                        counter!("publish_sent_total").increment(1);
                        report.published += 1;
                        let cause = anyhow::Error::new(e)
                            .context(format!("marking post {} published", post.id));
                        let err =
                            abandon_claim(store, &claim.token, Some(post.id), &mut report, cause)
                                .await;
                        return Err(err);
                    }
                };
                if !kept {
                    warn!(post = %post.id, "claim lost before the published status was written");
                }
                counter!("publish_sent_total").increment(1);
                report.published += 1;
                info!(post = %post.id, destination, "post published");
            }
            SendOutcome::Failed(msg) => {
                let attempts = post.attempts.saturating_add(1);
                let retry_after = (settings.retry.backoff(attempts) > chrono::Duration::zero())
                    .then(|| settings.retry.next_attempt_at(attempts, Utc::now()));
                if let Err(e) = store.mark_failed(post.id, &claim.token, &msg, retry_after).await {
                    let cause =
                        anyhow::Error::new(e).context(format!("marking post {} failed", post.id));
                    return Err(abandon_claim(store, &claim.token, None, &mut report, cause).await);
                }
                counter!("publish_failed_total").increment(1);
                report.failed += 1;
                warn!(post = %post.id, error = %msg, "post publish failed");
            }
            SendOutcome::Unauthorized(e) => {
                let released = store
                    .release_claim(&claim.token)
                    .await
                    .context("releasing claim after authorization failure")?;
                counter!("publish_auth_failures_total").increment(1);
                counter!("publish_released_total").increment(released);
                report.released += released as usize;
                error!(
                    error = %e,
                    released,
                    published = report.published,
                    failed = report.failed,
                    "publish aborted: transport session not authorized"
                );
                return Err(anyhow::Error::new(e).context("publish aborted"));
            }
        }
    }

    info!(
        claimed = report.claimed,
        published = report.published,
        failed = report.failed,
        "publish run finished"
    );
    Ok(report)
}

/// Every failed post back to draft, unconditionally.
pub async fn retry_failed(store: &Store) -> Result<Vec<Uuid>> {
    let ids = store.retry_failed().await.context("resetting failed posts")?;
    info!(count = ids.len(), "failed posts reset to draft");
    Ok(ids)
}
