// src/tasks/scheduler.rs
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::app::task_names;
use crate::config::ScheduleConfig;
use crate::tasks::WorkerPool;

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTask {
    pub name: String,
    pub every: Duration,
    pub args: Value,
}

/// Recurring tasks enabled by the configuration. Ingestion runs on its own
/// cadence; generation and publish only when an interval is set.
pub fn schedule_from_config(cfg: &ScheduleConfig) -> Vec<ScheduledTask> {
    [
        (task_names::INGEST_FEEDS, cfg.ingest_feeds_secs),
        (task_names::INGEST_CHANNELS, cfg.ingest_channels_secs),
        (task_names::GENERATE_POSTS, cfg.generate_posts_secs),
        (task_names::PUBLISH_DRAFTS, cfg.publish_drafts_secs),
    ]
    .into_iter()
    .filter_map(|(name, secs)| {
        secs.filter(|s| *s > 0).map(|s| ScheduledTask {
            name: name.to_string(),
            every: Duration::from_secs(s),
            args: Value::Null,
        })
    })
    .collect()
}

/// One interval loop per task. A tick queues the task and moves on; the
/// outcome is logged by a detached watcher.
pub fn spawn_scheduler(pool: Arc<WorkerPool>, tasks: Vec<ScheduledTask>) -> Vec<JoinHandle<()>> {
    tasks
        .into_iter()
        .map(|task| {
            let pool = pool.clone();
            tokio::spawn(async move {
                tracing::info!(task = %task.name, every_secs = task.every.as_secs(), "scheduled");
                let mut ticker = tokio::time::interval(task.every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let now = chrono::Utc::now().timestamp().max(0) as f64;
                    gauge!("scheduler_last_tick_ts", "task" => task.name.clone()).set(now);
                    counter!("scheduler_ticks_total", "task" => task.name.clone()).increment(1);

                    match pool.dispatch(&task.name, task.args.clone()).await {
                        Ok(ticket) => {
                            tokio::spawn(async move {
                                let name = ticket.name.clone();
                                match ticket.wait().await {
                                    Ok(out) => {
                                        tracing::info!(task = %name, result = %out, "scheduled run done")
                                    }
                                    Err(e) => {
                                        tracing::warn!(task = %name, error = %format!("{e:#}"), "scheduled run failed")
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(task = %task.name, error = %e, "scheduler stopped: dispatch failed");
                            break;
                        }
                    }
                }
            })
        })
        .collect()
}
