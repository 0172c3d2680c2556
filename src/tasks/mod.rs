//! # Tasks
//! Named units of work ([`TaskHandler`]) registered once at startup in a
//! [`TaskRegistry`] and executed by a fixed-size [`WorkerPool`].

pub mod scheduler;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::OnceCell;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run once with JSON arguments; the JSON result is handed to the caller.
    async fn run(&self, args: Value) -> Result<Value>;
}

/// Explicit task name → handler table.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    handlers: BTreeMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later registrations under the same name replace earlier ones.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown task: {0}")]
    UnknownTask(String),
    #[error("worker pool is shut down")]
    PoolClosed,
}

struct Job {
    id: Uuid,
    name: String,
    args: Value,
    handler: Arc<dyn TaskHandler>,
    reply: oneshot::Sender<Result<Value>>,
}

/// Handle on one dispatched unit of work.
#[derive(Debug)]
pub struct TaskTicket {
    pub id: Uuid,
    pub name: String,
    rx: oneshot::Receiver<Result<Value>>,
}

impl TaskTicket {
    /// Wait for the handler's result.
    pub async fn wait(self) -> Result<Value> {
        match self.rx.await {
            Ok(res) => res,
            Err(_) => Err(anyhow!("task {} ({}) was dropped before completing", self.name, self.id)),
        }
    }
}

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("tasks_dispatched_total", "Units of work queued, by task.");
        describe_counter!("tasks_failed_total", "Units of work that returned an error or panicked.");
        describe_histogram!("task_run_ms", "Task run time in milliseconds.");
    });
}

pub struct WorkerPool {
    registry: Arc<TaskRegistry>,
    tx: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` consumers of a shared queue.
    pub fn start(registry: TaskRegistry, workers: usize) -> Self {
        ensure_metrics_described();
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<Job>(workers * 16);
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..workers)
            .map(|n| tokio::spawn(worker_loop(n, rx.clone())))
            .collect();
        info!(workers, tasks = ?registry.names(), "worker pool started");
        Self {
            registry: Arc::new(registry),
            tx,
            workers: handles,
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Queue `name` with `args`. Unknown names are rejected before queueing.
    pub async fn dispatch(&self, name: &str, args: Value) -> Result<TaskTicket, DispatchError> {
        let handler = self
            .registry
            .get(name)
            .ok_or_else(|| DispatchError::UnknownTask(name.to_string()))?;
        let (reply, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        let job = Job {
            id,
            name: name.to_string(),
            args,
            handler,
            reply,
        };
        self.tx.send(job).await.map_err(|_| DispatchError::PoolClosed)?;
        counter!("tasks_dispatched_total", "task" => name.to_string()).increment(1);
        debug!(task = name, %id, "task queued");
        Ok(TaskTicket {
            id,
            name: name.to_string(),
            rx,
        })
    }

    /// Stop accepting work, let queued jobs finish, join the workers.
    pub async fn shutdown(self) {
        drop(self.tx);
        for h in self.workers {
            let _ = h.await;
        }
    }
}

async fn worker_loop(n: usize, rx: Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            debug!(worker = n, "worker stopping");
            break;
        };

        let t0 = std::time::Instant::now();
        let handler = job.handler.clone();
        let args = job.args;
        // Own task so a panicking handler does not take the worker down.
        let res = match tokio::spawn(async move { handler.run(args).await }).await {
            Ok(res) => res,
            Err(join) => Err(anyhow!("task panicked: {join}")),
        };
        histogram!("task_run_ms", "task" => job.name.clone())
            .record(t0.elapsed().as_secs_f64() * 1_000.0);
        match &res {
            Ok(_) => debug!(worker = n, task = %job.name, id = %job.id, "task finished"),
            Err(e) => {
                counter!("tasks_failed_total", "task" => job.name.clone()).increment(1);
                error!(worker = n, task = %job.name, id = %job.id, error = %format!("{e:#}"), "task failed");
            }
        }
        // Caller may have dropped the ticket.
        let _ = job.reply.send(res);
    }
}
