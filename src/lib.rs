// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod app;
pub mod config;
pub mod generate;
pub mod ingest;
pub mod metrics;
pub mod models;
pub mod publish;
pub mod retry;
pub mod store;
pub mod tasks;
pub mod transport;

// ---- Re-exports for stable public API ----
pub use crate::app::Pipeline;
pub use crate::config::PipelineConfig;
pub use crate::store::Store;
pub use crate::tasks::{TaskRegistry, WorkerPool};
