// src/ingest/types.rs
use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::models::RawItem;

/// One source kind (feed, channel) normalized to `RawItem`s.
#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    async fn list_items(&self) -> Result<Vec<RawItem>>;
    fn name(&self) -> &'static str;
}

/// Counts returned by one ingestion pass.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestReport {
    pub fetched: usize,
    pub added: usize,
}
