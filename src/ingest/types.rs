// src/ingest/types.rs
use serde::{Deserialize, Serialize};

use crate::error::FeedError;
use crate::model::Mention;

/// Source-defined resume point. Opaque to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeedCursor(pub String);

#[derive(Debug, Clone, Default)]
pub struct FeedPage {
    pub mentions: Vec<Mention>,
    /// Where the next fetch should resume; `None` keeps the previous cursor.
    pub next_cursor: Option<FeedCursor>,
}

#[async_trait::async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch_mentions(
        &self,
        asset_tag: &str,
        since: Option<&FeedCursor>,
        limit: usize,
    ) -> Result<FeedPage, FeedError>;

    fn name(&self) -> &'static str;
}
