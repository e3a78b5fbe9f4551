//! The `SignalStore` trait and the lazy history streams built on it.
//!
//! The store is the durability boundary: mentions and signals are strictly
//! append-only, and everything else (dedup cache, trend aggregates) can be
//! rebuilt from it after a restart.

pub mod memory;
pub mod schema;
pub mod sqlite;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

use crate::error::{StoreError, StoreResult};
use crate::ingest::dedup::DedupRecord;
use crate::ingest::types::FeedCursor;
use crate::model::{
    Mention, MentionId, NewSignal, ScoringStatus, Signal, SignalId, SignalKind, StoredMention,
};

pub use memory::MemorySignalStore;
pub use sqlite::SqliteSignalStore;

/// Rows per page when streaming history.
pub const PAGE_SIZE: usize = 256;

/// Resume point for ordered history reads: strictly after `(at, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StoreCursor {
    pub at: DateTime<Utc>,
    pub id: i64,
}

impl StoreCursor {
    /// Cursor that includes every row at or after `at`.
    pub fn since(at: DateTime<Utc>) -> Self {
        Self { at, id: i64::MIN }
    }

    pub fn admits(&self, at: DateTime<Utc>, id: i64) -> bool {
        (at, id) > (self.at, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MentionAppend {
    Inserted(MentionId),
    /// `source_id` was already stored; nothing was written.
    AlreadyPresent(MentionId),
}

impl MentionAppend {
    pub fn id(&self) -> MentionId {
        match *self {
            MentionAppend::Inserted(id) | MentionAppend::AlreadyPresent(id) => id,
        }
    }
}

/// Outcome of [`SignalStore::append_scored`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredAppend {
    pub mention: MentionAppend,
    /// Empty unless the mention was inserted by this call.
    pub signals: Vec<Signal>,
}

#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Idempotent on `source_id`.
    async fn append_mention(
        &self,
        mention: &Mention,
        scoring: ScoringStatus,
    ) -> StoreResult<MentionAppend>;

    async fn append_signal(&self, signal: NewSignal) -> StoreResult<Signal>;

    /// Writes a scored mention and all of its signals as one unit: either
    /// everything lands or nothing does. Each signal's `mention_ref` is
    /// rebound to the stored mention. When `source_id` is already present
    /// nothing is written and no signals are returned.
    async fn append_scored(
        &self,
        mention: &Mention,
        scoring: ScoringStatus,
        signals: Vec<NewSignal>,
    ) -> StoreResult<ScoredAppend>;

    /// Signals for `asset_tag` after `after`, ordered by `(computed_at, id)`.
    async fn signals_after(
        &self,
        asset_tag: &str,
        after: StoreCursor,
        limit: usize,
    ) -> StoreResult<Vec<Signal>>;

    /// Mentions for `asset_tag` after `after`, ordered by `(observed_at, id)`.
    async fn mentions_after(
        &self,
        asset_tag: &str,
        after: StoreCursor,
        limit: usize,
    ) -> StoreResult<Vec<StoredMention>>;

    /// Up to `limit` of the asset's signals of `kind`, newest first.
    async fn recent_signals(
        &self,
        asset_tag: &str,
        kind: SignalKind,
        limit: usize,
    ) -> StoreResult<Vec<Signal>>;

    async fn get_signal(&self, id: SignalId) -> StoreResult<Option<Signal>>;

    /// Source ids observed at or after `since`, for warming the dedup cache.
    async fn recent_source_ids(&self, since: DateTime<Utc>) -> StoreResult<Vec<DedupRecord>>;

    async fn load_cursor(&self, asset_tag: &str) -> StoreResult<Option<FeedCursor>>;

    async fn save_cursor(&self, asset_tag: &str, cursor: &FeedCursor) -> StoreResult<()>;

    /// Returns false when the asset was already tracked.
    async fn track_asset(&self, asset_tag: &str, requested_at: DateTime<Utc>) -> StoreResult<bool>;

    async fn tracked_assets(&self) -> StoreResult<Vec<String>>;
}

pub type DynStore = Arc<dyn SignalStore>;

fn paged<T, F, Fut>(
    start: StoreCursor,
    mut fetch: F,
    key: fn(&T) -> StoreCursor,
) -> BoxStream<'static, StoreResult<T>>
where
    T: Send + 'static,
    F: FnMut(StoreCursor) -> Fut + Send + 'static,
    Fut: Future<Output = StoreResult<Vec<T>>> + Send + 'static,
{
    stream::try_unfold(Some(start), move |cursor: Option<StoreCursor>| {
        let page = cursor.map(&mut fetch);
        async move {
            let Some(page) = page else {
                return Ok::<_, StoreError>(None);
            };
            let rows = page.await?;
            let next = if rows.len() < PAGE_SIZE {
                None
            } else {
                rows.last().map(key)
            };
            if rows.is_empty() {
                return Ok(None);
            }
            Ok(Some((
                stream::iter(rows.into_iter().map(Ok::<T, StoreError>)),
                next,
            )))
        }
    })
    .try_flatten()
    .boxed()
}

/// Lazy, finite, restartable sequence of an asset's signals from `since`.
pub fn signals_since(
    store: DynStore,
    asset_tag: &str,
    since: DateTime<Utc>,
) -> BoxStream<'static, StoreResult<Signal>> {
    let asset = asset_tag.to_string();
    paged(
        StoreCursor::since(since),
        move |cursor| {
            let store = store.clone();
            let asset = asset.clone();
            async move { store.signals_after(&asset, cursor, PAGE_SIZE).await }
        },
        |s: &Signal| StoreCursor {
            at: s.computed_at,
            id: s.id.0,
        },
    )
}

/// Lazy sequence of an asset's persisted mentions from `since`.
pub fn mentions_since(
    store: DynStore,
    asset_tag: &str,
    since: DateTime<Utc>,
) -> BoxStream<'static, StoreResult<StoredMention>> {
    let asset = asset_tag.to_string();
    paged(
        StoreCursor::since(since),
        move |cursor| {
            let store = store.clone();
            let asset = asset.clone();
            async move { store.mentions_after(&asset, cursor, PAGE_SIZE).await }
        },
        |m: &StoredMention| StoreCursor {
            at: m.mention.observed_at,
            id: m.id.0,
        },
    )
}
