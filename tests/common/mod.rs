// tests/common/mod.rs
// Shared fakes for integration tests: scripted feed, flaky scorer and a
// store wrapper that can be told to fail.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use dugtrio_trends::analyze::{ScoringInput, ScoringPort};
use dugtrio_trends::config::PipelineConfig;
use dugtrio_trends::error::{FeedError, ScoringError, StoreError, StoreResult};
use dugtrio_trends::ingest::dedup::DedupRecord;
use dugtrio_trends::ingest::types::{FeedCursor, FeedPage, FeedSource};
use dugtrio_trends::model::{
    Mention, NewSignal, ScoringStatus, Signal, SignalDraft, SignalId, SignalKind, StoredMention,
};
use dugtrio_trends::store::{MentionAppend, ScoredAppend, StoreCursor};
use dugtrio_trends::{
    IngestionScheduler, ManualClock, MemorySignalStore, SchedulerDeps, SignalStore,
};

pub fn mention(id: &str, asset: &str, text: &str, at: DateTime<Utc>) -> Mention {
    Mention {
        source_id: id.into(),
        asset_tag: asset.into(),
        author_handle: "anon".into(),
        body_text: text.into(),
        media_refs: vec![],
        observed_at: at,
        fetch_batch_id: String::new(),
    }
}

pub fn page(mentions: Vec<Mention>, cursor: Option<&str>) -> FeedPage {
    FeedPage {
        mentions,
        next_cursor: cursor.map(|c| FeedCursor(c.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Feed
// ---------------------------------------------------------------------------

/// Per-asset queue of responses. An empty queue answers with an empty page.
#[derive(Default)]
pub struct ScriptedFeed {
    script: Mutex<HashMap<String, VecDeque<Result<FeedPage, FeedError>>>>,
    calls: Mutex<Vec<(String, Option<FeedCursor>)>>,
}

impl ScriptedFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, asset: &str, resp: Result<FeedPage, FeedError>) {
        self.script
            .lock()
            .unwrap()
            .entry(asset.to_string())
            .or_default()
            .push_back(resp);
    }

    /// Every `(asset, since)` the scheduler asked for, in order.
    pub fn calls(&self) -> Vec<(String, Option<FeedCursor>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl FeedSource for ScriptedFeed {
    async fn fetch_mentions(
        &self,
        asset_tag: &str,
        since: Option<&FeedCursor>,
        _limit: usize,
    ) -> Result<FeedPage, FeedError> {
        self.calls
            .lock()
            .unwrap()
            .push((asset_tag.to_string(), since.cloned()));
        self.script
            .lock()
            .unwrap()
            .get_mut(asset_tag)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| Ok(FeedPage::default()))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// Scorer
// ---------------------------------------------------------------------------

/// Scores "bear" texts negative and everything else positive; texts
/// mentioning "pnl" also yield a PNL-card signal. Texts registered with
/// `fail_times` fail that many calls first; `u32::MAX` means always.
#[derive(Default)]
pub struct FlakyScorer {
    fail_plan: Mutex<HashMap<String, u32>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl FlakyScorer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_times(&self, text: &str, n: u32) {
        self.fail_plan.lock().unwrap().insert(text.to_string(), n);
    }

    pub fn calls_for(&self, text: &str) -> u32 {
        self.calls.lock().unwrap().get(text).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl ScoringPort for FlakyScorer {
    async fn score(&self, input: &ScoringInput) -> Result<Vec<SignalDraft>, ScoringError> {
        let text = input.text.clone().unwrap_or_default();
        let n = {
            let mut calls = self.calls.lock().unwrap();
            let c = calls.entry(text.clone()).or_insert(0);
            *c += 1;
            *c
        };
        let plan = self.fail_plan.lock().unwrap().get(&text).copied().unwrap_or(0);
        if n <= plan {
            return Err(ScoringError::Unavailable("model down".into()));
        }
        let label = if text.contains("bear") {
            "negative"
        } else {
            "positive"
        };
        let mut drafts = vec![SignalDraft::new(SignalKind::Sentiment, label, 0.9)];
        if text.contains("pnl") {
            drafts.push(
                SignalDraft::new(SignalKind::PnlExtraction, "SOL", 0.8)
                    .with_field("pnl_percentage", 42.0),
            );
        }
        Ok(drafts)
    }

    fn version(&self) -> &str {
        "flaky-1"
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Delegates to an in-memory store unless a failure switch is on.
pub struct FailingStore {
    pub inner: Arc<MemorySignalStore>,
    pub fail_mentions: AtomicBool,
    pub fail_signals: AtomicBool,
    pub fail_reads: AtomicBool,
    /// Let this many mention appends through before failing (when armed).
    pub mention_allowance: AtomicUsize,
}

impl FailingStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemorySignalStore::new()),
            fail_mentions: AtomicBool::new(false),
            fail_signals: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            mention_allowance: AtomicUsize::new(0),
        }
    }

    fn down() -> StoreError {
        StoreError::Unavailable("disk on fire".into())
    }

    fn check_reads(&self) -> StoreResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Self::down());
        }
        Ok(())
    }

    fn check_mention_write(&self) -> StoreResult<()> {
        if self.fail_mentions.load(Ordering::SeqCst) {
            let left = self.mention_allowance.load(Ordering::SeqCst);
            if left == 0 {
                return Err(Self::down());
            }
            self.mention_allowance.store(left - 1, Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn heal(&self) {
        self.fail_mentions.store(false, Ordering::SeqCst);
        self.fail_signals.store(false, Ordering::SeqCst);
        self.fail_reads.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalStore for FailingStore {
    async fn append_mention(
        &self,
        mention: &Mention,
        scoring: ScoringStatus,
    ) -> StoreResult<MentionAppend> {
        self.check_mention_write()?;
        self.inner.append_mention(mention, scoring).await
    }

    async fn append_signal(&self, signal: NewSignal) -> StoreResult<Signal> {
        if self.fail_signals.load(Ordering::SeqCst) {
            return Err(Self::down());
        }
        self.inner.append_signal(signal).await
    }

    /// A failing signal write rejects the whole unit; nothing reaches `inner`.
    async fn append_scored(
        &self,
        mention: &Mention,
        scoring: ScoringStatus,
        signals: Vec<NewSignal>,
    ) -> StoreResult<ScoredAppend> {
        self.check_mention_write()?;
        if !signals.is_empty() && self.fail_signals.load(Ordering::SeqCst) {
            return Err(Self::down());
        }
        self.inner.append_scored(mention, scoring, signals).await
    }

    async fn recent_signals(
        &self,
        asset_tag: &str,
        kind: SignalKind,
        limit: usize,
    ) -> StoreResult<Vec<Signal>> {
        self.check_reads()?;
        self.inner.recent_signals(asset_tag, kind, limit).await
    }

    async fn signals_after(
        &self,
        asset_tag: &str,
        after: StoreCursor,
        limit: usize,
    ) -> StoreResult<Vec<Signal>> {
        self.check_reads()?;
        self.inner.signals_after(asset_tag, after, limit).await
    }

    async fn mentions_after(
        &self,
        asset_tag: &str,
        after: StoreCursor,
        limit: usize,
    ) -> StoreResult<Vec<StoredMention>> {
        self.check_reads()?;
        self.inner.mentions_after(asset_tag, after, limit).await
    }

    async fn get_signal(&self, id: SignalId) -> StoreResult<Option<Signal>> {
        self.check_reads()?;
        self.inner.get_signal(id).await
    }

    async fn recent_source_ids(&self, since: DateTime<Utc>) -> StoreResult<Vec<DedupRecord>> {
        self.check_reads()?;
        self.inner.recent_source_ids(since).await
    }

    async fn load_cursor(&self, asset_tag: &str) -> StoreResult<Option<FeedCursor>> {
        self.inner.load_cursor(asset_tag).await
    }

    async fn save_cursor(&self, asset_tag: &str, cursor: &FeedCursor) -> StoreResult<()> {
        self.inner.save_cursor(asset_tag, cursor).await
    }

    async fn track_asset(&self, asset_tag: &str, requested_at: DateTime<Utc>) -> StoreResult<bool> {
        self.inner.track_asset(asset_tag, requested_at).await
    }

    async fn tracked_assets(&self) -> StoreResult<Vec<String>> {
        self.inner.tracked_assets().await
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Fast test config: tiny backoff, SOL tracked by default.
pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        scoring_backoff_base_ms: 10,
        scoring_backoff_max_ms: 80,
        ..PipelineConfig::default()
    }
}

pub fn scheduler(
    cfg: PipelineConfig,
    clock: &ManualClock,
    feed: Arc<ScriptedFeed>,
    scorer: Arc<FlakyScorer>,
    store: Arc<dyn SignalStore>,
) -> IngestionScheduler {
    let deps = SchedulerDeps::from_config(&cfg, Arc::new(clock.clone()), feed, scorer, store);
    IngestionScheduler::new(cfg, deps)
}
