// src/ingest/scheduler.rs
//! Tick-driven ingestion state machine.
//!
//! `Idle → BudgetCheck → Fetching → Filtering → Scoring → Persisting →
//! Aggregating → Idle`. Ticks never overlap (a tick-wide async lock), and
//! the stop signal is only looked at between ticks, so a halt never lands
//! between admission and persistence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::stream::{self, StreamExt};
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::analyze::{DynScorer, ScoringInput};
use crate::clock::SharedClock;
use crate::config::PipelineConfig;
use crate::error::{FeedError, StoreError, TickError};
use crate::ingest::budget::RateBudget;
use crate::ingest::dedup::Deduplicator;
use crate::ingest::types::{FeedCursor, FeedSource};
use crate::metrics::ensure_described;
use crate::model::{
    canonical_asset_tag, Mention, MentionId, NewSignal, ScoringStatus, Signal, SignalDraft,
    StoredMention,
};
use crate::store::{DynStore, MentionAppend, ScoredAppend};
use crate::trend::TrendEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickPhase {
    Idle,
    BudgetCheck,
    Fetching,
    Filtering,
    Scoring,
    Persisting,
    Aggregating,
}

/// What one tick did. Returned even when the tick was skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub batch_id: String,
    /// Budget refused before any fetch; nothing else happened.
    pub skipped: bool,
    pub rate_limited: bool,
    pub assets_fetched: Vec<String>,
    pub assets_failed: Vec<String>,
    pub fetched: usize,
    pub duplicates: usize,
    pub persisted_mentions: usize,
    pub persisted_signals: usize,
    pub scoring_exhausted: usize,
    pub aggregation_failed: bool,
}

/// Components the scheduler drives. Owned elsewhere and shared, so tests
/// and the repository can hold the same instances.
#[derive(Clone)]
pub struct SchedulerDeps {
    pub clock: SharedClock,
    pub feed: Arc<dyn FeedSource>,
    pub scorer: DynScorer,
    pub store: DynStore,
    pub budget: Arc<RateBudget>,
    pub dedup: Arc<Deduplicator>,
    pub trends: Arc<TrendEngine>,
}

impl SchedulerDeps {
    /// Build budget, dedup and trend engine from the sanitized `cfg`.
    pub fn from_config(
        cfg: &PipelineConfig,
        clock: SharedClock,
        feed: Arc<dyn FeedSource>,
        scorer: DynScorer,
        store: DynStore,
    ) -> Self {
        let cfg = &cfg.clone().sanitized();
        Self {
            budget: Arc::new(RateBudget::new(
                clock.clone(),
                cfg.rate_limit_calls,
                cfg.rate_limit_window(),
            )),
            dedup: Arc::new(Deduplicator::new(clock.clone(), cfg.dedup_retention())),
            trends: Arc::new(TrendEngine::from_config(clock.clone(), cfg)),
            clock,
            feed,
            scorer,
            store,
        }
    }
}

struct Fetched {
    asset: String,
    mentions: Vec<Mention>,
    next_cursor: Option<FeedCursor>,
}

struct Scored {
    mention: Mention,
    status: ScoringStatus,
    drafts: Vec<SignalDraft>,
}

pub struct IngestionScheduler {
    cfg: PipelineConfig,
    deps: SchedulerDeps,
    tick_lock: tokio::sync::Mutex<()>,
    phase: Mutex<TickPhase>,
    batch_seq: AtomicU64,
}

impl IngestionScheduler {
    pub fn new(cfg: PipelineConfig, deps: SchedulerDeps) -> Self {
        ensure_described();
        Self {
            cfg: cfg.sanitized(),
            deps,
            tick_lock: tokio::sync::Mutex::new(()),
            phase: Mutex::new(TickPhase::Idle),
            batch_seq: AtomicU64::new(0),
        }
    }

    pub fn deps(&self) -> &SchedulerDeps {
        &self.deps
    }

    pub fn phase(&self) -> TickPhase {
        *self.phase.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_phase(&self, p: TickPhase) {
        *self.phase.lock().unwrap_or_else(|p| p.into_inner()) = p;
    }

    /// Startup recovery: seed dedup from recent history and rebuild trend
    /// aggregates for every tracked asset.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let now = self.deps.clock.now();
        let recent = self
            .deps
            .store
            .recent_source_ids(now - self.cfg.dedup_retention())
            .await?;
        let warmed = recent.len();
        self.deps.dedup.warm(recent);

        for asset in self.assets().await? {
            if let Err(e) = self.deps.trends.rebuild(&self.deps.store, &asset).await {
                warn!(target: "ingest", asset = %asset, error = %e, "startup rebuild failed");
                self.deps.trends.mark_stale(&asset);
            }
        }
        info!(target: "ingest", warmed, "scheduler recovered");
        Ok(warmed)
    }

    /// Tracked assets, or the configured defaults when none were requested.
    pub async fn assets(&self) -> Result<Vec<String>, StoreError> {
        let tracked = self.deps.store.tracked_assets().await?;
        let list = if tracked.is_empty() {
            self.cfg.default_assets.clone()
        } else {
            tracked
        };
        let mut out: Vec<String> = Vec::with_capacity(list.len());
        for a in list {
            let tag = canonical_asset_tag(&a);
            if !tag.is_empty() && !out.contains(&tag) {
                out.push(tag);
            }
        }
        Ok(out)
    }

    fn backoff(&self, attempt: u32) -> std::time::Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.cfg
            .scoring_backoff_base()
            .saturating_mul(1u32 << shift)
            .min(self.cfg.scoring_backoff_max())
    }

    async fn score_with_retry(&self, mention: Mention) -> Scored {
        let input = ScoringInput::from_mention(&mention);
        let max_attempts = self.cfg.scoring_max_retries.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.deps.scorer.score(&input).await {
                Ok(drafts) => {
                    return Scored {
                        mention,
                        status: ScoringStatus::Scored { attempts: attempt },
                        drafts,
                    }
                }
                Err(e) => {
                    counter!("scoring_failures_total").increment(1);
                    let give_up = attempt >= max_attempts
                        || matches!(e, crate::error::ScoringError::InvalidInput(_));
                    if give_up {
                        counter!("scoring_exhausted_total").increment(1);
                        warn!(
                            target: "ingest",
                            source_id = %mention.source_id,
                            attempts = attempt,
                            error = %e,
                            "scoring exhausted"
                        );
                        return Scored {
                            mention,
                            status: ScoringStatus::ScoringExhausted { attempts: attempt },
                            drafts: Vec::new(),
                        };
                    }
                    let delay = self.backoff(attempt);
                    debug!(
                        target: "ingest",
                        source_id = %mention.source_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "scoring failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Persist one mention together with its signals as a single store
    /// write. Returns the stored mention and its signals only when this
    /// call inserted them.
    async fn persist_one(
        &self,
        s: &Scored,
    ) -> Result<(Option<StoredMention>, Vec<Signal>), StoreError> {
        let now = self.deps.clock.now();
        let version = self.deps.scorer.version();
        let drafts: Vec<NewSignal> = s
            .drafts
            .iter()
            .map(|d| {
                NewSignal::from_draft(d.clone(), MentionId(0), &s.mention.asset_tag, now, version)
            })
            .collect();
        let ScoredAppend { mention, signals } = self
            .deps
            .store
            .append_scored(&s.mention, s.status, drafts)
            .await?;
        match mention {
            MentionAppend::Inserted(id) => Ok((
                Some(StoredMention {
                    id,
                    mention: s.mention.clone(),
                    scoring: s.status,
                }),
                signals,
            )),
            MentionAppend::AlreadyPresent(_) => {
                debug!(target: "ingest", source_id = %s.mention.source_id, "already stored");
                Ok((None, Vec::new()))
            }
        }
    }

    /// Run one full tick. Only a persistence failure returns `Err`.
    pub async fn tick(&self) -> Result<TickReport, TickError> {
        let _tick = self.tick_lock.lock().await;
        let started = Instant::now();
        counter!("ingest_ticks_total").increment(1);

        let now = self.deps.clock.now();
        let seq = self.batch_seq.fetch_add(1, Ordering::Relaxed);
        let mut report = TickReport {
            batch_id: format!("b{}-{}", now.timestamp(), seq),
            ..TickReport::default()
        };

        let result = self.run_phases(&mut report).await;
        self.set_phase(TickPhase::Idle);

        let ms = started.elapsed().as_secs_f64() * 1_000.0;
        histogram!("ingest_tick_ms").record(ms);
        gauge!("ingest_last_tick_ts").set(self.deps.clock.now().timestamp() as f64);

        result.map(|()| {
            info!(
                target: "ingest",
                batch = %report.batch_id,
                skipped = report.skipped,
                fetched = report.fetched,
                duplicates = report.duplicates,
                persisted = report.persisted_mentions,
                signals = report.persisted_signals,
                exhausted = report.scoring_exhausted,
                ms = ms as u64,
                "ingest tick"
            );
            report
        })
    }

    async fn run_phases(&self, report: &mut TickReport) -> Result<(), TickError> {
        let assets = self.assets().await.map_err(TickError::Persistence)?;

        // BudgetCheck + Fetching, one metered call per asset.
        let mut batches: Vec<Fetched> = Vec::new();
        let mut attempted = 0usize;
        for asset in &assets {
            self.set_phase(TickPhase::BudgetCheck);
            if !self.deps.budget.try_consume(1) {
                debug!(target: "ingest", asset = %asset, "rate budget spent; stopping fetch");
                break;
            }
            attempted += 1;

            self.set_phase(TickPhase::Fetching);
            let since = self
                .deps
                .store
                .load_cursor(asset)
                .await
                .map_err(TickError::Persistence)?;
            match self
                .deps
                .feed
                .fetch_mentions(asset, since.as_ref(), self.cfg.fetch_limit)
                .await
            {
                Ok(page) => {
                    let mut mentions = page.mentions;
                    for m in &mut mentions {
                        m.asset_tag = asset.clone();
                        m.fetch_batch_id = report.batch_id.clone();
                    }
                    report.fetched += mentions.len();
                    report.assets_fetched.push(asset.clone());
                    batches.push(Fetched {
                        asset: asset.clone(),
                        mentions,
                        next_cursor: page.next_cursor,
                    });
                }
                Err(FeedError::RateLimited { reset_at }) => {
                    counter!("ingest_rate_limited_total").increment(1);
                    warn!(target: "ingest", asset = %asset, feed = self.deps.feed.name(), "feed rate limited");
                    self.deps.budget.exhaust(reset_at);
                    report.rate_limited = true;
                    report.assets_failed.push(asset.clone());
                    break;
                }
                Err(e @ FeedError::Transient(_)) => {
                    counter!("ingest_provider_errors_total").increment(1);
                    warn!(target: "ingest", asset = %asset, feed = self.deps.feed.name(), error = %e, "fetch failed; asset skipped");
                    report.assets_failed.push(asset.clone());
                }
            }
        }

        if attempted == 0 && !assets.is_empty() {
            counter!("ingest_ticks_skipped_total").increment(1);
            report.skipped = true;
            return Ok(());
        }
        counter!("ingest_fetched_total").increment(report.fetched as u64);

        // Filtering: admission before any scoring work is dispatched.
        self.set_phase(TickPhase::Filtering);
        let mut admitted: Vec<Mention> = Vec::new();
        for b in &batches {
            for m in &b.mentions {
                if self.deps.dedup.admit(&m.source_id) {
                    admitted.push(m.clone());
                } else {
                    report.duplicates += 1;
                }
            }
        }
        counter!("ingest_dedup_total").increment(report.duplicates as u64);

        // Scoring, bounded fan-out. Results are put back in fetch order.
        self.set_phase(TickPhase::Scoring);
        let mut scored: Vec<(usize, Scored)> = stream::iter(admitted.into_iter().enumerate())
            .map(|(i, m)| async move { (i, self.score_with_retry(m).await) })
            .buffer_unordered(self.cfg.worker_pool_size.max(1))
            .collect()
            .await;
        scored.sort_by_key(|(i, _)| *i);
        let scored: Vec<Scored> = scored.into_iter().map(|(_, s)| s).collect();
        report.scoring_exhausted = scored.iter().filter(|s| s.status.is_exhausted()).count();

        // Persisting: all or redrive.
        self.set_phase(TickPhase::Persisting);
        let mut new_mentions: Vec<StoredMention> = Vec::new();
        let mut new_signals: Vec<Signal> = Vec::new();
        for (i, s) in scored.iter().enumerate() {
            match self.persist_one(s).await {
                Ok((stored, signals)) => {
                    new_mentions.extend(stored);
                    new_signals.extend(signals);
                }
                Err(e) => {
                    for rest in &scored[i..] {
                        self.deps.dedup.revoke(&rest.mention.source_id);
                    }
                    // Mentions written before the failure stay admitted, so
                    // they are aggregated now or never.
                    if let Err(e) = self.deps.trends.apply_batch(&new_mentions, &new_signals) {
                        warn!(target: "ingest", error = %e, "trend aggregation failed; marking stale");
                        for b in &batches {
                            self.deps.trends.mark_stale(&b.asset);
                        }
                    }
                    counter!("store_persist_failures_total").increment(1);
                    error!(
                        target: "ingest",
                        batch = %report.batch_id,
                        source_id = %s.mention.source_id,
                        unpersisted = scored.len() - i,
                        error = %e,
                        "persist failed; tick aborted, batch will be redriven"
                    );
                    return Err(TickError::Persistence(e));
                }
            }
        }
        report.persisted_mentions = new_mentions.len();
        report.persisted_signals = new_signals.len();

        for b in &batches {
            if let Some(cursor) = &b.next_cursor {
                if let Err(e) = self.deps.store.save_cursor(&b.asset, cursor).await {
                    counter!("store_persist_failures_total").increment(1);
                    error!(target: "ingest", asset = %b.asset, error = %e, "cursor save failed");
                    return Err(TickError::Persistence(e));
                }
            }
        }

        // Aggregating: best effort; a failure leaves the asset stale.
        self.set_phase(TickPhase::Aggregating);
        if let Err(e) = self.deps.trends.apply_batch(&new_mentions, &new_signals) {
            report.aggregation_failed = true;
            warn!(target: "ingest", error = %e, "trend aggregation failed; marking stale");
            for b in &batches {
                self.deps.trends.mark_stale(&b.asset);
            }
        }

        Ok(())
    }

    /// Tick every `poll_interval` until `stop` turns true. A running tick is
    /// always allowed to finish.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.cfg.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            match self.tick().await {
                Ok(report) if !report.skipped => match self.deps.trends.rank(5) {
                    Ok(top) => {
                        let tags: Vec<String> = top
                            .iter()
                            .map(|t| format!("{}:{:.3}", t.asset_tag, t.trend_score))
                            .collect();
                        info!(target: "trend", top = ?tags, "ranking");
                    }
                    Err(e) => warn!(target: "trend", error = %e, "ranking failed"),
                },
                Ok(_) => {}
                Err(e) => error!(target: "ingest", error = %e, "tick failed"),
            }
        }
        info!(target: "ingest", "scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::ScoringPort;
    use crate::clock::{Clock, ManualClock};
    use crate::error::ScoringError;
    use crate::ingest::types::FeedPage;
    use crate::model::SignalKind;
    use crate::store::{MemorySignalStore, SignalStore};
    use async_trait::async_trait;

    struct OneShotFeed(Vec<Mention>);

    #[async_trait]
    impl FeedSource for OneShotFeed {
        async fn fetch_mentions(
            &self,
            _asset_tag: &str,
            _since: Option<&FeedCursor>,
            _limit: usize,
        ) -> Result<FeedPage, FeedError> {
            Ok(FeedPage {
                mentions: self.0.clone(),
                next_cursor: Some(FeedCursor("9".into())),
            })
        }

        fn name(&self) -> &'static str {
            "one-shot"
        }
    }

    struct Bullish;

    #[async_trait]
    impl ScoringPort for Bullish {
        async fn score(&self, _input: &ScoringInput) -> Result<Vec<SignalDraft>, ScoringError> {
            Ok(vec![SignalDraft::new(SignalKind::Sentiment, "positive", 0.8)])
        }

        fn version(&self) -> &str {
            "bullish-1"
        }
    }

    fn mention(id: &str, at: chrono::DateTime<chrono::Utc>) -> Mention {
        Mention {
            source_id: id.into(),
            asset_tag: "SOL".into(),
            author_handle: "anon".into(),
            body_text: "bullish af".into(),
            media_refs: vec![],
            observed_at: at,
            fetch_batch_id: String::new(),
        }
    }

    fn scheduler(feed: Vec<Mention>, clock: &ManualClock) -> (IngestionScheduler, Arc<MemorySignalStore>) {
        let store = Arc::new(MemorySignalStore::new());
        let cfg = PipelineConfig::default();
        let deps = SchedulerDeps::from_config(
            &cfg,
            Arc::new(clock.clone()),
            Arc::new(OneShotFeed(feed)),
            Arc::new(Bullish),
            store.clone(),
        );
        (IngestionScheduler::new(cfg, deps), store)
    }

    #[tokio::test]
    async fn tick_persists_scores_and_aggregates() {
        let clock = ManualClock::at_epoch();
        let now = clock.now();
        let (s, store) = scheduler(vec![mention("1", now), mention("2", now)], &clock);

        let r = s.tick().await.unwrap();
        assert_eq!(r.persisted_mentions, 2);
        assert_eq!(r.persisted_signals, 2);
        assert_eq!(s.phase(), TickPhase::Idle);
        assert_eq!(store.load_cursor("SOL").await.unwrap(), Some(FeedCursor("9".into())));

        let t = s.deps().trends.trend("SOL").unwrap().unwrap();
        assert_eq!(t.mention_count, 2);
        assert!((t.mean_sentiment - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn second_tick_drops_redelivered_mentions() {
        let clock = ManualClock::at_epoch();
        let (s, store) = scheduler(vec![mention("1", clock.now())], &clock);
        s.tick().await.unwrap();
        let r = s.tick().await.unwrap();
        assert_eq!(r.duplicates, 1);
        assert_eq!(r.persisted_mentions, 0);
        assert_eq!(store.mention_count(), 1);
    }

    #[tokio::test]
    async fn mention_already_in_store_is_not_aggregated() {
        let clock = ManualClock::at_epoch();
        let now = clock.now();
        let (s, store) = scheduler(vec![mention("1", now)], &clock);
        store
            .append_mention(&mention("1", now), ScoringStatus::Scored { attempts: 1 })
            .await
            .unwrap();

        let r = s.tick().await.unwrap();
        assert_eq!(r.duplicates, 0);
        assert_eq!(r.persisted_mentions, 0);
        assert_eq!(r.persisted_signals, 0);
        assert_eq!(store.signal_count(), 0);
        assert!(s.deps().trends.trend("SOL").unwrap().is_none());
    }

    #[test]
    fn zero_budget_window_from_config_still_limits() {
        let clock = ManualClock::at_epoch();
        let cfg = PipelineConfig {
            rate_limit_calls: 1,
            rate_limit_window_secs: 0,
            ..PipelineConfig::default()
        };
        let deps = SchedulerDeps::from_config(
            &cfg,
            Arc::new(clock.clone()),
            Arc::new(OneShotFeed(vec![])),
            Arc::new(Bullish),
            Arc::new(MemorySignalStore::new()),
        );
        assert!(deps.budget.try_consume(1));
        assert!(!deps.budget.try_consume(1));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let clock = ManualClock::at_epoch();
        let (s, _) = scheduler(vec![], &clock);
        let ms = |n| s.backoff(n).as_millis();
        assert_eq!(ms(1), 500);
        assert_eq!(ms(2), 1_000);
        assert_eq!(ms(3), 2_000);
        assert_eq!(ms(30), 30_000);
    }

    #[tokio::test]
    async fn empty_tracking_falls_back_to_defaults() {
        let clock = ManualClock::at_epoch();
        let (s, store) = scheduler(vec![], &clock);
        assert_eq!(s.assets().await.unwrap(), vec!["SOL".to_string()]);
        store.track_asset("$jup", clock.now()).await.unwrap();
        assert_eq!(s.assets().await.unwrap(), vec!["JUP".to_string()]);
    }
}
