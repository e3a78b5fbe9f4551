//! # Trend engine
//! Live per-asset aggregates over a bucketed trailing window, and the
//! ranking built on them.
//!
//! Each asset's aggregate is an immutable snapshot behind an `Arc`. Writers
//! clone the snapshot, apply their updates, and swap the new `Arc` in under
//! a short write lock, so readers always observe a whole tick or none of it.
//! Writers are serialised by a separate gate and never hold the map lock
//! while doing work.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Duration, Utc};
use futures::TryStreamExt;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::PipelineConfig;
use crate::error::TrendError;
use crate::model::{AssetTrend, Signal, StoredMention};
use crate::rolling::BucketedWindow;
use crate::store::{mentions_since, signals_since, DynStore};

/// Composite score weights: `delta * volume + mean * sentiment`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendWeights {
    pub volume: f64,
    pub sentiment: f64,
}

impl Default for TrendWeights {
    fn default() -> Self {
        Self {
            volume: 1.0,
            sentiment: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
struct AssetAggregate {
    window: BucketedWindow,
    /// Bumped by every incremental commit; lets a rebuild detect that it
    /// raced with live ingestion.
    revision: u64,
    aggregated_at: DateTime<Utc>,
}

pub struct TrendEngine {
    clock: SharedClock,
    window: Duration,
    bucket: Duration,
    weights: TrendWeights,
    assets: RwLock<HashMap<String, Arc<AssetAggregate>>>,
    stale: Mutex<HashSet<String>>,
    write_gate: Mutex<()>,
}

impl TrendEngine {
    pub fn new(clock: SharedClock, window: Duration, bucket: Duration, weights: TrendWeights) -> Self {
        Self {
            clock,
            window,
            bucket,
            weights,
            assets: RwLock::new(HashMap::new()),
            stale: Mutex::new(HashSet::new()),
            write_gate: Mutex::new(()),
        }
    }

    pub fn from_config(clock: SharedClock, cfg: &PipelineConfig) -> Self {
        Self::new(
            clock,
            cfg.trend_window(),
            cfg.trend_bucket(),
            TrendWeights {
                volume: cfg.trend_weight_volume,
                sentiment: cfg.trend_weight_sentiment,
            },
        )
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn gate(&self) -> Result<MutexGuard<'_, ()>, TrendError> {
        self.write_gate.lock().map_err(|_| TrendError::LockPoisoned)
    }

    fn snapshot(&self, asset_tag: &str) -> Result<Option<Arc<AssetAggregate>>, TrendError> {
        let map = self.assets.read().map_err(|_| TrendError::LockPoisoned)?;
        Ok(map.get(asset_tag).cloned())
    }

    fn install(&self, asset_tag: &str, agg: AssetAggregate) -> Result<(), TrendError> {
        let mut map = self.assets.write().map_err(|_| TrendError::LockPoisoned)?;
        map.insert(asset_tag.to_string(), Arc::new(agg));
        Ok(())
    }

    fn empty_aggregate(&self, now: DateTime<Utc>) -> AssetAggregate {
        AssetAggregate {
            window: BucketedWindow::new(self.window, self.bucket),
            revision: 0,
            aggregated_at: now,
        }
    }

    /// Clone-modify-swap for one asset.
    fn commit<F>(&self, asset_tag: &str, apply: F) -> Result<(), TrendError>
    where
        F: FnOnce(&mut BucketedWindow, DateTime<Utc>),
    {
        let _gate = self.gate()?;
        let now = self.clock.now();
        let mut agg = match self.snapshot(asset_tag)? {
            Some(cur) => (*cur).clone(),
            None => self.empty_aggregate(now),
        };
        apply(&mut agg.window, now);
        agg.window.prune(now);
        agg.revision += 1;
        agg.aggregated_at = now;
        self.install(asset_tag, agg)
    }

    /// Fold one signal into its asset's live aggregate. Only sentiment
    /// signals with a known label move the mean.
    pub fn ingest(&self, signal: &Signal) -> Result<(), TrendError> {
        let Some(value) = signal.sentiment_value() else {
            return Ok(());
        };
        self.commit(&signal.asset_tag, |w, now| {
            w.record_sentiment(signal.computed_at, value, now);
        })
    }

    /// Count one persisted mention toward volume, scored or not.
    pub fn record_mention(&self, mention: &StoredMention) -> Result<(), TrendError> {
        self.commit(&mention.mention.asset_tag, |w, now| {
            w.record_mention(mention.mention.observed_at, now);
        })
    }

    /// Apply one tick's persisted output, committing each asset atomically.
    pub fn apply_batch(&self, mentions: &[StoredMention], signals: &[Signal]) -> Result<(), TrendError> {
        let mut by_asset: HashMap<&str, (Vec<&StoredMention>, Vec<&Signal>)> = HashMap::new();
        for m in mentions {
            by_asset.entry(m.mention.asset_tag.as_str()).or_default().0.push(m);
        }
        for s in signals {
            by_asset.entry(s.asset_tag.as_str()).or_default().1.push(s);
        }

        for (asset, (ms, ss)) in by_asset {
            self.commit(asset, |w, now| {
                for m in &ms {
                    w.record_mention(m.mention.observed_at, now);
                }
                for s in &ss {
                    if let Some(v) = s.sentiment_value() {
                        w.record_sentiment(s.computed_at, v, now);
                    }
                }
            })?;
        }
        Ok(())
    }

    /// Recompute `asset_tag` from the store, replaying both windows.
    pub async fn rebuild(&self, store: &DynStore, asset_tag: &str) -> Result<AssetTrend, TrendError> {
        let start_revision = self.snapshot(asset_tag)?.map(|a| a.revision).unwrap_or(0);
        let now = self.clock.now();
        let since = now - self.window * 2;
        let mut agg = self.empty_aggregate(now);

        let mut mentions = mentions_since(store.clone(), asset_tag, since);
        let mut replayed_mentions = 0u64;
        while let Some(m) = mentions.try_next().await? {
            agg.window.record_mention(m.mention.observed_at, now);
            replayed_mentions += 1;
        }

        let mut signals = signals_since(store.clone(), asset_tag, since);
        let mut replayed_signals = 0u64;
        while let Some(s) = signals.try_next().await? {
            if let Some(v) = s.sentiment_value() {
                agg.window.record_sentiment(s.computed_at, v, now);
            }
            replayed_signals += 1;
        }

        let trend = self.trend_of(asset_tag, &agg.window, now);
        {
            let _gate = self.gate()?;
            let current = self.snapshot(asset_tag)?.map(|a| a.revision).unwrap_or(0);
            let raced = current != start_revision;
            agg.revision = current + 1;
            self.install(asset_tag, agg)?;
            if raced {
                // Live commits landed mid-replay; serve this but redo it on next read.
                warn!(target: "trend", asset = %asset_tag, "rebuild raced with ingestion; left stale");
                self.mark_stale(asset_tag);
            } else {
                self.clear_stale(asset_tag);
            }
        }

        counter!("trend_rebuilds_total").increment(1);
        info!(
            target: "trend",
            asset = %asset_tag,
            mentions = replayed_mentions,
            signals = replayed_signals,
            score = trend.trend_score,
            "rebuilt aggregate"
        );
        Ok(trend)
    }

    fn trend_of(&self, asset_tag: &str, window: &BucketedWindow, now: DateTime<Utc>) -> AssetTrend {
        let s = window.summary(now);
        let delta = s.volume_delta();
        AssetTrend {
            asset_tag: asset_tag.to_string(),
            window_start: s.window_start,
            window_end: s.window_end,
            mention_count: s.mention_count,
            mean_sentiment: s.mean_sentiment,
            volume_delta_vs_prior_window: delta,
            trend_score: delta * self.weights.volume + s.mean_sentiment * self.weights.sentiment,
        }
    }

    /// Current trend for one asset, or `None` if nothing was ever aggregated.
    pub fn trend(&self, asset_tag: &str) -> Result<Option<AssetTrend>, TrendError> {
        let now = self.clock.now();
        Ok(self
            .snapshot(asset_tag)?
            .map(|agg| self.trend_of(asset_tag, &agg.window, now)))
    }

    /// Top `top_k` assets by composite score; ties go to the higher mention
    /// count, then the lexicographically smaller tag.
    pub fn rank(&self, top_k: usize) -> Result<Vec<AssetTrend>, TrendError> {
        let now = self.clock.now();
        let snapshots: Vec<(String, Arc<AssetAggregate>)> = {
            let map = self.assets.read().map_err(|_| TrendError::LockPoisoned)?;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut rows: Vec<AssetTrend> = snapshots
            .iter()
            .filter_map(|(tag, agg)| {
                let s = agg.window.summary(now);
                let active =
                    s.mention_count > 0 || s.prior_mention_count > 0 || s.sentiment_samples > 0;
                active.then(|| self.trend_of(tag, &agg.window, now))
            })
            .collect();

        rows.sort_by(|a, b| {
            b.trend_score
                .total_cmp(&a.trend_score)
                .then_with(|| b.mention_count.cmp(&a.mention_count))
                .then_with(|| a.asset_tag.cmp(&b.asset_tag))
        });
        rows.truncate(top_k);
        debug!(target: "trend", returned = rows.len(), "ranked");
        Ok(rows)
    }

    /// Flag an asset whose live aggregate can no longer be trusted.
    pub fn mark_stale(&self, asset_tag: &str) {
        let mut stale = self.stale.lock().unwrap_or_else(|p| p.into_inner());
        stale.insert(asset_tag.to_string());
    }

    fn clear_stale(&self, asset_tag: &str) {
        let mut stale = self.stale.lock().unwrap_or_else(|p| p.into_inner());
        stale.remove(asset_tag);
    }

    pub fn is_stale(&self, asset_tag: &str) -> bool {
        let stale = self.stale.lock().unwrap_or_else(|p| p.into_inner());
        stale.contains(asset_tag)
    }

    /// When the asset's aggregate was last committed.
    pub fn aggregated_at(&self, asset_tag: &str) -> Result<Option<DateTime<Utc>>, TrendError> {
        Ok(self.snapshot(asset_tag)?.map(|a| a.aggregated_at))
    }

    /// Assets with a live aggregate, sorted.
    pub fn assets(&self) -> Result<Vec<String>, TrendError> {
        let map = self.assets.read().map_err(|_| TrendError::LockPoisoned)?;
        let mut tags: Vec<String> = map.keys().cloned().collect();
        tags.sort();
        Ok(tags)
    }
}
