//! Read/request surface handed to whatever sits in front of the pipeline
//! (HTTP handlers, bots). Never blocks on an ingestion tick.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use futures::stream::BoxStream;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::anchor::{record_digest, AnchorPort, AnchorReceipt};
use crate::analyze::PnlCard;
use crate::clock::SharedClock;
use crate::error::{AnchorError, PipelineError, StoreResult};
use crate::model::{canonical_asset_tag, AssetTrend, Signal, SignalId, SignalKind};
use crate::store::{signals_since, DynStore};
use crate::trend::TrendEngine;

/// A trend plus whether it may lag the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendView {
    pub trend: AssetTrend,
    /// The last aggregation for this asset failed and could not be redone.
    pub stale: bool,
    /// When the served aggregate was last committed.
    pub as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingOutcome {
    Accepted,
    AlreadyTracked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnlCardView {
    pub signal_id: SignalId,
    pub computed_at: DateTime<Utc>,
    pub card: PnlCard,
}

/// One UTC day of sentiment for an asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySentiment {
    pub day: NaiveDate,
    pub samples: u64,
    /// Share of samples with positive polarity, 0..=1.
    pub positive_share: f64,
    pub mean_sentiment: f64,
}

pub struct Repository {
    store: DynStore,
    trends: Arc<TrendEngine>,
    clock: SharedClock,
    staleness: Duration,
    anchor: Option<Arc<dyn AnchorPort>>,
}

impl Repository {
    pub fn new(
        store: DynStore,
        trends: Arc<TrendEngine>,
        clock: SharedClock,
        staleness: Duration,
    ) -> Self {
        Self {
            store,
            trends,
            clock,
            staleness,
            anchor: None,
        }
    }

    pub fn with_anchor(mut self, anchor: Arc<dyn AnchorPort>) -> Self {
        self.anchor = Some(anchor);
        self
    }

    fn tag(raw: &str) -> Result<String, PipelineError> {
        let tag = canonical_asset_tag(raw);
        if tag.is_empty() {
            return Err(PipelineError::InvalidAsset(raw.to_string()));
        }
        Ok(tag)
    }

    /// Trend for one asset. Unknown assets are rebuilt from the store; stale
    /// ones are rebuilt once past the staleness threshold, and if that fails
    /// the last snapshot is served flagged as stale.
    pub async fn get_trend(&self, asset_tag: &str) -> Result<TrendView, PipelineError> {
        let tag = Self::tag(asset_tag)?;
        let now = self.clock.now();
        let snapshot = self.trends.trend(&tag)?;
        let as_of = self.trends.aggregated_at(&tag)?;
        let stale = self.trends.is_stale(&tag);

        let past_threshold = as_of.map_or(true, |at| now - at >= self.staleness);
        let needs_rebuild = snapshot.is_none() || (stale && past_threshold);

        if !needs_rebuild {
            if let Some(trend) = snapshot {
                return Ok(TrendView { trend, stale, as_of });
            }
        }

        match self.trends.rebuild(&self.store, &tag).await {
            Ok(trend) => Ok(TrendView {
                trend,
                stale: self.trends.is_stale(&tag),
                as_of: self.trends.aggregated_at(&tag)?,
            }),
            Err(e) => match snapshot {
                Some(trend) => {
                    warn!(target: "trend", asset = %tag, error = %e, "rebuild failed; serving last snapshot");
                    self.trends.mark_stale(&tag);
                    Ok(TrendView {
                        trend,
                        stale: true,
                        as_of,
                    })
                }
                None => Err(e.into()),
            },
        }
    }

    pub fn get_top_trending(&self, k: usize) -> Result<Vec<AssetTrend>, PipelineError> {
        Ok(self.trends.rank(k)?)
    }

    /// Lazy, ordered signals for the asset over the trailing `window`.
    pub fn get_history(
        &self,
        asset_tag: &str,
        window: Duration,
    ) -> Result<BoxStream<'static, StoreResult<Signal>>, PipelineError> {
        let tag = Self::tag(asset_tag)?;
        let since = self.clock.now() - window;
        Ok(signals_since(self.store.clone(), &tag, since))
    }

    pub async fn request_tracking(&self, asset_tag: &str) -> Result<TrackingOutcome, PipelineError> {
        let tag = Self::tag(asset_tag)?;
        let inserted = self.store.track_asset(&tag, self.clock.now()).await?;
        if inserted {
            info!(target: "ingest", asset = %tag, "tracking requested");
            Ok(TrackingOutcome::Accepted)
        } else {
            Ok(TrackingOutcome::AlreadyTracked)
        }
    }

    /// Extracted PNL cards for an asset, newest first.
    pub async fn get_pnl_cards(
        &self,
        asset_tag: &str,
        limit: usize,
    ) -> Result<Vec<PnlCardView>, PipelineError> {
        let tag = Self::tag(asset_tag)?;
        let signals = self
            .store
            .recent_signals(&tag, SignalKind::PnlExtraction, limit)
            .await?;
        Ok(signals
            .into_iter()
            .filter_map(|s| {
                PnlCard::from_signal(&s).map(|card| PnlCardView {
                    signal_id: s.id,
                    computed_at: s.computed_at,
                    card,
                })
            })
            .collect())
    }

    /// Per-day sentiment for the last `days` UTC days, today included.
    /// Days without samples are omitted.
    pub async fn get_daily_sentiment(
        &self,
        asset_tag: &str,
        days: u32,
    ) -> Result<Vec<DailySentiment>, PipelineError> {
        let tag = Self::tag(asset_tag)?;
        let today = self.clock.now().date_naive();
        let first = today - Duration::days(i64::from(days.max(1)) - 1);
        let since = first
            .and_hms_opt(0, 0, 0)
            .map(|d| d.and_utc())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        // day -> (samples, positives, sum)
        let mut acc: BTreeMap<NaiveDate, (u64, u64, f64)> = BTreeMap::new();
        let mut stream = signals_since(self.store.clone(), &tag, since);
        while let Some(s) = stream.try_next().await? {
            let Some(v) = s.sentiment_value() else {
                continue;
            };
            let e = acc.entry(s.computed_at.date_naive()).or_insert((0, 0, 0.0));
            e.0 += 1;
            if v > 0.0 {
                e.1 += 1;
            }
            e.2 += v;
        }

        Ok(acc
            .into_iter()
            .map(|(day, (n, pos, sum))| DailySentiment {
                day,
                samples: n,
                positive_share: pos as f64 / n as f64,
                mean_sentiment: sum / n as f64,
            })
            .collect())
    }

    /// Notarise one stored signal. Failures go back to the caller only.
    pub async fn anchor_signal(&self, id: SignalId) -> Result<AnchorReceipt, AnchorError> {
        let port = self.anchor.as_ref().ok_or(AnchorError::Disabled)?;
        let signal = self
            .store
            .get_signal(id)
            .await
            .map_err(AnchorError::Store)?
            .ok_or(AnchorError::NotFound(id))?;
        let digest = record_digest(&signal)?;
        let receipt = port.anchor(id, &digest).await?;
        info!(target: "anchor", signal = %id, reference = %receipt.reference, "signal anchored");
        Ok(receipt)
    }
}
