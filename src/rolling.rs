//! # Bucketed rolling window
//! Per-asset mention volume and sentiment over a trailing window.
//!
//! Time is cut into fixed buckets (`floor(ts / bucket_secs)`). Each bucket
//! keeps a mention count and a running sentiment mean; updates touch one
//! bucket only. Two windows' worth of buckets are retained (current + prior,
//! for the volume delta) and anything older is dropped wholesale.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

/// One time bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Bucket {
    pub mentions: u64,
    /// Number of sentiment samples folded into `mean`.
    pub samples: u64,
    pub mean: f64,
}

impl Bucket {
    /// Welford-style running mean update.
    fn push_sentiment(&mut self, value: f64) {
        self.samples += 1;
        self.mean += (value - self.mean) / self.samples as f64;
    }
}

/// Aggregate over the current and prior windows as seen at some instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSummary {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub mention_count: u64,
    pub prior_mention_count: u64,
    /// Sample-weighted mean over the current window; 0 when no samples.
    pub mean_sentiment: f64,
    pub sentiment_samples: u64,
}

impl WindowSummary {
    /// `(current - prior) / (prior + 1)`; finite even when the prior window
    /// is empty.
    pub fn volume_delta(&self) -> f64 {
        (self.mention_count as f64 - self.prior_mention_count as f64)
            / (self.prior_mention_count as f64 + 1.0)
    }
}

#[derive(Debug, Clone)]
pub struct BucketedWindow {
    bucket_secs: i64,
    window_buckets: i64,
    buckets: BTreeMap<i64, Bucket>,
}

impl BucketedWindow {
    /// `bucket` is clamped to at least one second and the window to at least
    /// one bucket.
    pub fn new(window: Duration, bucket: Duration) -> Self {
        let bucket_secs = bucket.num_seconds().max(1);
        let window_buckets = (window.num_seconds() / bucket_secs).max(1);
        Self {
            bucket_secs,
            window_buckets,
            buckets: BTreeMap::new(),
        }
    }

    pub fn bucket_index(&self, ts: DateTime<Utc>) -> i64 {
        ts.timestamp().div_euclid(self.bucket_secs)
    }

    fn bucket_start(&self, idx: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(idx.saturating_mul(self.bucket_secs), 0).unwrap_or_default()
    }

    /// Oldest bucket index still retained at `now`.
    fn horizon(&self, now: DateTime<Utc>) -> i64 {
        self.bucket_index(now) - 2 * self.window_buckets + 1
    }

    /// Returns false when `ts` is already outside both windows.
    pub fn record_mention(&mut self, ts: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let idx = self.bucket_index(ts);
        if idx < self.horizon(now) {
            return false;
        }
        self.buckets.entry(idx).or_default().mentions += 1;
        true
    }

    pub fn record_sentiment(&mut self, ts: DateTime<Utc>, value: f64, now: DateTime<Utc>) -> bool {
        let idx = self.bucket_index(ts);
        if idx < self.horizon(now) || !value.is_finite() {
            return false;
        }
        self.buckets.entry(idx).or_default().push_sentiment(value);
        true
    }

    /// Drop every bucket older than the retained horizon.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = self.horizon(now);
        self.buckets = self.buckets.split_off(&horizon);
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn summary(&self, now: DateTime<Utc>) -> WindowSummary {
        let now_idx = self.bucket_index(now);
        let cur_lo = now_idx - self.window_buckets + 1;
        let prior_lo = cur_lo - self.window_buckets;

        let mut mention_count = 0u64;
        let mut prior_mention_count = 0u64;
        let mut samples = 0u64;
        let mut weighted = 0.0f64;

        for (&idx, b) in self.buckets.range(prior_lo..=now_idx) {
            if idx >= cur_lo {
                mention_count += b.mentions;
                samples += b.samples;
                weighted += b.mean * b.samples as f64;
            } else {
                prior_mention_count += b.mentions;
            }
        }

        WindowSummary {
            window_start: self.bucket_start(cur_lo),
            window_end: self.bucket_start(now_idx + 1),
            mention_count,
            prior_mention_count,
            mean_sentiment: if samples > 0 {
                weighted / samples as f64
            } else {
                0.0
            },
            sentiment_samples: samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_704_067_200 + secs, 0).unwrap()
    }

    fn window() -> BucketedWindow {
        // 4h window of 1h buckets.
        BucketedWindow::new(Duration::hours(4), Duration::hours(1))
    }

    #[test]
    fn running_mean_matches_plain_average() {
        let mut w = window();
        let now = t(0);
        for v in [1.0, -0.5, 0.25, 0.75] {
            assert!(w.record_sentiment(now, v, now));
        }
        let s = w.summary(now);
        assert_eq!(s.sentiment_samples, 4);
        assert!((s.mean_sentiment - 0.375).abs() < 1e-12);
    }

    #[test]
    fn mean_is_sample_weighted_across_buckets() {
        let mut w = window();
        let now = t(3 * 3600);
        w.record_sentiment(t(0), 1.0, now);
        w.record_sentiment(t(3600), -1.0, now);
        w.record_sentiment(t(3600), -1.0, now);
        w.record_sentiment(t(3600), -1.0, now);
        let s = w.summary(now);
        assert!((s.mean_sentiment - (-0.5)).abs() < 1e-12);
    }

    #[test]
    fn old_buckets_move_to_prior_then_drop() {
        let mut w = window();
        w.record_mention(t(0), t(0));
        w.record_mention(t(0), t(0));

        let s = w.summary(t(0));
        assert_eq!((s.mention_count, s.prior_mention_count), (2, 0));

        // Five hours later the bucket sits in the prior window.
        let later = t(5 * 3600);
        let s = w.summary(later);
        assert_eq!((s.mention_count, s.prior_mention_count), (0, 2));
        assert!((s.volume_delta() - (-2.0 / 3.0)).abs() < 1e-12);

        // Nine hours later it is beyond both windows.
        let much_later = t(9 * 3600);
        w.prune(much_later);
        assert!(w.is_empty());
        assert!(!w.record_mention(t(0), much_later));
    }

    #[test]
    fn window_bounds_align_to_buckets() {
        let w = window();
        let s = w.summary(t(90 * 60));
        assert_eq!(s.window_end, t(2 * 3600));
        assert_eq!(s.window_start, t(-2 * 3600));
    }

    #[test]
    fn non_finite_sentiment_is_ignored() {
        let mut w = window();
        assert!(!w.record_sentiment(t(0), f64::NAN, t(0)));
        assert_eq!(w.summary(t(0)).sentiment_samples, 0);
    }
}
