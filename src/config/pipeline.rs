// src/config/pipeline.rs
use anyhow::{anyhow, Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const ENV_PIPELINE_CONFIG_PATH: &str = "PIPELINE_CONFIG_PATH";
pub const DEFAULT_TOML_PATH: &str = "config/pipeline.toml";
pub const DEFAULT_JSON_PATH: &str = "config/pipeline.json";

/// Recognized pipeline options. Durations are whole seconds (or ms where
/// the name says so) so files stay readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub poll_interval_secs: u64,
    pub rate_limit_window_secs: u64,
    pub rate_limit_calls: u32,
    pub worker_pool_size: usize,
    /// Total scoring attempts per mention before it is marked exhausted.
    pub scoring_max_retries: u32,
    pub scoring_backoff_base_ms: u64,
    pub scoring_backoff_max_ms: u64,
    pub trend_window_secs: u64,
    pub trend_bucket_secs: u64,
    pub trend_weight_volume: f64,
    pub trend_weight_sentiment: f64,
    /// Max mentions requested per asset per fetch.
    pub fetch_limit: usize,
    /// How long the feed may redeliver an item; dedup keeps ids this long.
    pub dedup_retention_secs: u64,
    /// Reads older than this after a failed aggregation trigger a rebuild.
    pub staleness_threshold_secs: u64,
    /// Tracked when nothing has been requested yet.
    pub default_assets: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 15 * 60,
            rate_limit_window_secs: 15 * 60,
            rate_limit_calls: 60,
            worker_pool_size: 4,
            scoring_max_retries: 5,
            scoring_backoff_base_ms: 500,
            scoring_backoff_max_ms: 30_000,
            trend_window_secs: 24 * 3600,
            trend_bucket_secs: 3600,
            trend_weight_volume: 1.0,
            trend_weight_sentiment: 1.0,
            fetch_limit: 10,
            dedup_retention_secs: 7 * 24 * 3600,
            staleness_threshold_secs: 30 * 60,
            default_assets: vec!["SOL".to_string()],
        }
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_interval_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        secs(self.rate_limit_window_secs)
    }

    pub fn trend_window(&self) -> Duration {
        secs(self.trend_window_secs)
    }

    pub fn trend_bucket(&self) -> Duration {
        secs(self.trend_bucket_secs)
    }

    pub fn dedup_retention(&self) -> Duration {
        secs(self.dedup_retention_secs)
    }

    pub fn staleness_threshold(&self) -> Duration {
        secs(self.staleness_threshold_secs)
    }

    pub fn scoring_backoff_base(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.scoring_backoff_base_ms)
    }

    pub fn scoring_backoff_max(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.scoring_backoff_max_ms)
    }

    /// Clamp values into a runnable shape instead of failing startup.
    pub fn sanitized(mut self) -> Self {
        let d = Self::default();
        if self.poll_interval_secs == 0 {
            self.poll_interval_secs = 1;
        }
        if self.rate_limit_window_secs == 0 {
            self.rate_limit_window_secs = d.rate_limit_window_secs;
        }
        self.worker_pool_size = self.worker_pool_size.max(1);
        self.scoring_max_retries = self.scoring_max_retries.max(1);
        self.fetch_limit = self.fetch_limit.max(1);
        if self.trend_window_secs == 0 {
            self.trend_window_secs = d.trend_window_secs;
        }
        if self.trend_bucket_secs == 0 || self.trend_bucket_secs > self.trend_window_secs {
            self.trend_bucket_secs = self.trend_window_secs.min(d.trend_bucket_secs);
        }
        if self.scoring_backoff_max_ms < self.scoring_backoff_base_ms {
            std::mem::swap(
                &mut self.scoring_backoff_base_ms,
                &mut self.scoring_backoff_max_ms,
            );
        }
        if !self.trend_weight_volume.is_finite() {
            self.trend_weight_volume = d.trend_weight_volume;
        }
        if !self.trend_weight_sentiment.is_finite() {
            self.trend_weight_sentiment = d.trend_weight_sentiment;
        }
        self.default_assets = clean_assets(self.default_assets);
        self
    }
}

fn secs(s: u64) -> Duration {
    Duration::seconds(i64::try_from(s).unwrap_or(i64::MAX / 1_000))
}

/// Load config from an explicit path. Supports TOML or JSON formats.
pub fn load_config_from(path: &Path) -> Result<PipelineConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading pipeline config from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    parse_config(&content, ext.as_str())
        .with_context(|| format!("parsing pipeline config {}", path.display()))
}

/// Load config using env var + fallbacks:
/// 1) $PIPELINE_CONFIG_PATH
/// 2) config/pipeline.toml
/// 3) config/pipeline.json
/// 4) built-in defaults
pub fn load_config_default() -> Result<PipelineConfig> {
    if let Ok(p) = std::env::var(ENV_PIPELINE_CONFIG_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_config_from(&pb);
        }
        return Err(anyhow!("PIPELINE_CONFIG_PATH points to non-existent path"));
    }
    let toml_p = PathBuf::from(DEFAULT_TOML_PATH);
    if toml_p.exists() {
        return load_config_from(&toml_p);
    }
    let json_p = PathBuf::from(DEFAULT_JSON_PATH);
    if json_p.exists() {
        return load_config_from(&json_p);
    }
    Ok(PipelineConfig::default())
}

fn parse_config(s: &str, hint_ext: &str) -> Result<PipelineConfig> {
    let looks_json = s.trim_start().starts_with('{');
    let cfg = if hint_ext == "json" || (hint_ext != "toml" && looks_json) {
        serde_json::from_str::<PipelineConfig>(s)?
    } else {
        toml::from_str::<PipelineConfig>(s)?
    };
    Ok(cfg.sanitized())
}

fn clean_assets(items: Vec<String>) -> Vec<String> {
    use std::collections::BTreeSet;
    let mut set = BTreeSet::new();
    for it in items {
        let t = crate::model::canonical_asset_tag(&it);
        if !t.is_empty() {
            set.insert(t);
        }
    }
    set.into_iter().collect()
}
