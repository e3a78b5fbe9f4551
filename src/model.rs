//! # Data model
//! Mentions, signals and derived trend rows shared by every stage of the
//! pipeline. Mentions and signals are immutable once written; trends are a
//! rebuildable materialisation.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MentionId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalId(pub i64);

impl fmt::Display for MentionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// One observed unit of social content referencing a tracked asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mention {
    /// Unique per origin feed; the deduplication key.
    pub source_id: String,
    pub asset_tag: String,
    pub author_handle: String,
    pub body_text: String,
    /// Opaque locators (image URLs), in feed order.
    #[serde(default)]
    pub media_refs: Vec<String>,
    pub observed_at: DateTime<Utc>,
    pub fetch_batch_id: String,
}

impl Mention {
    pub fn primary_image(&self) -> Option<&str> {
        self.media_refs.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Sentiment,
    PnlExtraction,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Sentiment => "sentiment",
            SignalKind::PnlExtraction => "pnl_extraction",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sentiment" => Some(SignalKind::Sentiment),
            "pnl_extraction" => Some(SignalKind::PnlExtraction),
            _ => None,
        }
    }
}

/// What a scorer hands back for one mention, before the pipeline stamps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDraft {
    pub kind: SignalKind,
    pub label: String,
    pub confidence: f64,
    #[serde(default)]
    pub numeric_fields: BTreeMap<String, f64>,
}

impl SignalDraft {
    pub fn new(kind: SignalKind, label: impl Into<String>, confidence: f64) -> Self {
        Self {
            kind,
            label: label.into(),
            confidence,
            numeric_fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: f64) -> Self {
        self.numeric_fields.insert(name.into(), value);
        self
    }
}

/// A signal ready to be appended; the store assigns its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSignal {
    pub mention_ref: MentionId,
    pub asset_tag: String,
    pub kind: SignalKind,
    pub label: String,
    pub confidence: f64,
    pub numeric_fields: BTreeMap<String, f64>,
    pub computed_at: DateTime<Utc>,
    pub scorer_version: String,
}

impl NewSignal {
    pub fn from_draft(
        draft: SignalDraft,
        mention_ref: MentionId,
        asset_tag: &str,
        computed_at: DateTime<Utc>,
        scorer_version: &str,
    ) -> Self {
        // NaN confidence collapses to 0 so aggregates stay finite.
        let confidence = if draft.confidence.is_finite() {
            draft.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            mention_ref,
            asset_tag: asset_tag.to_string(),
            kind: draft.kind,
            label: draft.label,
            confidence,
            numeric_fields: draft
                .numeric_fields
                .into_iter()
                .filter(|(_, v)| v.is_finite())
                .collect(),
            computed_at,
            scorer_version: scorer_version.to_string(),
        }
    }

    pub fn with_id(self, id: SignalId) -> Signal {
        Signal {
            id,
            mention_ref: self.mention_ref,
            asset_tag: self.asset_tag,
            kind: self.kind,
            label: self.label,
            confidence: self.confidence,
            numeric_fields: self.numeric_fields,
            computed_at: self.computed_at,
            scorer_version: self.scorer_version,
        }
    }
}

/// A structured, scored interpretation of a mention. Never edited; a
/// re-score appends a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: SignalId,
    pub mention_ref: MentionId,
    pub asset_tag: String,
    pub kind: SignalKind,
    pub label: String,
    pub confidence: f64,
    pub numeric_fields: BTreeMap<String, f64>,
    pub computed_at: DateTime<Utc>,
    pub scorer_version: String,
}

impl Signal {
    /// Signed sentiment in [-1, 1], or `None` for non-sentiment signals and
    /// unknown labels.
    pub fn sentiment_value(&self) -> Option<f64> {
        if self.kind != SignalKind::Sentiment {
            return None;
        }
        sentiment_polarity(&self.label).map(|p| p * self.confidence)
    }
}

/// Map a sentiment label to +1 / 0 / -1.
///
/// Accepts our own labels, the three-class `LABEL_0..2` model output
/// (0 = negative, 1 = neutral, 2 = positive) and common slang.
pub fn sentiment_polarity(label: &str) -> Option<f64> {
    match label.trim().to_ascii_lowercase().as_str() {
        "positive" | "bullish" | "label_2" | "pos" => Some(1.0),
        "neutral" | "label_1" | "neu" => Some(0.0),
        "negative" | "bearish" | "label_0" | "neg" => Some(-1.0),
        _ => None,
    }
}

/// Scoring outcome recorded with a persisted mention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScoringStatus {
    Scored { attempts: u32 },
    ScoringExhausted { attempts: u32 },
}

impl ScoringStatus {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, ScoringStatus::ScoringExhausted { .. })
    }

    pub fn attempts(&self) -> u32 {
        match *self {
            ScoringStatus::Scored { attempts } | ScoringStatus::ScoringExhausted { attempts } => {
                attempts
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMention {
    pub id: MentionId,
    pub mention: Mention,
    pub scoring: ScoringStatus,
}

/// Windowed aggregate for one asset. Derived; never authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetTrend {
    pub asset_tag: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub mention_count: u64,
    pub mean_sentiment: f64,
    pub volume_delta_vs_prior_window: f64,
    pub trend_score: f64,
}

/// Canonical asset tag: trimmed, `$` stripped, upper-cased.
pub fn canonical_asset_tag(raw: &str) -> String {
    raw.trim().trim_start_matches('$').trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_tag_strips_cashtag_and_case() {
        assert_eq!(canonical_asset_tag("  $sol "), "SOL");
        assert_eq!(canonical_asset_tag("Jup"), "JUP");
    }

    #[test]
    fn polarity_accepts_model_labels() {
        assert_eq!(sentiment_polarity("LABEL_2"), Some(1.0));
        assert_eq!(sentiment_polarity("label_0"), Some(-1.0));
        assert_eq!(sentiment_polarity("Bullish"), Some(1.0));
        assert_eq!(sentiment_polarity("error"), None);
    }

    #[test]
    fn new_signal_clamps_confidence_and_drops_nan_fields() {
        let draft = SignalDraft::new(SignalKind::Sentiment, "positive", 1.7)
            .with_field("score", 3.0)
            .with_field("bad", f64::NAN);
        let s = NewSignal::from_draft(draft, MentionId(1), "SOL", Utc::now(), "lex-1");
        assert_eq!(s.confidence, 1.0);
        assert_eq!(s.numeric_fields.len(), 1);
    }
}
