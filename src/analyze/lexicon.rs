//! Lexicon sentiment for crypto slang, with short-range negation.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::HashMap;

use super::{ScoringInput, ScoringPort};
use crate::error::ScoringError;
use crate::model::{SignalDraft, SignalKind};

static LEXICON: Lazy<HashMap<String, i32>> = Lazy::new(|| {
    let raw = include_str!("../../sentiment_lexicon.json");
    serde_json::from_str::<HashMap<String, i32>>(raw).expect("valid sentiment lexicon")
});

pub const LEXICON_SCORER_VERSION: &str = "lexicon-1";

#[derive(Debug, Clone, Default)]
pub struct LexiconSentimentScorer;

impl LexiconSentimentScorer {
    pub fn new() -> Self {
        Self
    }

    #[inline]
    fn word_score(&self, w: &str) -> i32 {
        *LEXICON.get(w).unwrap_or(&0)
    }

    /// Returns (score, token count). A negator in the previous 1..=3 tokens
    /// flips the sign of a lexicon hit.
    pub fn score_text(&self, text: &str) -> (i32, usize) {
        let tokens: Vec<String> = tokenize(text).collect();
        let mut score: i32 = 0;

        for i in 0..tokens.len() {
            let base = self.word_score(tokens[i].as_str());
            if base == 0 {
                continue;
            }
            let negated = (1..=3).any(|k| i >= k && is_negator(tokens[i - k].as_str()));
            score += if negated { -base } else { base };
        }

        (score, tokens.len())
    }

    /// Sentiment draft for a text, `None` when there is nothing to score.
    pub fn draft_for(&self, text: &str) -> Option<SignalDraft> {
        let (score, tokens) = self.score_text(text);
        if tokens == 0 {
            return None;
        }
        let (label, confidence) = match score {
            0 => ("neutral", 0.5),
            s => {
                let label = if s > 0 { "positive" } else { "negative" };
                (label, (0.5 + 0.15 * f64::from(s.abs())).min(0.99))
            }
        };
        Some(
            SignalDraft::new(SignalKind::Sentiment, label, confidence)
                .with_field("score", f64::from(score))
                .with_field("tokens", tokens as f64),
        )
    }
}

#[async_trait]
impl ScoringPort for LexiconSentimentScorer {
    async fn score(&self, input: &ScoringInput) -> Result<Vec<SignalDraft>, ScoringError> {
        Ok(input
            .text
            .as_deref()
            .and_then(|t| self.draft_for(t))
            .into_iter()
            .collect())
    }

    fn version(&self) -> &str {
        LEXICON_SCORER_VERSION
    }
}

/// Alphanumeric, lower-cased tokens; `$SOL` and `#SOL` both yield `sol`.
fn tokenize(s: &str) -> impl Iterator<Item = String> + '_ {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_lowercase())
}

fn is_negator(tok: &str) -> bool {
    matches!(
        tok,
        "not" | "no" | "never" | "isn" | "wasn" | "aren" | "won" | "cant" | "cannot" | "without"
            | "dont"
    )
}
