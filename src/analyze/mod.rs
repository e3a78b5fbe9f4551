// src/analyze/mod.rs
//! Scoring capability consumed by the pipeline.
//!
//! A scorer turns a mention's text and optional image into zero or more
//! signal drafts. New backends implement [`ScoringPort`]; the pipeline owns
//! retries and never inspects which backend produced a draft.

pub mod lexicon;
pub mod pnl;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ScoringError;
use crate::model::{Mention, SignalDraft};

pub use lexicon::LexiconSentimentScorer;
pub use pnl::{parse_pnl_text, PnlCard};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoringInput {
    pub text: Option<String>,
    pub image_ref: Option<String>,
}

impl ScoringInput {
    pub fn from_mention(m: &Mention) -> Self {
        Self {
            text: Some(m.body_text.clone()).filter(|t| !t.trim().is_empty()),
            image_ref: m.primary_image().map(str::to_string),
        }
    }
}

#[async_trait]
pub trait ScoringPort: Send + Sync {
    async fn score(&self, input: &ScoringInput) -> Result<Vec<SignalDraft>, ScoringError>;

    /// Stamped on every signal this scorer produces.
    fn version(&self) -> &str;
}

pub type DynScorer = Arc<dyn ScoringPort>;

/// OCR engine behind the PNL extraction path (download + recognise).
#[async_trait]
pub trait OcrPort: Send + Sync {
    async fn extract_text(&self, locator: &str) -> Result<String, ScoringError>;
}

/// Text sentiment plus, when an image is attached and OCR is wired, PNL
/// extraction from the screenshot.
pub struct CompositeScorer {
    sentiment: LexiconSentimentScorer,
    ocr: Option<Arc<dyn OcrPort>>,
    version: String,
}

impl CompositeScorer {
    pub fn new(ocr: Option<Arc<dyn OcrPort>>) -> Self {
        let version = match ocr {
            Some(_) => format!("{}+pnl-ocr-1", lexicon::LEXICON_SCORER_VERSION),
            None => lexicon::LEXICON_SCORER_VERSION.to_string(),
        };
        Self {
            sentiment: LexiconSentimentScorer::new(),
            ocr,
            version,
        }
    }
}

#[async_trait]
impl ScoringPort for CompositeScorer {
    async fn score(&self, input: &ScoringInput) -> Result<Vec<SignalDraft>, ScoringError> {
        let mut out = self.sentiment.score(input).await?;

        if let (Some(ocr), Some(image)) = (&self.ocr, input.image_ref.as_deref()) {
            let text = ocr.extract_text(image).await?;
            // Blank OCR output is a photo without a card, not a failure.
            if let Some(draft) = parse_pnl_text(&text).to_draft() {
                out.push(draft);
            }
        }

        Ok(out)
    }

    fn version(&self) -> &str {
        &self.version
    }
}
