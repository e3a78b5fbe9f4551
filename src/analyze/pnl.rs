//! PNL screenshot extraction: pulls percentage, entry/exit prices and the
//! token symbol out of OCR text.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::{Signal, SignalDraft, SignalKind};

static RE_PNL_LABELLED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:pnl|profit|loss)\s*:?\s*([+\-]?\s*\d+(?:\.\d+)?)\s*%").expect("pnl regex")
});
static RE_PNL_SIGNED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([+\-]\s*\d+(?:\.\d+)?)\s*%").expect("signed pct regex"));
static RE_CASHTAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$([a-z]{3,5})\b").expect("cashtag regex"));
static RE_SYMBOL_NEAR_PRICE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([a-z]{3,5})\b\s*(?:entry|exit)").expect("symbol regex"));
static RE_ENTRY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"entry\s*(?:price)?\s*:?\s*\$?(\d+(?:\.\d+)?)").expect("entry regex")
});
static RE_EXIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"exit\s*(?:price)?\s*:?\s*\$?(\d+(?:\.\d+)?)").expect("exit regex"));

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PnlCard {
    pub pnl_percentage: Option<f64>,
    pub entry_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub token_symbol: Option<String>,
}

impl PnlCard {
    fn found(&self) -> usize {
        [
            self.pnl_percentage.is_some(),
            self.entry_price.is_some(),
            self.exit_price.is_some(),
            self.token_symbol.is_some(),
        ]
        .into_iter()
        .filter(|b| *b)
        .count()
    }

    pub fn is_empty(&self) -> bool {
        self.found() == 0
    }

    /// `pnl_extraction` draft; confidence is the share of fields recovered.
    pub fn to_draft(&self) -> Option<SignalDraft> {
        if self.is_empty() {
            return None;
        }
        let label = self.token_symbol.clone().unwrap_or_else(|| "unknown".into());
        let mut d = SignalDraft::new(SignalKind::PnlExtraction, label, self.found() as f64 / 4.0);
        if let Some(v) = self.pnl_percentage {
            d = d.with_field("pnl_percentage", v);
        }
        if let Some(v) = self.entry_price {
            d = d.with_field("entry_price", v);
        }
        if let Some(v) = self.exit_price {
            d = d.with_field("exit_price", v);
        }
        Some(d)
    }

    /// Read a stored `pnl_extraction` signal back into a card.
    pub fn from_signal(signal: &Signal) -> Option<Self> {
        if signal.kind != SignalKind::PnlExtraction {
            return None;
        }
        let field = |name: &str| signal.numeric_fields.get(name).copied();
        Some(Self {
            pnl_percentage: field("pnl_percentage"),
            entry_price: field("entry_price"),
            exit_price: field("exit_price"),
            token_symbol: Some(signal.label.clone()).filter(|l| l != "unknown"),
        })
    }
}

fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw.chars().filter(|c| !c.is_whitespace() && *c != '+').collect();
    cleaned.parse::<f64>().ok()
}

pub fn parse_pnl_text(text: &str) -> PnlCard {
    let text = text.to_lowercase();

    let pnl_percentage = RE_PNL_LABELLED
        .captures(&text)
        .and_then(|c| parse_number(&c[1]))
        .or_else(|| {
            RE_PNL_SIGNED
                .captures(&text)
                .and_then(|c| parse_number(&c[1]))
        });

    let token_symbol = RE_CASHTAG
        .captures(&text)
        .or_else(|| RE_SYMBOL_NEAR_PRICE.captures(&text))
        .map(|c| c[1].to_ascii_uppercase());

    let entry_price = RE_ENTRY.captures(&text).and_then(|c| parse_number(&c[1]));
    let exit_price = RE_EXIT.captures(&text).and_then(|c| parse_number(&c[1]));

    PnlCard {
        pnl_percentage,
        entry_price,
        exit_price,
        token_symbol,
    }
}
