//! Optional notarisation of individual signals.
//!
//! Anchoring runs only on explicit request and never touches ingestion
//! state. The ledger behind [`AnchorPort`] is out of scope; the crate only
//! produces the digest and relays the receipt or error.

use std::fmt::Write as _;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AnchorError, StoreError};
use crate::model::{Signal, SignalId};

/// Proof returned by the anchoring backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorReceipt {
    pub signal_id: SignalId,
    /// Hex SHA-256 of the anchored record.
    pub digest: String,
    /// Backend-defined reference (tx hash, asset id, ...).
    pub reference: String,
    pub anchored_at: DateTime<Utc>,
}

#[async_trait]
pub trait AnchorPort: Send + Sync {
    async fn anchor(&self, signal_id: SignalId, digest: &str) -> Result<AnchorReceipt, AnchorError>;
}

/// Hex SHA-256 over the signal's canonical JSON (struct field order, sorted
/// numeric field names).
pub fn record_digest(signal: &Signal) -> Result<String, AnchorError> {
    let bytes = serde_json::to_vec(signal).map_err(StoreError::from)?;
    let digest = Sha256::digest(&bytes);
    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        let _ = write!(&mut out, "{:02x}", b);
    }
    Ok(out)
}
