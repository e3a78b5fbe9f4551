// src/ingest/dedup.rs
//! Seen-id set guaranteeing at-most-once admission of a mention.
//!
//! `admit` is a single check-and-set under one lock, so concurrent callers
//! racing on the same `source_id` get exactly one `true`. Entries older
//! than the retention window are pruned lazily; an id inside the window is
//! never forgotten except through an explicit `revoke`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub source_id: String,
    pub first_seen_at: DateTime<Utc>,
}

pub struct Deduplicator {
    clock: SharedClock,
    retention: Duration,
    inner: Mutex<Inner>,
}

struct Inner {
    seen: HashMap<String, DateTime<Utc>>,
    last_prune: DateTime<Utc>,
}

impl Deduplicator {
    pub fn new(clock: SharedClock, retention: Duration) -> Self {
        let now = clock.now();
        Self {
            clock,
            retention,
            inner: Mutex::new(Inner {
                seen: HashMap::new(),
                last_prune: now,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Admit `source_id` if unseen. Returns false for duplicates.
    pub fn admit(&self, source_id: &str) -> bool {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.maybe_prune(&mut inner, now);
        if inner.seen.contains_key(source_id) {
            return false;
        }
        inner.seen.insert(source_id.to_string(), now);
        true
    }

    /// Undo an admission whose mention never reached the store, so a later
    /// tick can admit it again.
    pub fn revoke(&self, source_id: &str) {
        self.lock().seen.remove(source_id);
    }

    pub fn contains(&self, source_id: &str) -> bool {
        self.lock().seen.contains_key(source_id)
    }

    /// Seed from durable history after a restart.
    pub fn warm<I>(&self, records: I)
    where
        I: IntoIterator<Item = DedupRecord>,
    {
        let mut inner = self.lock();
        for r in records {
            inner
                .seen
                .entry(r.source_id)
                .and_modify(|t| *t = (*t).min(r.first_seen_at))
                .or_insert(r.first_seen_at);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn maybe_prune(&self, inner: &mut Inner, now: DateTime<Utc>) {
        // Sweep at most four times per retention window.
        if now - inner.last_prune < self.retention / 4 {
            return;
        }
        let cutoff = now - self.retention;
        let before = inner.seen.len();
        inner.seen.retain(|_, first_seen| *first_seen >= cutoff);
        inner.last_prune = now;
        let evicted = before - inner.seen.len();
        if evicted > 0 {
            tracing::debug!(target: "ingest", evicted, "dedup retention sweep");
        }
    }
}
