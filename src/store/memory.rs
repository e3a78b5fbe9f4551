//! In-process [`SignalStore`]. Same contract as the SQLite backend; loses
//! everything on exit.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{MentionAppend, ScoredAppend, SignalStore, StoreCursor};
use crate::error::{StoreError, StoreResult};
use crate::ingest::dedup::DedupRecord;
use crate::ingest::types::FeedCursor;
use crate::model::{
    Mention, MentionId, NewSignal, ScoringStatus, Signal, SignalId, SignalKind, StoredMention,
};

#[derive(Default)]
pub struct MemorySignalStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    mentions: Vec<StoredMention>,
    by_source: HashMap<String, MentionId>,
    signals: Vec<Signal>,
    cursors: HashMap<String, FeedCursor>,
    tracked: BTreeMap<String, DateTime<Utc>>,
}

impl MemorySignalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store mutex poisoned".into()))
    }

    pub fn mention_count(&self) -> usize {
        self.lock().map(|g| g.mentions.len()).unwrap_or(0)
    }

    pub fn signal_count(&self) -> usize {
        self.lock().map(|g| g.signals.len()).unwrap_or(0)
    }

    /// Every stored mention in insertion order.
    pub fn all_mentions(&self) -> Vec<StoredMention> {
        self.lock().map(|g| g.mentions.clone()).unwrap_or_default()
    }
}

impl Inner {
    fn insert_mention(&mut self, mention: &Mention, scoring: ScoringStatus) -> MentionAppend {
        if let Some(&id) = self.by_source.get(&mention.source_id) {
            return MentionAppend::AlreadyPresent(id);
        }
        let id = MentionId(self.mentions.len() as i64 + 1);
        self.by_source.insert(mention.source_id.clone(), id);
        self.mentions.push(StoredMention {
            id,
            mention: mention.clone(),
            scoring,
        });
        MentionAppend::Inserted(id)
    }

    fn insert_signal(&mut self, signal: NewSignal) -> Signal {
        let stored = signal.with_id(SignalId(self.signals.len() as i64 + 1));
        self.signals.push(stored.clone());
        stored
    }
}

#[async_trait]
impl SignalStore for MemorySignalStore {
    async fn append_mention(
        &self,
        mention: &Mention,
        scoring: ScoringStatus,
    ) -> StoreResult<MentionAppend> {
        Ok(self.lock()?.insert_mention(mention, scoring))
    }

    async fn append_signal(&self, signal: NewSignal) -> StoreResult<Signal> {
        let mut g = self.lock()?;
        if !g.mentions.iter().any(|m| m.id == signal.mention_ref) {
            return Err(StoreError::Corrupt(format!(
                "signal references unknown mention {}",
                signal.mention_ref
            )));
        }
        Ok(g.insert_signal(signal))
    }

    async fn append_scored(
        &self,
        mention: &Mention,
        scoring: ScoringStatus,
        signals: Vec<NewSignal>,
    ) -> StoreResult<ScoredAppend> {
        let mut g = self.lock()?;
        let appended = g.insert_mention(mention, scoring);
        let MentionAppend::Inserted(id) = appended else {
            return Ok(ScoredAppend {
                mention: appended,
                signals: Vec::new(),
            });
        };
        let signals = signals
            .into_iter()
            .map(|mut s| {
                s.mention_ref = id;
                g.insert_signal(s)
            })
            .collect();
        Ok(ScoredAppend {
            mention: appended,
            signals,
        })
    }

    async fn signals_after(
        &self,
        asset_tag: &str,
        after: StoreCursor,
        limit: usize,
    ) -> StoreResult<Vec<Signal>> {
        let g = self.lock()?;
        let mut rows: Vec<Signal> = g
            .signals
            .iter()
            .filter(|s| s.asset_tag == asset_tag && after.admits(s.computed_at, s.id.0))
            .cloned()
            .collect();
        rows.sort_by_key(|s| (s.computed_at, s.id));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn mentions_after(
        &self,
        asset_tag: &str,
        after: StoreCursor,
        limit: usize,
    ) -> StoreResult<Vec<StoredMention>> {
        let g = self.lock()?;
        let mut rows: Vec<StoredMention> = g
            .mentions
            .iter()
            .filter(|m| {
                m.mention.asset_tag == asset_tag && after.admits(m.mention.observed_at, m.id.0)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|m| (m.mention.observed_at, m.id));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn recent_signals(
        &self,
        asset_tag: &str,
        kind: SignalKind,
        limit: usize,
    ) -> StoreResult<Vec<Signal>> {
        let g = self.lock()?;
        let mut rows: Vec<Signal> = g
            .signals
            .iter()
            .filter(|s| s.asset_tag == asset_tag && s.kind == kind)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (b.computed_at, b.id).cmp(&(a.computed_at, a.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn get_signal(&self, id: SignalId) -> StoreResult<Option<Signal>> {
        let g = self.lock()?;
        Ok(g.signals.iter().find(|s| s.id == id).cloned())
    }

    async fn recent_source_ids(&self, since: DateTime<Utc>) -> StoreResult<Vec<DedupRecord>> {
        let g = self.lock()?;
        Ok(g.mentions
            .iter()
            .filter(|m| m.mention.observed_at >= since)
            .map(|m| DedupRecord {
                source_id: m.mention.source_id.clone(),
                first_seen_at: m.mention.observed_at,
            })
            .collect())
    }

    async fn load_cursor(&self, asset_tag: &str) -> StoreResult<Option<FeedCursor>> {
        Ok(self.lock()?.cursors.get(asset_tag).cloned())
    }

    async fn save_cursor(&self, asset_tag: &str, cursor: &FeedCursor) -> StoreResult<()> {
        self.lock()?
            .cursors
            .insert(asset_tag.to_string(), cursor.clone());
        Ok(())
    }

    async fn track_asset(&self, asset_tag: &str, requested_at: DateTime<Utc>) -> StoreResult<bool> {
        let mut g = self.lock()?;
        if g.tracked.contains_key(asset_tag) {
            return Ok(false);
        }
        g.tracked.insert(asset_tag.to_string(), requested_at);
        Ok(true)
    }

    async fn tracked_assets(&self) -> StoreResult<Vec<String>> {
        Ok(self.lock()?.tracked.keys().cloned().collect())
    }
}
