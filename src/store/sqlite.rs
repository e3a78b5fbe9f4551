//! [`SqliteSignalStore`], the durable SQLite implementation of [`SignalStore`].

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension as _;

use super::{schema::SCHEMA, MentionAppend, ScoredAppend, SignalStore, StoreCursor};
use crate::error::{StoreError, StoreResult};
use crate::ingest::dedup::DedupRecord;
use crate::ingest::types::FeedCursor;
use crate::model::{
    Mention, MentionId, NewSignal, ScoringStatus, Signal, SignalId, SignalKind, StoredMention,
};

// ─── Row encoding ────────────────────────────────────────────────────────────

struct RawMention {
    id: i64,
    source_id: String,
    asset_tag: String,
    author_handle: String,
    body_text: String,
    media_refs: String,
    observed_at_ms: i64,
    fetch_batch_id: String,
    scoring_status: String,
    scoring_attempts: u32,
}

struct RawSignal {
    id: i64,
    mention_id: i64,
    asset_tag: String,
    kind: String,
    label: String,
    confidence: f64,
    numeric_fields: String,
    computed_at_ms: i64,
    scorer_version: String,
}

const MENTION_COLUMNS: &str = "mention_id, source_id, asset_tag, author_handle, body_text, \
     media_refs, observed_at_ms, fetch_batch_id, scoring_status, scoring_attempts";

const SIGNAL_COLUMNS: &str = "signal_id, mention_id, asset_tag, kind, label, confidence, \
     numeric_fields, computed_at_ms, scorer_version";

fn raw_mention(r: &rusqlite::Row<'_>) -> rusqlite::Result<RawMention> {
    Ok(RawMention {
        id: r.get(0)?,
        source_id: r.get(1)?,
        asset_tag: r.get(2)?,
        author_handle: r.get(3)?,
        body_text: r.get(4)?,
        media_refs: r.get(5)?,
        observed_at_ms: r.get(6)?,
        fetch_batch_id: r.get(7)?,
        scoring_status: r.get(8)?,
        scoring_attempts: r.get(9)?,
    })
}

fn raw_signal(r: &rusqlite::Row<'_>) -> rusqlite::Result<RawSignal> {
    Ok(RawSignal {
        id: r.get(0)?,
        mention_id: r.get(1)?,
        asset_tag: r.get(2)?,
        kind: r.get(3)?,
        label: r.get(4)?,
        confidence: r.get(5)?,
        numeric_fields: r.get(6)?,
        computed_at_ms: r.get(7)?,
        scorer_version: r.get(8)?,
    })
}

fn decode_ts(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn encode_status(s: ScoringStatus) -> (&'static str, u32) {
    match s {
        ScoringStatus::Scored { attempts } => ("scored", attempts),
        ScoringStatus::ScoringExhausted { attempts } => ("scoring_exhausted", attempts),
    }
}

fn decode_status(status: &str, attempts: u32) -> StoreResult<ScoringStatus> {
    match status {
        "scored" => Ok(ScoringStatus::Scored { attempts }),
        "scoring_exhausted" => Ok(ScoringStatus::ScoringExhausted { attempts }),
        other => Err(StoreError::Corrupt(format!("unknown scoring status {other:?}"))),
    }
}

impl RawMention {
    fn decode(self) -> StoreResult<StoredMention> {
        Ok(StoredMention {
            id: MentionId(self.id),
            scoring: decode_status(&self.scoring_status, self.scoring_attempts)?,
            mention: Mention {
                source_id: self.source_id,
                asset_tag: self.asset_tag,
                author_handle: self.author_handle,
                body_text: self.body_text,
                media_refs: serde_json::from_str(&self.media_refs)?,
                observed_at: decode_ts(self.observed_at_ms)?,
                fetch_batch_id: self.fetch_batch_id,
            },
        })
    }
}

impl RawSignal {
    fn decode(self) -> StoreResult<Signal> {
        let kind = SignalKind::parse(&self.kind)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown signal kind {:?}", self.kind)))?;
        let numeric_fields: BTreeMap<String, f64> = serde_json::from_str(&self.numeric_fields)?;
        Ok(Signal {
            id: SignalId(self.id),
            mention_ref: MentionId(self.mention_id),
            asset_tag: self.asset_tag,
            kind,
            label: self.label,
            confidence: self.confidence,
            numeric_fields,
            computed_at: decode_ts(self.computed_at_ms)?,
            scorer_version: self.scorer_version,
        })
    }
}

fn insert_mention(
    conn: &rusqlite::Connection,
    m: &Mention,
    media: &str,
    status: &str,
    attempts: u32,
) -> rusqlite::Result<MentionAppend> {
    let inserted = conn.execute(
        "INSERT INTO mentions (source_id, asset_tag, author_handle, body_text,
             media_refs, observed_at_ms, fetch_batch_id, scoring_status, scoring_attempts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(source_id) DO NOTHING",
        rusqlite::params![
            m.source_id,
            m.asset_tag,
            m.author_handle,
            m.body_text,
            media,
            m.observed_at.timestamp_millis(),
            m.fetch_batch_id,
            status,
            attempts,
        ],
    )?;
    if inserted == 1 {
        return Ok(MentionAppend::Inserted(MentionId(conn.last_insert_rowid())));
    }
    let id: i64 = conn.query_row(
        "SELECT mention_id FROM mentions WHERE source_id = ?1",
        rusqlite::params![m.source_id],
        |r| r.get(0),
    )?;
    Ok(MentionAppend::AlreadyPresent(MentionId(id)))
}

fn insert_signal(conn: &rusqlite::Connection, s: &NewSignal, fields: &str) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO signals (mention_id, asset_tag, kind, label, confidence,
             numeric_fields, computed_at_ms, scorer_version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            s.mention_ref.0,
            s.asset_tag,
            s.kind.as_str(),
            s.label,
            s.confidence,
            fields,
            s.computed_at.timestamp_millis(),
            s.scorer_version,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// A signal store backed by a single SQLite file.
///
/// Clones share one reference-counted connection.
#[derive(Clone)]
pub struct SqliteSignalStore {
    conn: tokio_rusqlite::Connection,
}

impl SqliteSignalStore {
    /// Open (or create) a store at `path` and run schema initialisation.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = tokio_rusqlite::Connection::open(path).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open a private in-memory store.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> StoreResult<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SignalStore for SqliteSignalStore {
    async fn append_mention(
        &self,
        mention: &Mention,
        scoring: ScoringStatus,
    ) -> StoreResult<MentionAppend> {
        let media = serde_json::to_string(&mention.media_refs)?;
        let (status, attempts) = encode_status(scoring);
        let m = mention.clone();

        let out = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let out = insert_mention(&tx, &m, &media, status, attempts)?;
                tx.commit()?;
                Ok(out)
            })
            .await?;
        Ok(out)
    }

    async fn append_signal(&self, signal: NewSignal) -> StoreResult<Signal> {
        let fields = serde_json::to_string(&signal.numeric_fields)?;
        let s = signal.clone();
        let id = self
            .conn
            .call(move |conn| Ok(insert_signal(conn, &s, &fields)?))
            .await?;
        Ok(signal.with_id(SignalId(id)))
    }

    async fn append_scored(
        &self,
        mention: &Mention,
        scoring: ScoringStatus,
        signals: Vec<NewSignal>,
    ) -> StoreResult<ScoredAppend> {
        let media = serde_json::to_string(&mention.media_refs)?;
        let (status, attempts) = encode_status(scoring);
        let m = mention.clone();
        let encoded = signals
            .into_iter()
            .map(|s| -> StoreResult<(String, NewSignal)> {
                Ok((serde_json::to_string(&s.numeric_fields)?, s))
            })
            .collect::<StoreResult<Vec<_>>>()?;

        let out = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let appended = insert_mention(&tx, &m, &media, status, attempts)?;
                let MentionAppend::Inserted(mention_id) = appended else {
                    tx.commit()?;
                    return Ok(ScoredAppend {
                        mention: appended,
                        signals: Vec::new(),
                    });
                };
                let mut stored = Vec::with_capacity(encoded.len());
                for (fields, mut signal) in encoded {
                    signal.mention_ref = mention_id;
                    let id = insert_signal(&tx, &signal, &fields)?;
                    stored.push(signal.with_id(SignalId(id)));
                }
                tx.commit()?;
                Ok(ScoredAppend {
                    mention: appended,
                    signals: stored,
                })
            })
            .await?;
        Ok(out)
    }

    async fn signals_after(
        &self,
        asset_tag: &str,
        after: StoreCursor,
        limit: usize,
    ) -> StoreResult<Vec<Signal>> {
        let asset = asset_tag.to_string();
        let at_ms = after.at.timestamp_millis();
        let after_id = after.id;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<RawSignal> = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {SIGNAL_COLUMNS} FROM signals
                     WHERE asset_tag = ?1
                       AND (computed_at_ms > ?2 OR (computed_at_ms = ?2 AND signal_id > ?3))
                     ORDER BY computed_at_ms, signal_id
                     LIMIT ?4"
                );
                let mut stmt = conn.prepare_cached(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params![asset, at_ms, after_id, limit], raw_signal)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(RawSignal::decode).collect()
    }

    async fn mentions_after(
        &self,
        asset_tag: &str,
        after: StoreCursor,
        limit: usize,
    ) -> StoreResult<Vec<StoredMention>> {
        let asset = asset_tag.to_string();
        let at_ms = after.at.timestamp_millis();
        let after_id = after.id;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<RawMention> = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {MENTION_COLUMNS} FROM mentions
                     WHERE asset_tag = ?1
                       AND (observed_at_ms > ?2 OR (observed_at_ms = ?2 AND mention_id > ?3))
                     ORDER BY observed_at_ms, mention_id
                     LIMIT ?4"
                );
                let mut stmt = conn.prepare_cached(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params![asset, at_ms, after_id, limit], raw_mention)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(RawMention::decode).collect()
    }

    async fn recent_signals(
        &self,
        asset_tag: &str,
        kind: SignalKind,
        limit: usize,
    ) -> StoreResult<Vec<Signal>> {
        let asset = asset_tag.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<RawSignal> = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {SIGNAL_COLUMNS} FROM signals
                     WHERE asset_tag = ?1 AND kind = ?2
                     ORDER BY computed_at_ms DESC, signal_id DESC
                     LIMIT ?3"
                );
                let mut stmt = conn.prepare_cached(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params![asset, kind.as_str(), limit], raw_signal)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(RawSignal::decode).collect()
    }

    async fn get_signal(&self, id: SignalId) -> StoreResult<Option<Signal>> {
        let raw: Option<RawSignal> = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {SIGNAL_COLUMNS} FROM signals WHERE signal_id = ?1");
                let row = conn
                    .query_row(&sql, rusqlite::params![id.0], raw_signal)
                    .optional()?;
                Ok(row)
            })
            .await?;
        raw.map(RawSignal::decode).transpose()
    }

    async fn recent_source_ids(&self, since: DateTime<Utc>) -> StoreResult<Vec<DedupRecord>> {
        let since_ms = since.timestamp_millis();
        let rows: Vec<(String, i64)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT source_id, observed_at_ms FROM mentions WHERE observed_at_ms >= ?1",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![since_ms], |r| Ok((r.get(0)?, r.get(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter()
            .map(|(source_id, ms)| {
                Ok(DedupRecord {
                    source_id,
                    first_seen_at: decode_ts(ms)?,
                })
            })
            .collect()
    }

    async fn load_cursor(&self, asset_tag: &str) -> StoreResult<Option<FeedCursor>> {
        let asset = asset_tag.to_string();
        let cursor: Option<String> = self
            .conn
            .call(move |conn| {
                let c = conn
                    .query_row(
                        "SELECT cursor FROM feed_cursors WHERE asset_tag = ?1",
                        rusqlite::params![asset],
                        |r| r.get(0),
                    )
                    .optional()?;
                Ok(c)
            })
            .await?;
        Ok(cursor.map(FeedCursor))
    }

    async fn save_cursor(&self, asset_tag: &str, cursor: &FeedCursor) -> StoreResult<()> {
        let asset = asset_tag.to_string();
        let value = cursor.0.clone();
        let now_ms = Utc::now().timestamp_millis();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO feed_cursors (asset_tag, cursor, updated_at_ms) VALUES (?1, ?2, ?3)
                     ON CONFLICT(asset_tag) DO UPDATE SET cursor = excluded.cursor,
                         updated_at_ms = excluded.updated_at_ms",
                    rusqlite::params![asset, value, now_ms],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn track_asset(&self, asset_tag: &str, requested_at: DateTime<Utc>) -> StoreResult<bool> {
        let asset = asset_tag.to_string();
        let at_ms = requested_at.timestamp_millis();
        let inserted = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "INSERT INTO tracked_assets (asset_tag, requested_at_ms) VALUES (?1, ?2)
                     ON CONFLICT(asset_tag) DO NOTHING",
                    rusqlite::params![asset, at_ms],
                )?;
                Ok(n == 1)
            })
            .await?;
        Ok(inserted)
    }

    async fn tracked_assets(&self) -> StoreResult<Vec<String>> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT asset_tag FROM tracked_assets ORDER BY asset_tag")?;
                let rows = stmt
                    .query_map([], |r| r.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }
}
