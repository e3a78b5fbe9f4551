//! SQL schema for the SQLite signal store.
//!
//! Executed once at connection startup. Timestamps are stored as UTC
//! milliseconds so ordering is a plain integer comparison.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- Mentions and signals are strictly append-only.
-- No UPDATE or DELETE is ever issued against these tables.
CREATE TABLE IF NOT EXISTS mentions (
    mention_id       INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id        TEXT    NOT NULL UNIQUE,
    asset_tag        TEXT    NOT NULL,
    author_handle    TEXT    NOT NULL,
    body_text        TEXT    NOT NULL,
    media_refs       TEXT    NOT NULL DEFAULT '[]',  -- JSON array
    observed_at_ms   INTEGER NOT NULL,
    fetch_batch_id   TEXT    NOT NULL,
    scoring_status   TEXT    NOT NULL,               -- 'scored' | 'scoring_exhausted'
    scoring_attempts INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS signals (
    signal_id      INTEGER PRIMARY KEY AUTOINCREMENT,
    mention_id     INTEGER NOT NULL REFERENCES mentions(mention_id),
    asset_tag      TEXT    NOT NULL,
    kind           TEXT    NOT NULL,                 -- 'sentiment' | 'pnl_extraction'
    label          TEXT    NOT NULL,
    confidence     REAL    NOT NULL,
    numeric_fields TEXT    NOT NULL DEFAULT '{}',    -- JSON object
    computed_at_ms INTEGER NOT NULL,
    scorer_version TEXT    NOT NULL
);

-- Last successful feed cursor per asset; overwritten on every tick.
CREATE TABLE IF NOT EXISTS feed_cursors (
    asset_tag     TEXT PRIMARY KEY,
    cursor        TEXT    NOT NULL,
    updated_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS tracked_assets (
    asset_tag       TEXT PRIMARY KEY,
    requested_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS mentions_asset_observed_idx ON mentions(asset_tag, observed_at_ms, mention_id);
CREATE INDEX IF NOT EXISTS signals_asset_computed_idx  ON signals(asset_tag, computed_at_ms, signal_id);

PRAGMA user_version = 1;
";
