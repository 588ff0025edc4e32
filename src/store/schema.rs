//! SQLite DDL for the journal store.
//!
//! All `CREATE TABLE` / `CREATE INDEX` / `CREATE TRIGGER` statements live
//! here so they are reviewable and testable in isolation.

use rusqlite::Connection;

/// Complete DDL for the journal database.
///
/// Uses `IF NOT EXISTS` throughout so `apply_schema` is idempotent. The FTS5
/// index is kept in lockstep with the transcript and generated-section
/// columns by triggers, so search never goes stale.
pub(crate) const SCHEMA_SQL: &str = r#"
-- Enable WAL mode for concurrent reads during writes.
PRAGMA journal_mode = WAL;

-- Enforce foreign key constraints.
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS entries (
    id                       TEXT PRIMARY KEY,
    created_at               TEXT NOT NULL,
    updated_at               TEXT NOT NULL,
    timezone                 TEXT NOT NULL,
    entry_date               TEXT NOT NULL,      -- local calendar date, YYYY-MM-DD
    kind                     TEXT NOT NULL,      -- brain-dump | daily-reflection | quick-note
    stage                    TEXT NOT NULL DEFAULT 'pending',
    stage_message            TEXT,
    error_message            TEXT,
    locked_by                TEXT,
    locked_at                INTEGER,            -- unix seconds
    heartbeat_at             INTEGER,            -- unix seconds
    original_audio_path      TEXT,
    normalized_audio_path    TEXT,
    audio_duration_secs      REAL,
    raw_transcript           TEXT,
    raw_transcript_locked_at TEXT,
    edited_transcript        TEXT,
    prompt_answers           TEXT NOT NULL DEFAULT '{}',  -- JSON object keyed by prompt
    generated_sections       TEXT NOT NULL DEFAULT '{}',  -- JSON object keyed by section name
    note_path                TEXT,
    note_mtime               INTEGER             -- unix seconds at atomic rename
);

CREATE INDEX IF NOT EXISTS idx_entries_stage      ON entries(stage);
CREATE INDEX IF NOT EXISTS idx_entries_created_at ON entries(created_at);
CREATE INDEX IF NOT EXISTS idx_entries_entry_date ON entries(entry_date);

CREATE TABLE IF NOT EXISTS entry_links (
    source_id  TEXT NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
    target_id  TEXT NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
    link_type  TEXT NOT NULL,      -- related | followup | reference
    created_at TEXT NOT NULL,
    PRIMARY KEY (source_id, target_id, link_type)
);

CREATE INDEX IF NOT EXISTS idx_links_target ON entry_links(target_id);

CREATE TABLE IF NOT EXISTS settings (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Full-text index over the searchable text columns. entry_id is carried as
-- an unindexed column so search results join back to entries.
CREATE VIRTUAL TABLE IF NOT EXISTS entries_fts USING fts5(
    entry_id UNINDEXED,
    raw_transcript,
    edited_transcript,
    sections_text
);

CREATE TRIGGER IF NOT EXISTS entries_fts_insert AFTER INSERT ON entries BEGIN
    INSERT INTO entries_fts (entry_id, raw_transcript, edited_transcript, sections_text)
    VALUES (
        NEW.id,
        coalesce(NEW.raw_transcript, ''),
        coalesce(NEW.edited_transcript, ''),
        coalesce((SELECT group_concat(value, ' ') FROM json_each(NEW.generated_sections)), '')
    );
END;

CREATE TRIGGER IF NOT EXISTS entries_fts_update AFTER UPDATE OF
    raw_transcript, edited_transcript, generated_sections ON entries BEGIN
    DELETE FROM entries_fts WHERE entry_id = OLD.id;
    INSERT INTO entries_fts (entry_id, raw_transcript, edited_transcript, sections_text)
    VALUES (
        NEW.id,
        coalesce(NEW.raw_transcript, ''),
        coalesce(NEW.edited_transcript, ''),
        coalesce((SELECT group_concat(value, ' ') FROM json_each(NEW.generated_sections)), '')
    );
END;

CREATE TRIGGER IF NOT EXISTS entries_fts_delete AFTER DELETE ON entries BEGIN
    DELETE FROM entries_fts WHERE entry_id = OLD.id;
END;
"#;

/// Apply the full schema to an open connection.
///
/// Safe to call multiple times. All statements use `IF NOT EXISTS`.
pub(crate) fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)
}
