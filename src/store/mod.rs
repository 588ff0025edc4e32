//! SQLite-backed entry store.
//!
//! Single database file with WAL mode, wrapped in a `Mutex<Connection>`.
//! All pipeline and HTTP mutations go through this type; every mutation
//! stamps `updated_at`. The FTS index is maintained by triggers (see
//! [`schema`]), so transcript and section writes are searchable immediately.

mod schema;
pub mod search;
pub mod settings;
mod types;

pub use search::{SearchPage, SearchQuery};
pub use settings::{Settings, SettingsPatch};
pub use types::{
    Entry, EntryKind, EntryLink, EntryPatch, LinkType, PromptAnswer, Stage, StageClass,
    PROMPT_KEYS,
};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use types::{new_entry_id, now_epoch_secs};

/// Errors from the entry store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store lock poisoned: {0}")]
    Lock(String),

    #[error("raw transcript is locked for entry {0}")]
    TranscriptLocked(String),

    #[error("invalid stored value: {0}")]
    Decode(String),
}

/// SQLite-backed store for entries, links, and settings.
pub struct JournalStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for JournalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalStore").finish_non_exhaustive()
    }
}

const ENTRY_COLUMNS: &str = "id, created_at, updated_at, timezone, entry_date, kind, stage, \
     stage_message, error_message, locked_by, locked_at, heartbeat_at, \
     original_audio_path, normalized_audio_path, audio_duration_secs, \
     raw_transcript, raw_transcript_locked_at, edited_transcript, \
     prompt_answers, generated_sections, note_path, note_mtime";

impl JournalStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(format!("create db dir: {e}")))?;
        }
        let conn = Connection::open(path)?;
        schema::apply_schema(&conn)?;
        settings::seed_defaults(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (tests).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        schema::apply_schema(&conn)?;
        settings::seed_defaults(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Entries
    // -----------------------------------------------------------------------

    /// Insert a fresh entry in the `pending` stage.
    pub fn create_entry(
        &self,
        kind: EntryKind,
        entry_date: &str,
        timezone: &str,
    ) -> Result<Entry, StoreError> {
        let conn = self.lock()?;
        let now = Utc::now();
        let id = new_entry_id();

        conn.execute(
            "INSERT INTO entries (id, created_at, updated_at, timezone, entry_date, kind, stage) \
             VALUES (?1, ?2, ?2, ?3, ?4, ?5, 'pending')",
            params![id, fmt_ts(now), timezone, entry_date, kind.as_str()],
        )?;

        drop(conn);
        self.get_entry(&id)
    }

    /// Fetch an entry by id.
    pub fn get_entry(&self, id: &str) -> Result<Entry, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![id], row_to_entry)?;
        match rows.next() {
            Some(entry) => Ok(entry??),
            None => Err(StoreError::NotFound(format!("entry {id}"))),
        }
    }

    /// List the most recent entries, newest first.
    pub fn list_entries(&self, limit: usize, offset: usize) -> Result<Vec<Entry>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM entries ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], row_to_entry)?;
        collect_entries(rows)
    }

    /// Total number of entries.
    pub fn count_entries(&self) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT count(*) FROM entries", [], |row| row.get(0))?)
    }

    /// The oldest unleased entry the worker can act on: freshly queued work
    /// plus entries parked by an HTTP `continue` at `generating`/`writing`.
    pub fn next_runnable(&self) -> Result<Option<Entry>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM entries \
             WHERE stage IN ('queued', 'generating', 'writing') AND locked_by IS NULL \
             ORDER BY created_at ASC LIMIT 1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map([], row_to_entry)?;
        match rows.next() {
            Some(entry) => Ok(Some(entry??)),
            None => Ok(None),
        }
    }

    /// Entries whose stage requests cancellation, for the runner's sweep.
    pub fn cancel_requested_entries(&self) -> Result<Vec<Entry>, StoreError> {
        let conn = self.lock()?;
        let sql =
            format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE stage = 'cancel_requested'");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_entry)?;
        collect_entries(rows)
    }

    /// Reset entries stuck in a running stage with a stale heartbeat back to
    /// `queued`. Returns the ids that were reset.
    pub fn recover_stuck(
        &self,
        heartbeat_threshold_secs: i64,
        message: &str,
    ) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let cutoff = now_epoch_secs() - heartbeat_threshold_secs;

        let mut stmt = conn.prepare(
            "SELECT id FROM entries \
             WHERE stage IN ('normalizing', 'transcribing', 'generating', 'writing') \
             AND (heartbeat_at IS NULL OR heartbeat_at < ?1)",
        )?;
        let ids: Vec<String> = stmt
            .query_map(params![cutoff], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        for id in &ids {
            conn.execute(
                "UPDATE entries SET stage = 'queued', stage_message = ?1, \
                 locked_by = NULL, locked_at = NULL, updated_at = ?2 WHERE id = ?3",
                params![message, fmt_ts(Utc::now()), id],
            )?;
        }
        Ok(ids)
    }

    /// Apply a partial update. Always stamps `updated_at`. Refuses to touch
    /// `raw_transcript` once `raw_transcript_locked_at` is set.
    pub fn update_entry(&self, id: &str, patch: &EntryPatch) -> Result<Entry, StoreError> {
        {
            let conn = self.lock()?;

            if patch.raw_transcript.is_some() {
                let locked: Option<String> = conn
                    .query_row(
                        "SELECT raw_transcript_locked_at FROM entries WHERE id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .map_err(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => {
                            StoreError::NotFound(format!("entry {id}"))
                        }
                        other => StoreError::Sqlite(other),
                    })?;
                if locked.is_some() {
                    return Err(StoreError::TranscriptLocked(id.to_owned()));
                }
            }

            let mut sets: Vec<String> = vec!["updated_at = ?".to_owned()];
            let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(fmt_ts(Utc::now()))];

            let mut push = |col: &str, value: Box<dyn rusqlite::ToSql>| {
                sets.push(format!("{col} = ?"));
                values.push(value);
            };

            if let Some(v) = &patch.entry_date {
                push("entry_date", Box::new(v.clone()));
            }
            if let Some(v) = patch.stage {
                push("stage", Box::new(v.as_str()));
            }
            if let Some(v) = &patch.stage_message {
                push("stage_message", Box::new(v.clone()));
            }
            if let Some(v) = &patch.error_message {
                push("error_message", Box::new(v.clone()));
            }
            if let Some(v) = &patch.original_audio_path {
                push("original_audio_path", Box::new(v.clone()));
            }
            if let Some(v) = &patch.normalized_audio_path {
                push("normalized_audio_path", Box::new(v.clone()));
            }
            if let Some(v) = patch.audio_duration_secs {
                push("audio_duration_secs", Box::new(v));
            }
            if let Some(v) = &patch.raw_transcript {
                push("raw_transcript", Box::new(v.clone()));
            }
            if let Some(v) = patch.raw_transcript_locked_at {
                push("raw_transcript_locked_at", Box::new(fmt_ts(v)));
            }
            if let Some(v) = &patch.edited_transcript {
                push("edited_transcript", Box::new(v.clone()));
            }
            if let Some(v) = &patch.prompt_answers {
                push("prompt_answers", Box::new(encode_json(v)?));
            }
            if let Some(v) = &patch.generated_sections {
                push("generated_sections", Box::new(encode_json(v)?));
            }
            if let Some(v) = &patch.note_path {
                push("note_path", Box::new(v.clone()));
            }
            if let Some(v) = patch.note_mtime {
                push("note_mtime", Box::new(v));
            }
            if let Some(v) = patch.heartbeat_at {
                push("heartbeat_at", Box::new(v));
            }

            let sql = format!("UPDATE entries SET {} WHERE id = ?", sets.join(", "));
            values.push(Box::new(id.to_owned()));

            let changed =
                conn.execute(&sql, rusqlite::params_from_iter(values.iter().map(|v| &**v)))?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("entry {id}")));
            }
        }
        self.get_entry(id)
    }

    /// Delete an entry row (the vault-side note file is untouched).
    pub fn delete_entry(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM entries WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("entry {id}")));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lease
    // -----------------------------------------------------------------------

    /// CAS-style lease acquisition: succeeds only while the entry is still in
    /// `expected_stage` and unlocked (or already held by this worker).
    pub fn try_lease(
        &self,
        id: &str,
        worker_id: &str,
        expected_stage: Stage,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let now = now_epoch_secs();
        let changed = conn.execute(
            "UPDATE entries SET locked_by = ?1, locked_at = ?2, heartbeat_at = ?2, updated_at = ?3 \
             WHERE id = ?4 AND stage = ?5 AND (locked_by IS NULL OR locked_by = ?1)",
            params![worker_id, now, fmt_ts(Utc::now()), id, expected_stage.as_str()],
        )?;
        Ok(changed == 1)
    }

    /// Drop the lease (parking or finishing an entry).
    pub fn release_lease(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE entries SET locked_by = NULL, locked_at = NULL, updated_at = ?1 WHERE id = ?2",
            params![fmt_ts(Utc::now()), id],
        )?;
        Ok(())
    }

    /// Refresh the heartbeat for a leased entry.
    pub fn heartbeat(&self, id: &str, worker_id: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE entries SET heartbeat_at = ?1 WHERE id = ?2 AND locked_by = ?3",
            params![now_epoch_secs(), id, worker_id],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Links
    // -----------------------------------------------------------------------

    pub fn add_link(
        &self,
        source_id: &str,
        target_id: &str,
        link_type: LinkType,
    ) -> Result<EntryLink, StoreError> {
        let conn = self.lock()?;
        let now = Utc::now();
        conn.execute(
            "INSERT OR IGNORE INTO entry_links (source_id, target_id, link_type, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![source_id, target_id, link_type.as_str(), fmt_ts(now)],
        )?;
        Ok(EntryLink {
            source_id: source_id.to_owned(),
            target_id: target_id.to_owned(),
            link_type,
            created_at: now,
        })
    }

    pub fn remove_link(
        &self,
        source_id: &str,
        target_id: &str,
        link_type: LinkType,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "DELETE FROM entry_links WHERE source_id = ?1 AND target_id = ?2 AND link_type = ?3",
            params![source_id, target_id, link_type.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Links where the entry appears on either side.
    pub fn links_for(&self, id: &str) -> Result<Vec<EntryLink>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT source_id, target_id, link_type, created_at FROM entry_links \
             WHERE source_id = ?1 OR target_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            let link_type: String = row.get(2)?;
            let created_at: String = row.get(3)?;
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                link_type,
                created_at,
            ))
        })?;

        let mut links = Vec::new();
        for row in rows {
            let (source_id, target_id, link_type, created_at) = row?;
            links.push(EntryLink {
                source_id,
                target_id,
                link_type: LinkType::parse(&link_type)
                    .ok_or_else(|| StoreError::Decode(format!("link type {link_type}")))?,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(links)
    }

    // -----------------------------------------------------------------------
    // Search / settings plumbing
    // -----------------------------------------------------------------------

    /// Full-text + filtered search. See [`search`].
    pub fn search(&self, query: &SearchQuery) -> Result<SearchPage, StoreError> {
        let conn = self.lock()?;
        search::run(&conn, query)
    }

    /// Load the typed settings snapshot.
    pub fn settings(&self) -> Result<Settings, StoreError> {
        let conn = self.lock()?;
        settings::load(&conn)
    }

    /// Persist changed settings values.
    pub fn update_settings(&self, settings: &Settings) -> Result<(), StoreError> {
        let conn = self.lock()?;
        settings::save(&conn, settings)
    }
}

// ---------------------------------------------------------------------------
// Row conversion
// ---------------------------------------------------------------------------

pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Decode(format!("timestamp {raw:?}: {e}")))
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Decode(format!("encode json: {e}")))
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<Result<Entry, StoreError>> {
    // Defer decode failures so rusqlite's query_map error channel stays for
    // SQL-level problems only.
    Ok(decode_entry(row))
}

fn decode_entry(row: &Row<'_>) -> Result<Entry, StoreError> {
    let kind_raw: String = row.get(5)?;
    let stage_raw: String = row.get(6)?;
    let created_at: String = row.get(1)?;
    let updated_at: String = row.get(2)?;
    let locked_raw: Option<String> = row.get(16)?;
    let prompt_answers_raw: String = row.get(18)?;
    let generated_sections_raw: String = row.get(19)?;

    let prompt_answers: HashMap<String, PromptAnswer> = serde_json::from_str(&prompt_answers_raw)
        .map_err(|e| StoreError::Decode(format!("prompt_answers: {e}")))?;
    let generated_sections: HashMap<String, String> =
        serde_json::from_str(&generated_sections_raw)
            .map_err(|e| StoreError::Decode(format!("generated_sections: {e}")))?;

    Ok(Entry {
        id: row.get(0)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
        timezone: row.get(3)?,
        entry_date: row.get(4)?,
        kind: EntryKind::parse(&kind_raw)
            .ok_or_else(|| StoreError::Decode(format!("entry kind {kind_raw}")))?,
        stage: Stage::parse(&stage_raw)
            .ok_or_else(|| StoreError::Decode(format!("stage {stage_raw}")))?,
        stage_message: row.get(7)?,
        error_message: row.get(8)?,
        locked_by: row.get(9)?,
        locked_at: row.get(10)?,
        heartbeat_at: row.get(11)?,
        original_audio_path: row.get(12)?,
        normalized_audio_path: row.get(13)?,
        audio_duration_secs: row.get(14)?,
        raw_transcript: row.get(15)?,
        raw_transcript_locked_at: locked_raw.as_deref().map(parse_ts).transpose()?,
        edited_transcript: row.get(17)?,
        prompt_answers,
        generated_sections,
        note_path: row.get(20)?,
        note_mtime: row.get(21)?,
    })
}

fn collect_entries<I>(rows: I) -> Result<Vec<Entry>, StoreError>
where
    I: Iterator<Item = rusqlite::Result<Result<Entry, StoreError>>>,
{
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row??);
    }
    Ok(entries)
}
