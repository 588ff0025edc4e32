//! Typed settings stored in the `settings` key/value table.
//!
//! Values are persisted as strings and decoded per-read using a fixed
//! key-to-type map, exposed through the [`Settings`] struct rather than a
//! string bag. Defaults are seeded on first open.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use super::StoreError;

/// Value type for a settings key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Str,
    Int,
    Bool,
}

/// The fixed settings surface: key, type, default.
const SETTING_DEFS: &[(&str, ValueKind, &str)] = &[
    ("vault_root", ValueKind::Str, ""),
    ("whisper_model", ValueKind::Str, "base.en"),
    ("whisper_model_path", ValueKind::Str, ""),
    ("priming_text", ValueKind::Str, ""),
    ("llm_base_url", ValueKind::Str, "http://localhost:11434"),
    ("llm_model", ValueKind::Str, "llama3.2"),
    ("keep_audio", ValueKind::Bool, "true"),
    ("timezone", ValueKind::Str, "UTC"),
    ("user_name", ValueKind::Str, ""),
    ("vad_enabled", ValueKind::Bool, "false"),
    ("vad_model_path", ValueKind::Str, ""),
    ("chunk_duration_secs", ValueKind::Int, "60"),
];

/// Process-wide settings snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Root of the Obsidian-style vault. Must be set before entries can run.
    pub vault_root: String,
    /// Whisper model name (used to derive the model file when no explicit
    /// path is configured).
    pub whisper_model: String,
    /// Explicit path to the whisper model file; overrides the name lookup.
    pub whisper_model_path: String,
    /// Optional initial prompt passed to the speech tool.
    pub priming_text: String,
    pub llm_base_url: String,
    pub llm_model: String,
    /// Keep audio files after a successful note write.
    pub keep_audio: bool,
    /// Default IANA timezone for new entries.
    pub timezone: String,
    pub user_name: String,
    pub vad_enabled: bool,
    pub vad_model_path: String,
    /// Chunk window in seconds for long-audio transcription.
    pub chunk_duration_secs: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            vault_root: String::new(),
            whisper_model: "base.en".to_owned(),
            whisper_model_path: String::new(),
            priming_text: String::new(),
            llm_base_url: "http://localhost:11434".to_owned(),
            llm_model: "llama3.2".to_owned(),
            keep_audio: true,
            timezone: "UTC".to_owned(),
            user_name: String::new(),
            vad_enabled: false,
            vad_model_path: String::new(),
            chunk_duration_secs: 60,
        }
    }
}

/// Partial settings update from the HTTP facade. Missing fields are left
/// unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub vault_root: Option<String>,
    pub whisper_model: Option<String>,
    pub whisper_model_path: Option<String>,
    pub priming_text: Option<String>,
    pub llm_base_url: Option<String>,
    pub llm_model: Option<String>,
    pub keep_audio: Option<bool>,
    pub timezone: Option<String>,
    pub user_name: Option<String>,
    pub vad_enabled: Option<bool>,
    pub vad_model_path: Option<String>,
    pub chunk_duration_secs: Option<i64>,
}

impl Settings {
    /// Apply a partial update in place.
    pub fn apply(&mut self, patch: SettingsPatch) {
        if let Some(v) = patch.vault_root {
            self.vault_root = v;
        }
        if let Some(v) = patch.whisper_model {
            self.whisper_model = v;
        }
        if let Some(v) = patch.whisper_model_path {
            self.whisper_model_path = v;
        }
        if let Some(v) = patch.priming_text {
            self.priming_text = v;
        }
        if let Some(v) = patch.llm_base_url {
            self.llm_base_url = v;
        }
        if let Some(v) = patch.llm_model {
            self.llm_model = v;
        }
        if let Some(v) = patch.keep_audio {
            self.keep_audio = v;
        }
        if let Some(v) = patch.timezone {
            self.timezone = v;
        }
        if let Some(v) = patch.user_name {
            self.user_name = v;
        }
        if let Some(v) = patch.vad_enabled {
            self.vad_enabled = v;
        }
        if let Some(v) = patch.vad_model_path {
            self.vad_model_path = v;
        }
        if let Some(v) = patch.chunk_duration_secs {
            self.chunk_duration_secs = v.max(1);
        }
    }

    fn get_str(&self, key: &str) -> String {
        match key {
            "vault_root" => self.vault_root.clone(),
            "whisper_model" => self.whisper_model.clone(),
            "whisper_model_path" => self.whisper_model_path.clone(),
            "priming_text" => self.priming_text.clone(),
            "llm_base_url" => self.llm_base_url.clone(),
            "llm_model" => self.llm_model.clone(),
            "keep_audio" => self.keep_audio.to_string(),
            "timezone" => self.timezone.clone(),
            "user_name" => self.user_name.clone(),
            "vad_enabled" => self.vad_enabled.to_string(),
            "vad_model_path" => self.vad_model_path.clone(),
            "chunk_duration_secs" => self.chunk_duration_secs.to_string(),
            _ => String::new(),
        }
    }

    fn set_str(&mut self, key: &str, raw: &str, kind: ValueKind) -> Result<(), StoreError> {
        match kind {
            ValueKind::Str => {}
            ValueKind::Int => {
                raw.parse::<i64>()
                    .map_err(|_| StoreError::Decode(format!("setting {key}: not an integer")))?;
            }
            ValueKind::Bool => {
                if raw != "true" && raw != "false" {
                    return Err(StoreError::Decode(format!("setting {key}: not a boolean")));
                }
            }
        }
        match key {
            "vault_root" => self.vault_root = raw.to_owned(),
            "whisper_model" => self.whisper_model = raw.to_owned(),
            "whisper_model_path" => self.whisper_model_path = raw.to_owned(),
            "priming_text" => self.priming_text = raw.to_owned(),
            "llm_base_url" => self.llm_base_url = raw.to_owned(),
            "llm_model" => self.llm_model = raw.to_owned(),
            "keep_audio" => self.keep_audio = raw == "true",
            "timezone" => self.timezone = raw.to_owned(),
            "user_name" => self.user_name = raw.to_owned(),
            "vad_enabled" => self.vad_enabled = raw == "true",
            "vad_model_path" => self.vad_model_path = raw.to_owned(),
            "chunk_duration_secs" => self.chunk_duration_secs = raw.parse().unwrap_or(60),
            _ => {}
        }
        Ok(())
    }
}

/// Insert defaults for any missing keys (fresh database or new keys after an
/// upgrade).
pub(crate) fn seed_defaults(conn: &Connection) -> rusqlite::Result<()> {
    for (key, _, default) in SETTING_DEFS {
        conn.execute(
            "INSERT OR IGNORE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, default],
        )?;
    }
    Ok(())
}

pub(crate) fn load(conn: &Connection) -> Result<Settings, StoreError> {
    let mut settings = Settings::default();
    let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    for row in rows {
        let (key, value) = row?;
        if let Some((_, kind, _)) = SETTING_DEFS.iter().find(|(k, _, _)| *k == key) {
            settings.set_str(&key, &value, *kind)?;
        }
        // Unknown keys are ignored: they may belong to a newer version.
    }
    Ok(settings)
}

pub(crate) fn save(conn: &Connection, settings: &Settings) -> Result<(), StoreError> {
    for (key, _, _) in SETTING_DEFS {
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, settings.get_str(key)],
        )?;
    }
    Ok(())
}
