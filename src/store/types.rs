//! Shared types and helpers for the entry store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The three supported entry kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum EntryKind {
    /// Free-form voice note; the LLM produces a structured journal body.
    BrainDump,
    /// Voice plus four guided prompt answers; the LLM produces a short
    /// reflection paragraph.
    DailyReflection,
    /// Transcript only, no LLM involvement.
    QuickNote,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BrainDump => "brain-dump",
            Self::DailyReflection => "daily-reflection",
            Self::QuickNote => "quick-note",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "brain-dump" => Some(Self::BrainDump),
            "daily-reflection" => Some(Self::DailyReflection),
            "quick-note" => Some(Self::QuickNote),
            _ => None,
        }
    }

    /// Human-readable label used in note titles.
    pub fn label(self) -> &'static str {
        match self {
            Self::BrainDump => "Brain Dump",
            Self::DailyReflection => "Daily Reflection",
            Self::QuickNote => "Quick Note",
        }
    }
}

/// Entry lifecycle stage (the state machine driven by the job runner).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pending,
    Queued,
    Normalizing,
    Transcribing,
    AwaitingReview,
    AwaitingPrompts,
    Generating,
    Writing,
    Completed,
    Failed,
    Cancelled,
    CancelRequested,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Normalizing => "normalizing",
            Self::Transcribing => "transcribing",
            Self::AwaitingReview => "awaiting_review",
            Self::AwaitingPrompts => "awaiting_prompts",
            Self::Generating => "generating",
            Self::Writing => "writing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::CancelRequested => "cancel_requested",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "queued" => Some(Self::Queued),
            "normalizing" => Some(Self::Normalizing),
            "transcribing" => Some(Self::Transcribing),
            "awaiting_review" => Some(Self::AwaitingReview),
            "awaiting_prompts" => Some(Self::AwaitingPrompts),
            "generating" => Some(Self::Generating),
            "writing" => Some(Self::Writing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "cancel_requested" => Some(Self::CancelRequested),
            _ => None,
        }
    }

    /// Terminal stages never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Stages actively driven by a leased worker. Entries in one of these
    /// with a stale heartbeat are candidates for stuck-job recovery.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            Self::Normalizing | Self::Transcribing | Self::Generating | Self::Writing
        )
    }

    /// Stages from which a cancel request is accepted.
    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            Self::Queued | Self::Normalizing | Self::Transcribing | Self::Generating | Self::Writing
        )
    }
}

/// Search filter over stage families.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageClass {
    /// Anything not yet terminal.
    Active,
    /// Completed entries.
    Done,
    /// Failed or cancelled entries.
    Failed,
}

impl StageClass {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// The four guided prompt keys for daily reflections.
pub const PROMPT_KEYS: [&str; 4] = ["gratitude", "accomplishments", "challenges", "tomorrow"];

/// One guided-prompt answer: typed text plus optional extraction and
/// per-prompt voice transcript.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PromptAnswer {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_transcript: Option<String>,
}

impl PromptAnswer {
    /// The effective answer text: prefers the typed text, falls back to the
    /// extracted text, then the per-prompt transcript.
    pub fn effective_text(&self) -> &str {
        if !self.text.trim().is_empty() {
            return self.text.trim();
        }
        if let Some(t) = self.extracted_text.as_deref()
            && !t.trim().is_empty()
        {
            return t.trim();
        }
        self.audio_transcript.as_deref().map(str::trim).unwrap_or("")
    }
}

/// The central journal entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// IANA timezone the entry belongs to (drives the note filename and
    /// `created_local` frontmatter).
    pub timezone: String,
    /// Local calendar date (`YYYY-MM-DD`); user-adjustable until writing
    /// begins.
    pub entry_date: String,
    #[serde(rename = "entryType")]
    pub kind: EntryKind,
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    /// Unix seconds when the lease was taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<i64>,
    /// Unix seconds of the last worker heartbeat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<i64>,
    /// Vault-relative path to the uploaded source audio.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_audio_path: Option<String>,
    /// Vault-relative path to the normalized 16 kHz mono WAV.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_audio_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_transcript: Option<String>,
    /// Set exactly once, when the raw transcript is first recorded. The raw
    /// transcript is immutable afterwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_transcript_locked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_transcript: Option<String>,
    #[serde(default)]
    pub prompt_answers: HashMap<String, PromptAnswer>,
    #[serde(default)]
    pub generated_sections: HashMap<String, String>,
    /// Vault-relative path to the produced note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note_path: Option<String>,
    /// Modification time (unix seconds) of the note immediately after the
    /// writer's atomic rename. A later observed mtime means external edits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note_mtime: Option<i64>,
}

impl Entry {
    /// The transcript later stages should consume: the user's edited form
    /// when present, otherwise the raw transcript.
    pub fn effective_transcript(&self) -> &str {
        self.edited_transcript
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .or(self.raw_transcript.as_deref())
            .unwrap_or("")
    }
}

/// Partial update applied by [`crate::store::JournalStore::update_entry`].
/// `None` leaves the column untouched; `Some` overwrites it.
#[derive(Debug, Clone, Default)]
pub struct EntryPatch {
    pub entry_date: Option<String>,
    pub stage: Option<Stage>,
    pub stage_message: Option<Option<String>>,
    pub error_message: Option<Option<String>>,
    pub original_audio_path: Option<Option<String>>,
    pub normalized_audio_path: Option<Option<String>>,
    pub audio_duration_secs: Option<f64>,
    pub raw_transcript: Option<String>,
    pub raw_transcript_locked_at: Option<DateTime<Utc>>,
    pub edited_transcript: Option<String>,
    pub prompt_answers: Option<HashMap<String, PromptAnswer>>,
    pub generated_sections: Option<HashMap<String, String>>,
    pub note_path: Option<String>,
    pub note_mtime: Option<i64>,
    pub heartbeat_at: Option<i64>,
}

/// Typed relation between two entries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Related,
    Followup,
    Reference,
}

impl LinkType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Related => "related",
            Self::Followup => "followup",
            Self::Reference => "reference",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "related" => Some(Self::Related),
            "followup" => Some(Self::Followup),
            "reference" => Some(Self::Reference),
            _ => None,
        }
    }
}

/// Directed edge between two entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryLink {
    pub source_id: String,
    pub target_id: String,
    pub link_type: LinkType,
    pub created_at: DateTime<Utc>,
}

/// Generate a collision-free opaque entry id.
pub(crate) fn new_entry_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub(crate) fn now_epoch_secs() -> i64 {
    Utc::now().timestamp()
}
