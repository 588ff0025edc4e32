//! Note writing and mutation.
//!
//! Produces the structured Markdown document for an entry and performs safe
//! partial rewrites of marker-delimited sections. All writes go through a
//! temp file plus atomic rename; the recorded post-rename mtime is the
//! baseline for external-edit detection.

pub mod markers;

use chrono_tz::Tz;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{JournalError, Result};
use crate::store::{Entry, EntryKind, PromptAnswer};
use markers::{end_marker, parse_strict, splice_body, start_marker, FLAG_GENERATED, FLAG_IMMUTABLE};

/// Section names the note template knows how to head.
const SECTION_HEADERS: &[(&str, &str)] = &[
    ("AUDIO", "## Audio"),
    ("JOURNAL", "## Journal"),
    ("GRATITUDE", "## Gratitude"),
    ("ACCOMPLISHMENTS", "## Accomplishments"),
    ("CHALLENGES", "## Challenges"),
    ("TOMORROW", "## Tomorrow"),
    ("AI_REFLECTION", "## Reflection"),
    ("SUMMARY", "## Summary"),
    ("TRANSCRIPT", "## Transcript"),
    ("RELATED", "## Related Entries"),
];

/// Prompt key to section name, in template order.
const PROMPT_SECTIONS: [(&str, &str); 4] = [
    ("gratitude", "GRATITUDE"),
    ("accomplishments", "ACCOMPLISHMENTS"),
    ("challenges", "CHALLENGES"),
    ("tomorrow", "TOMORROW"),
];

fn header_for(name: &str) -> Option<&'static str> {
    SECTION_HEADERS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, h)| *h)
}

/// Inputs for a full note write.
#[derive(Debug, Clone)]
pub struct NoteInputs<'a> {
    pub transcript: &'a str,
    pub prompt_answers: &'a HashMap<String, PromptAnswer>,
    pub generated_sections: &'a HashMap<String, String>,
    /// Embed the AUDIO section (false when audio will be discarded).
    pub include_audio: bool,
}

/// Result of a full note write.
#[derive(Debug, Clone)]
pub struct WrittenNote {
    /// Vault-relative path (`journal/<filename>.md`).
    pub rel_path: String,
    /// Modification time (unix seconds) right after the atomic rename.
    pub mtime: i64,
}

/// Writer rooted at the vault directory.
#[derive(Debug, Clone)]
pub struct NoteWriter {
    vault_root: PathBuf,
}

impl NoteWriter {
    pub fn new(vault_root: impl Into<PathBuf>) -> Self {
        Self {
            vault_root: vault_root.into(),
        }
    }

    /// `YYYY-MM-DD-HHmmss-<kind>.md`, from the creation instant projected
    /// into the entry's timezone.
    pub fn note_filename(entry: &Entry) -> Result<String> {
        let tz: Tz = entry
            .timezone
            .parse()
            .map_err(|_| JournalError::Config(format!("invalid timezone {:?}", entry.timezone)))?;
        let local = entry.created_at.with_timezone(&tz);
        Ok(format!(
            "{}-{}.md",
            local.format("%Y-%m-%d-%H%M%S"),
            entry.kind.as_str()
        ))
    }

    fn abs(&self, rel: &str) -> PathBuf {
        self.vault_root.join(rel)
    }

    /// Produce the whole document and atomically replace the note file.
    pub fn write_note(&self, entry: &Entry, inputs: &NoteInputs<'_>) -> Result<WrittenNote> {
        let rel_path = format!("journal/{}", Self::note_filename(entry)?);
        let doc = render_note(entry, inputs)?;

        let path = self.abs(&rel_path);
        let mtime = atomic_write(&path, &doc)?;
        Ok(WrittenNote { rel_path, mtime })
    }

    /// Replace the body of one section, preserving everything outside its
    /// markers byte-for-byte. Returns the new mtime.
    pub fn update_note_section(&self, entry: &Entry, name: &str, body: &str) -> Result<i64> {
        let mut map = HashMap::new();
        map.insert(name.to_owned(), body.to_owned());
        self.update_note_content(entry, &map)
    }

    /// Replace the bodies of several sections. The existing file is
    /// strict-parsed first; corrupt markers fail the whole mutation.
    /// Sections not present in the file are skipped, never invented.
    pub fn update_note_content(
        &self,
        entry: &Entry,
        bodies: &HashMap<String, String>,
    ) -> Result<i64> {
        let rel = entry
            .note_path
            .as_deref()
            .ok_or_else(|| JournalError::Precondition("entry has no note yet".to_owned()))?;
        let path = self.abs(rel);
        let mut doc = std::fs::read_to_string(&path)?;

        // Validate structure up front; partial rewrites of a corrupt file
        // would silently destroy user content.
        parse_strict(&doc).map_err(|e| JournalError::Note(e.to_string()))?;

        // Deterministic order so repeated calls produce identical bytes.
        let mut names: Vec<&String> = bodies.keys().collect();
        names.sort();

        for name in names {
            let sections = parse_strict(&doc).map_err(|e| JournalError::Note(e.to_string()))?;
            let Some(section) = sections.iter().find(|s| s.name == *name) else {
                continue;
            };
            let formatted = format_section_body(name, &bodies[name], Some(section.body.as_str()));
            doc = splice_body(&doc, section, &formatted);
        }

        atomic_write(&path, &doc)
    }

    /// Read the note to a string, or `None` if the file is missing.
    pub fn read_note(&self, entry: &Entry) -> Result<Option<String>> {
        let Some(rel) = entry.note_path.as_deref() else {
            return Ok(None);
        };
        match std::fs::read_to_string(self.abs(rel)) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// True when the vault-side file has been modified since the writer
    /// last produced it (observed mtime strictly greater than the recorded
    /// one).
    pub fn has_external_edits(&self, entry: &Entry) -> Result<bool> {
        let (Some(rel), Some(recorded)) = (entry.note_path.as_deref(), entry.note_mtime) else {
            return Ok(false);
        };
        match std::fs::metadata(self.abs(rel)) {
            Ok(meta) => Ok(file_mtime_secs(&meta)? > recorded),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Vault-relative audio reference as seen from inside `journal/`:
/// notes live in `<vault>/journal/`, audio in `<vault>/journal/audio/`.
fn audio_ref(vault_rel: &str) -> String {
    let file = vault_rel.rsplit('/').next().unwrap_or(vault_rel);
    format!("audio/{file}")
}

fn render_note(entry: &Entry, inputs: &NoteInputs<'_>) -> Result<String> {
    let tz: Tz = entry
        .timezone
        .parse()
        .map_err(|_| JournalError::Config(format!("invalid timezone {:?}", entry.timezone)))?;
    let local = entry.created_at.with_timezone(&tz);
    let kind = entry.kind.as_str();

    let mut doc = String::with_capacity(2048);

    // Frontmatter.
    doc.push_str("---\n");
    doc.push_str(&format!("id: {}\n", entry.id));
    doc.push_str(&format!(
        "created: {}\n",
        entry.created_at.format("%Y-%m-%dT%H:%M:%SZ")
    ));
    doc.push_str(&format!("created_local: {}\n", local.format("%Y-%m-%dT%H:%M:%S%:z")));
    doc.push_str(&format!("timezone: {}\n", entry.timezone));
    doc.push_str(&format!("entry_date: {}\n", entry.entry_date));
    doc.push_str(&format!("type: {kind}\n"));
    if let Some(duration) = entry.audio_duration_secs {
        doc.push_str(&format!("audio_duration: {}\n", duration.round() as i64));
    }
    if inputs.include_audio
        && let Some(orig) = entry.original_audio_path.as_deref()
    {
        doc.push_str(&format!("audio_file: {}\n", audio_ref(orig)));
    }
    doc.push_str(&format!("tags: [journal, {kind}]\n"));
    doc.push_str("---\n\n");

    // Title and tag line.
    doc.push_str(&format!("# {} - {}\n\n", entry.kind.label(), entry.entry_date));
    doc.push_str(&format!("#journal #{kind}\n\n"));

    // AUDIO.
    if inputs.include_audio
        && let Some(orig) = entry.original_audio_path.as_deref()
    {
        let audio = audio_ref(orig);
        let body = format!("## Audio\n\n[Recording]({audio})\n\n![[{audio}]]");
        push_section(&mut doc, "AUDIO", &[FLAG_IMMUTABLE], &body);
    }

    // Kind-specific content.
    match entry.kind {
        EntryKind::BrainDump => {
            let content = inputs
                .generated_sections
                .get("JOURNAL")
                .map(String::as_str)
                .unwrap_or("");
            let body = format!("## Journal\n\n{}", content.trim());
            push_section(&mut doc, "JOURNAL", &[FLAG_GENERATED], &body);
        }
        EntryKind::DailyReflection => {
            for (key, section) in PROMPT_SECTIONS {
                let Some(answer) = inputs.prompt_answers.get(key) else {
                    continue;
                };
                let text = answer.effective_text();
                if text.is_empty() {
                    continue;
                }
                let header = header_for(section).unwrap_or_default();
                let body = format!("{header}\n\n{text}");
                push_section(&mut doc, section, &[], &body);
            }
            let reflection = inputs
                .generated_sections
                .get("AI_REFLECTION")
                .map(String::as_str)
                .unwrap_or("");
            let body = format!("## Reflection\n\n{}", reflection.trim());
            push_section(&mut doc, "AI_REFLECTION", &[FLAG_GENERATED], &body);
        }
        EntryKind::QuickNote => {}
    }

    // Any remaining generated sections (e.g. SUMMARY) the LLM produced.
    let mut extra: Vec<&String> = inputs
        .generated_sections
        .keys()
        .filter(|k| *k != "JOURNAL" && *k != "AI_REFLECTION")
        .collect();
    extra.sort();
    for name in extra {
        let body = format_section_body(name, &inputs.generated_sections[name], None);
        push_section(&mut doc, name, &[FLAG_GENERATED], &body);
    }

    // TRANSCRIPT: primary content for quick notes, collapsed for the rest.
    let transcript = inputs.transcript.trim();
    let transcript_body = match entry.kind {
        EntryKind::QuickNote => format!("## Transcript\n\n{transcript}"),
        _ => wrap_transcript_details(transcript),
    };
    push_section(&mut doc, "TRANSCRIPT", &[FLAG_IMMUTABLE], &transcript_body);

    // RELATED: empty placeholder, filled by link tooling later.
    push_section(&mut doc, "RELATED", &[FLAG_GENERATED], "");

    Ok(doc)
}

fn push_section(doc: &mut String, name: &str, flags: &[&str], body: &str) {
    doc.push_str(&start_marker(name, flags));
    doc.push('\n');
    let body = body.trim();
    if !body.is_empty() {
        doc.push_str(body);
        doc.push('\n');
    }
    doc.push_str(&end_marker(name));
    doc.push_str("\n\n");
}

fn wrap_transcript_details(transcript: &str) -> String {
    format!("<details>\n<summary>Raw Transcript</summary>\n\n{transcript}\n\n</details>")
}

/// Format a replacement body for a section.
///
/// TRANSCRIPT keeps whichever wrapper style the existing body used; other
/// known sections get their template header; unknown names pass through
/// without one.
fn format_section_body(name: &str, body: &str, existing: Option<&str>) -> String {
    let body = body.trim();
    if name == "TRANSCRIPT" {
        let wrapped = existing.is_some_and(|b| b.trim_start().starts_with("<details>"));
        return if wrapped {
            wrap_transcript_details(body)
        } else {
            format!("## Transcript\n\n{body}")
        };
    }
    match header_for(name) {
        Some(header) if !body.starts_with(header) => format!("{header}\n\n{body}"),
        _ => body.to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

/// Write `content` to `path` via a temp file in the same directory and an
/// atomic rename. Returns the post-rename mtime in unix seconds.
fn atomic_write(path: &Path, content: &str) -> Result<i64> {
    let dir = path
        .parent()
        .ok_or_else(|| JournalError::Note(format!("no parent dir for {}", path.display())))?;
    std::fs::create_dir_all(dir)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| JournalError::Note(format!("bad note path {}", path.display())))?;
    let tmp = dir.join(format!(".{file_name}.{}.tmp", std::process::id()));

    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;

    file_mtime_secs(&std::fs::metadata(path)?)
}

fn file_mtime_secs(meta: &std::fs::Metadata) -> Result<i64> {
    let mtime = meta
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| JournalError::Note(format!("mtime before epoch: {e}")))?;
    Ok(mtime.as_secs() as i64)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use chrono::{TimeZone, Utc};

    fn entry(kind: EntryKind) -> Entry {
        Entry {
            id: "abc123".to_owned(),
            created_at: Utc.with_ymd_and_hms(2026, 8, 1, 18, 30, 5).unwrap(),
            updated_at: Utc.with_ymd_and_hms(2026, 8, 1, 18, 30, 5).unwrap(),
            timezone: "America/New_York".to_owned(),
            entry_date: "2026-08-01".to_owned(),
            kind,
            stage: crate::store::Stage::Writing,
            stage_message: None,
            error_message: None,
            locked_by: None,
            locked_at: None,
            heartbeat_at: None,
            original_audio_path: Some("journal/audio/abc123-original.webm".to_owned()),
            normalized_audio_path: Some("journal/audio/abc123-normalized.wav".to_owned()),
            audio_duration_secs: Some(124.6),
            raw_transcript: Some("raw words".to_owned()),
            raw_transcript_locked_at: None,
            edited_transcript: None,
            prompt_answers: HashMap::new(),
            generated_sections: HashMap::new(),
            note_path: None,
            note_mtime: None,
        }
    }

    fn writer() -> (tempfile::TempDir, NoteWriter) {
        let dir = tempfile::tempdir().unwrap();
        let writer = NoteWriter::new(dir.path());
        (dir, writer)
    }

    #[test]
    fn filename_uses_entry_timezone() {
        // 18:30 UTC on Aug 1 is 14:30 in New York (EDT).
        let name = NoteWriter::note_filename(&entry(EntryKind::QuickNote)).unwrap();
        assert_eq!(name, "2026-08-01-143005-quick-note.md");
    }

    #[test]
    fn quick_note_transcript_is_primary_and_immutable() {
        let (_dir, writer) = writer();
        let entry = entry(EntryKind::QuickNote);
        let inputs = NoteInputs {
            transcript: "hello world",
            prompt_answers: &HashMap::new(),
            generated_sections: &HashMap::new(),
            include_audio: true,
        };
        let written = writer.write_note(&entry, &inputs).unwrap();
        let doc = std::fs::read_to_string(writer.abs(&written.rel_path)).unwrap();

        let sections = parse_strict(&doc).unwrap();
        let transcript = sections.iter().find(|s| s.name == "TRANSCRIPT").unwrap();
        assert!(transcript.has_flag(FLAG_IMMUTABLE));
        assert!(transcript.body.contains("hello world"));
        assert!(!transcript.body.contains("<details>"));
        assert!(doc.contains("type: quick-note"));
        assert!(doc.contains("tags: [journal, quick-note]"));
    }

    #[test]
    fn brain_dump_wraps_transcript_in_details() {
        let (_dir, writer) = writer();
        let entry = entry(EntryKind::BrainDump);
        let mut generated = HashMap::new();
        generated.insert("JOURNAL".to_owned(), "## TL;DR\n\nbig day".to_owned());
        let inputs = NoteInputs {
            transcript: "spoken words",
            prompt_answers: &HashMap::new(),
            generated_sections: &generated,
            include_audio: false,
        };
        let written = writer.write_note(&entry, &inputs).unwrap();
        let doc = std::fs::read_to_string(writer.abs(&written.rel_path)).unwrap();

        let sections = parse_strict(&doc).unwrap();
        let transcript = sections.iter().find(|s| s.name == "TRANSCRIPT").unwrap();
        assert!(transcript.body.starts_with("<details>"));
        assert!(transcript.body.contains("Raw Transcript"));

        let journal = sections.iter().find(|s| s.name == "JOURNAL").unwrap();
        assert!(journal.has_flag(FLAG_GENERATED));
        assert!(journal.body.contains("big day"));

        // Audio excluded: no AUDIO section, no audio_file frontmatter.
        assert!(sections.iter().all(|s| s.name != "AUDIO"));
        assert!(!doc.contains("audio_file:"));
    }

    #[test]
    fn audio_section_embeds_vault_relative_path() {
        let (_dir, writer) = writer();
        let entry = entry(EntryKind::QuickNote);
        let inputs = NoteInputs {
            transcript: "t",
            prompt_answers: &HashMap::new(),
            generated_sections: &HashMap::new(),
            include_audio: true,
        };
        let written = writer.write_note(&entry, &inputs).unwrap();
        let doc = std::fs::read_to_string(writer.abs(&written.rel_path)).unwrap();

        let sections = parse_strict(&doc).unwrap();
        let audio = sections.iter().find(|s| s.name == "AUDIO").unwrap();
        assert!(audio.has_flag(FLAG_IMMUTABLE));
        assert!(audio.body.contains("[Recording](audio/abc123-original.webm)"));
        assert!(audio.body.contains("![[audio/abc123-original.webm]]"));
        assert!(doc.contains("audio_file: audio/abc123-original.webm"));
        assert!(doc.contains("audio_duration: 125"));
    }

    #[test]
    fn reflection_note_carries_prompt_sections() {
        let (_dir, writer) = writer();
        let entry = entry(EntryKind::DailyReflection);
        let mut answers = HashMap::new();
        answers.insert(
            "gratitude".to_owned(),
            PromptAnswer {
                text: "I'm grateful for coffee".to_owned(),
                ..Default::default()
            },
        );
        let mut generated = HashMap::new();
        generated.insert("AI_REFLECTION".to_owned(), "A warm day.".to_owned());
        let inputs = NoteInputs {
            transcript: "t",
            prompt_answers: &answers,
            generated_sections: &generated,
            include_audio: false,
        };
        let written = writer.write_note(&entry, &inputs).unwrap();
        let doc = std::fs::read_to_string(writer.abs(&written.rel_path)).unwrap();

        let sections = parse_strict(&doc).unwrap();
        let gratitude = sections.iter().find(|s| s.name == "GRATITUDE").unwrap();
        assert!(gratitude.body.contains("I'm grateful for coffee"));
        let reflection = sections.iter().find(|s| s.name == "AI_REFLECTION").unwrap();
        assert!(reflection.has_flag(FLAG_GENERATED));
        assert!(reflection.body.contains("A warm day."));
        // Empty prompts are skipped entirely.
        assert!(sections.iter().all(|s| s.name != "CHALLENGES"));
    }

    #[test]
    fn written_notes_round_trip_through_the_parser() {
        let (_dir, writer) = writer();
        let entry = entry(EntryKind::BrainDump);
        let mut generated = HashMap::new();
        generated.insert("JOURNAL".to_owned(), "body".to_owned());
        let inputs = NoteInputs {
            transcript: "words",
            prompt_answers: &HashMap::new(),
            generated_sections: &generated,
            include_audio: true,
        };
        let written = writer.write_note(&entry, &inputs).unwrap();
        let path = writer.abs(&written.rel_path);
        let original = std::fs::read_to_string(&path).unwrap();

        // Splicing every section with its own body is the identity.
        let mut doc = original.clone();
        let sections = parse_strict(&doc).unwrap();
        for section in &sections {
            let reparsed = parse_strict(&doc).unwrap();
            let current = reparsed.iter().find(|s| s.name == section.name).unwrap();
            doc = splice_body(&doc, current, &current.body);
        }
        assert_eq!(doc, original);
    }

    #[test]
    fn update_section_preserves_wrapper_style() {
        let (_dir, writer) = writer();
        let mut e = entry(EntryKind::BrainDump);
        let inputs = NoteInputs {
            transcript: "before",
            prompt_answers: &HashMap::new(),
            generated_sections: &HashMap::new(),
            include_audio: false,
        };
        let written = writer.write_note(&e, &inputs).unwrap();
        e.note_path = Some(written.rel_path.clone());

        writer
            .update_note_section(&e, "TRANSCRIPT", "after editing")
            .unwrap();
        let doc = std::fs::read_to_string(writer.abs(&written.rel_path)).unwrap();
        let sections = parse_strict(&doc).unwrap();
        let transcript = sections.iter().find(|s| s.name == "TRANSCRIPT").unwrap();
        assert!(transcript.body.starts_with("<details>"));
        assert!(transcript.body.contains("after editing"));
        assert!(!transcript.body.contains("before"));
    }

    #[test]
    fn update_skips_sections_missing_from_file() {
        let (_dir, writer) = writer();
        let mut e = entry(EntryKind::QuickNote);
        let inputs = NoteInputs {
            transcript: "t",
            prompt_answers: &HashMap::new(),
            generated_sections: &HashMap::new(),
            include_audio: false,
        };
        let written = writer.write_note(&e, &inputs).unwrap();
        e.note_path = Some(written.rel_path.clone());

        let mut bodies = HashMap::new();
        bodies.insert("GRATITUDE".to_owned(), "never written".to_owned());
        writer.update_note_content(&e, &bodies).unwrap();

        let doc = std::fs::read_to_string(writer.abs(&written.rel_path)).unwrap();
        assert!(!doc.contains("never written"));
    }

    #[test]
    fn update_rejects_corrupt_markers() {
        let (_dir, writer) = writer();
        let mut e = entry(EntryKind::QuickNote);
        let inputs = NoteInputs {
            transcript: "t",
            prompt_answers: &HashMap::new(),
            generated_sections: &HashMap::new(),
            include_audio: false,
        };
        let written = writer.write_note(&e, &inputs).unwrap();
        e.note_path = Some(written.rel_path.clone());

        // Corrupt the file: drop the TRANSCRIPT end marker.
        let path = writer.abs(&written.rel_path);
        let doc = std::fs::read_to_string(&path).unwrap();
        let corrupted = doc.replace(&end_marker("TRANSCRIPT"), "");
        std::fs::write(&path, &corrupted).unwrap();

        let err = writer
            .update_note_section(&e, "TRANSCRIPT", "x")
            .unwrap_err();
        assert!(matches!(err, JournalError::Note(_)));
        // No silent repair: the file is untouched.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), corrupted);
    }

    #[test]
    fn external_edit_detection_compares_mtimes() {
        let (_dir, writer) = writer();
        let mut e = entry(EntryKind::QuickNote);
        let inputs = NoteInputs {
            transcript: "t",
            prompt_answers: &HashMap::new(),
            generated_sections: &HashMap::new(),
            include_audio: false,
        };
        let written = writer.write_note(&e, &inputs).unwrap();
        e.note_path = Some(written.rel_path.clone());
        e.note_mtime = Some(written.mtime);

        assert!(!writer.has_external_edits(&e).unwrap());

        // Touch the file one second into the future.
        let path = writer.abs(&written.rel_path);
        let future = std::time::SystemTime::UNIX_EPOCH
            + std::time::Duration::from_secs((written.mtime + 2) as u64);
        let file = std::fs::File::options().append(true).open(&path).unwrap();
        file.set_modified(future).unwrap();
        drop(file);

        assert!(writer.has_external_edits(&e).unwrap());
    }

    #[test]
    fn read_note_returns_none_when_missing() {
        let (_dir, writer) = writer();
        let mut e = entry(EntryKind::QuickNote);
        assert!(writer.read_note(&e).unwrap().is_none());
        e.note_path = Some("journal/nope.md".to_owned());
        assert!(writer.read_note(&e).unwrap().is_none());
    }
}
