//! The single-worker job runner.
//!
//! One background task owns the whole pipeline. Each tick it recovers stuck
//! entries, finalizes pending cancellations, then leases and runs the oldest
//! runnable entry through the stage machine. Stages are idempotent so a
//! crash mid-stage only costs a re-run after the heartbeat threshold.

pub mod progress;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio;
use crate::error::{JournalError, Result};
use crate::llm::LlmClient;
use crate::note::{NoteInputs, NoteWriter};
use crate::process::ChildTable;
use crate::store::{Entry, EntryPatch, JournalStore, Settings, Stage};
use crate::transcribe::{TranscribeOptions, Transcriber};

/// Stage message used when stuck-job recovery re-queues an entry.
pub const RESET_MESSAGE: &str = "reset after stale heartbeat; stage will re-run";

/// Runner timing knobs.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Interval between scheduler ticks.
    pub tick_interval: Duration,
    /// Heartbeats older than this mark a running entry as stuck.
    pub heartbeat_threshold: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            heartbeat_threshold: Duration::from_secs(300),
        }
    }
}

/// How a stage body left the entry.
enum StageAdvance {
    /// Stage done, next stage set; keep driving this entry.
    Continue,
    /// Entry parked (awaiting user input) or finished; lease released.
    Stop,
}

/// Background worker that drives entries through the stage machine.
pub struct JobRunner {
    store: Arc<JournalStore>,
    children: Arc<ChildTable>,
    worker_id: String,
    config: RunnerConfig,
    shutdown: CancellationToken,
}

impl JobRunner {
    pub fn new(
        store: Arc<JournalStore>,
        children: Arc<ChildTable>,
        config: RunnerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let worker_id = format!("worker-{}", uuid::Uuid::new_v4().simple());
        Self {
            store,
            children,
            worker_id,
            config,
            shutdown,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Spawn the tick loop as a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(worker_id = %self.worker_id, "job runner started");
            let mut interval = tokio::time::interval(self.config.tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = self.shutdown.cancelled() => {
                        info!(worker_id = %self.worker_id, "job runner stopping");
                        return;
                    }
                    _ = interval.tick() => {
                        self.tick().await;
                    }
                }
            }
        })
    }

    /// One scheduler pass: recover, sweep cancels, pick, lease, run.
    pub async fn tick(&self) {
        match self
            .store
            .recover_stuck(self.config.heartbeat_threshold.as_secs() as i64, RESET_MESSAGE)
        {
            Ok(ids) if !ids.is_empty() => {
                warn!(count = ids.len(), ?ids, "re-queued stuck entries");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "stuck-entry recovery failed"),
        }

        match self.store.cancel_requested_entries() {
            Ok(entries) => {
                for entry in entries {
                    self.finalize_cancel(&entry).await;
                }
            }
            Err(e) => error!(error = %e, "cancel sweep failed"),
        }

        let next = match self.store.next_runnable() {
            Ok(next) => next,
            Err(e) => {
                error!(error = %e, "queue query failed");
                return;
            }
        };
        let Some(entry) = next else {
            return;
        };

        match self.store.try_lease(&entry.id, &self.worker_id, entry.stage) {
            Ok(true) => self.run_entry(entry.id.clone()).await,
            Ok(false) => debug!(entry_id = %entry.id, "lease lost, skipping"),
            Err(e) => error!(entry_id = %entry.id, error = %e, "lease failed"),
        }
    }

    /// Drive one leased entry until it parks, finishes, fails, or cancels.
    async fn run_entry(&self, id: String) {
        loop {
            let entry = match self.store.get_entry(&id) {
                Ok(entry) => entry,
                Err(e) => {
                    // Deleted mid-run; nothing left to do.
                    warn!(entry_id = %id, error = %e, "entry vanished mid-run");
                    return;
                }
            };

            if entry.stage == Stage::CancelRequested {
                self.finalize_cancel(&entry).await;
                return;
            }

            let outcome = match entry.stage {
                Stage::Queued | Stage::Normalizing => self.stage_normalize(&entry).await,
                Stage::Transcribing => self.stage_transcribe(&entry).await,
                Stage::Generating => self.stage_generate(&entry).await,
                Stage::Writing => self.stage_write(&entry).await,
                // Parked or terminal stages are not worker-driven.
                _ => {
                    let _ = self.store.release_lease(&id);
                    return;
                }
            };

            match outcome {
                Ok(StageAdvance::Continue) => {}
                Ok(StageAdvance::Stop) => return,
                Err(JournalError::Cancelled) => {
                    if let Ok(entry) = self.store.get_entry(&id) {
                        self.finalize_cancel(&entry).await;
                    }
                    return;
                }
                Err(e) => {
                    // A tool killed by a cancel surfaces as a stage error;
                    // the cancel request wins over the failure.
                    match self.store.get_entry(&id) {
                        Ok(entry) if entry.stage == Stage::CancelRequested => {
                            self.finalize_cancel(&entry).await;
                        }
                        _ => self.mark_failed(&id, &e),
                    }
                    return;
                }
            }
        }
    }

    // -------------------------------------------------------------------
    // Stage bodies
    // -------------------------------------------------------------------

    async fn stage_normalize(&self, entry: &Entry) -> Result<StageAdvance> {
        let settings = self.settings()?;
        let vault = vault_root(&settings)?;

        let original_rel = entry.original_audio_path.as_deref().ok_or_else(|| {
            JournalError::Store("entry is queued but has no uploaded audio".to_owned())
        })?;

        self.set_stage(&entry.id, Stage::Normalizing, "Normalizing audio")?;
        self.beat(&entry.id);

        let original = vault.join(original_rel);
        let normalized_rel = format!("journal/audio/{}-normalized.wav", entry.id);
        let normalized = vault.join(&normalized_rel);

        let duration =
            audio::probe_duration(&self.children, &entry.id, &original).await?;
        self.beat(&entry.id);
        audio::normalize(&self.children, &entry.id, &original, &normalized).await?;

        self.store.update_entry(
            &entry.id,
            &EntryPatch {
                normalized_audio_path: Some(Some(normalized_rel)),
                audio_duration_secs: Some(duration),
                stage: Some(Stage::Transcribing),
                stage_message: Some(Some("Transcribing audio".to_owned())),
                ..Default::default()
            },
        )?;
        Ok(StageAdvance::Continue)
    }

    async fn stage_transcribe(&self, entry: &Entry) -> Result<StageAdvance> {
        let settings = self.settings()?;
        let vault = vault_root(&settings)?;

        // Resuming after a crash that already produced a transcript: the raw
        // transcript is locked, so only the park transition remains.
        if entry.raw_transcript_locked_at.is_some() {
            return self.park(&entry.id, Stage::AwaitingReview, "Awaiting review");
        }

        let normalized_rel = entry.normalized_audio_path.as_deref().ok_or_else(|| {
            JournalError::Store("transcribing without normalized audio".to_owned())
        })?;
        let duration = entry.audio_duration_secs.ok_or_else(|| {
            JournalError::Store("transcribing without measured duration".to_owned())
        })?;

        self.set_stage(&entry.id, Stage::Transcribing, "Transcribing audio")?;

        let opts = transcribe_options(&settings)?;
        let transcriber = Transcriber::new(&self.children, &entry.id, opts);

        let store = Arc::clone(&self.store);
        let worker = self.worker_id.clone();
        let id = entry.id.clone();
        let heartbeat = move || {
            if let Err(e) = store.heartbeat(&id, &worker) {
                warn!(entry_id = %id, error = %e, "heartbeat failed");
            }
        };

        let wav = vault.join(normalized_rel);
        let temp_dir = vault.join("journal/audio");
        let transcript = transcriber
            .transcribe(&wav, duration, &temp_dir, &heartbeat)
            .await?;

        self.store.update_entry(
            &entry.id,
            &EntryPatch {
                raw_transcript: Some(transcript),
                raw_transcript_locked_at: Some(Utc::now()),
                ..Default::default()
            },
        )?;
        self.park(&entry.id, Stage::AwaitingReview, "Awaiting review")
    }

    async fn stage_generate(&self, entry: &Entry) -> Result<StageAdvance> {
        let settings = self.settings()?;

        self.set_stage(&entry.id, Stage::Generating, "Generating journal text")?;
        self.beat(&entry.id);

        let client = LlmClient::new(&settings.llm_base_url, &settings.llm_model);
        let output = client
            .generate(
                entry.effective_transcript(),
                &entry.prompt_answers,
                entry.kind,
                &settings.user_name,
            )
            .await?;

        let mut sections: HashMap<String, String> = HashMap::new();
        if let Some(content) = output.content {
            sections.insert("JOURNAL".to_owned(), content);
        }
        if let Some(reflection) = output.reflection {
            sections.insert("AI_REFLECTION".to_owned(), reflection);
        }

        self.store.update_entry(
            &entry.id,
            &EntryPatch {
                generated_sections: Some(sections),
                stage: Some(Stage::Writing),
                stage_message: Some(Some("Writing note".to_owned())),
                ..Default::default()
            },
        )?;
        Ok(StageAdvance::Continue)
    }

    async fn stage_write(&self, entry: &Entry) -> Result<StageAdvance> {
        let settings = self.settings()?;
        let vault = vault_root(&settings)?;

        self.set_stage(&entry.id, Stage::Writing, "Writing note")?;
        self.beat(&entry.id);

        let writer = NoteWriter::new(&vault);
        let inputs = NoteInputs {
            transcript: entry.effective_transcript(),
            prompt_answers: &entry.prompt_answers,
            generated_sections: &entry.generated_sections,
            include_audio: settings.keep_audio && entry.original_audio_path.is_some(),
        };
        let written = writer.write_note(entry, &inputs)?;

        if !settings.keep_audio {
            for rel in [
                entry.original_audio_path.as_deref(),
                entry.normalized_audio_path.as_deref(),
            ]
            .into_iter()
            .flatten()
            {
                audio::remove_audio(&vault.join(rel))?;
            }
        }

        self.store.update_entry(
            &entry.id,
            &EntryPatch {
                note_path: Some(written.rel_path),
                note_mtime: Some(written.mtime),
                stage: Some(Stage::Completed),
                stage_message: Some(Some("Completed".to_owned())),
                error_message: Some(None),
                ..Default::default()
            },
        )?;
        let _ = self.store.release_lease(&entry.id);
        info!(entry_id = %entry.id, "entry completed");
        Ok(StageAdvance::Stop)
    }

    // -------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------

    /// Kill any live child, drop the normalized WAV, and mark the entry
    /// cancelled. Idempotent; safe to call from the sweep or mid-run.
    async fn finalize_cancel(&self, entry: &Entry) {
        self.children.kill(&entry.id).await;

        if let (Ok(settings), Some(rel)) =
            (self.settings(), entry.normalized_audio_path.as_deref())
            && !settings.vault_root.trim().is_empty()
        {
            let path = PathBuf::from(&settings.vault_root).join(rel);
            if let Err(e) = audio::remove_audio(&path) {
                warn!(entry_id = %entry.id, error = %e, "could not remove normalized audio");
            }
        }

        let result = self.store.update_entry(
            &entry.id,
            &EntryPatch {
                stage: Some(Stage::Cancelled),
                stage_message: Some(Some("Cancelled".to_owned())),
                ..Default::default()
            },
        );
        if let Err(e) = result {
            error!(entry_id = %entry.id, error = %e, "could not mark entry cancelled");
        }
        let _ = self.store.release_lease(&entry.id);
        info!(entry_id = %entry.id, "entry cancelled");
    }

    fn mark_failed(&self, id: &str, err: &JournalError) {
        let diagnostic = err.to_string();
        error!(entry_id = %id, error = %diagnostic, "stage failed");
        let result = self.store.update_entry(
            id,
            &EntryPatch {
                stage: Some(Stage::Failed),
                error_message: Some(Some(diagnostic)),
                ..Default::default()
            },
        );
        if let Err(e) = result {
            error!(entry_id = %id, error = %e, "could not mark entry failed");
        }
        let _ = self.store.release_lease(id);
    }

    fn settings(&self) -> Result<Settings> {
        Ok(self.store.settings()?)
    }

    fn set_stage(&self, id: &str, stage: Stage, message: &str) -> Result<()> {
        self.store.update_entry(
            id,
            &EntryPatch {
                stage: Some(stage),
                stage_message: Some(Some(message.to_owned())),
                ..Default::default()
            },
        )?;
        Ok(())
    }

    fn park(&self, id: &str, stage: Stage, message: &str) -> Result<StageAdvance> {
        self.set_stage(id, stage, message)?;
        let _ = self.store.release_lease(id);
        Ok(StageAdvance::Stop)
    }

    fn beat(&self, id: &str) {
        if let Err(e) = self.store.heartbeat(id, &self.worker_id) {
            warn!(entry_id = %id, error = %e, "heartbeat failed");
        }
    }
}

fn vault_root(settings: &Settings) -> Result<PathBuf> {
    let root = settings.vault_root.trim();
    if root.is_empty() {
        return Err(JournalError::Config(
            "vault root is not configured".to_owned(),
        ));
    }
    Ok(PathBuf::from(root))
}

/// Resolve transcriber options from settings: the whisper binary comes from
/// PATH, the model from the explicit path or the models directory.
fn transcribe_options(settings: &Settings) -> Result<TranscribeOptions> {
    let binary = which::which("whisper-cli")
        .map_err(|_| JournalError::Config("whisper-cli not found on PATH".to_owned()))?;

    let model_path = if settings.whisper_model_path.trim().is_empty() {
        crate::models_dir().join(format!("ggml-{}.bin", settings.whisper_model))
    } else {
        PathBuf::from(settings.whisper_model_path.trim())
    };
    if !model_path.is_file() {
        return Err(JournalError::Config(format!(
            "whisper model file missing: {}",
            model_path.display()
        )));
    }

    let vad_model_path = if settings.vad_enabled && !settings.vad_model_path.trim().is_empty() {
        Some(PathBuf::from(settings.vad_model_path.trim()))
    } else {
        None
    };

    Ok(TranscribeOptions {
        binary,
        model_path,
        language: None,
        priming_text: (!settings.priming_text.trim().is_empty())
            .then(|| settings.priming_text.trim().to_owned()),
        vad_model_path,
        chunk_secs: settings.chunk_duration_secs.max(1) as f64,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::store::EntryKind;

    fn runner_with_vault() -> (tempfile::TempDir, Arc<JournalStore>, JobRunner) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JournalStore::open_in_memory().unwrap());
        let mut settings = store.settings().unwrap();
        settings.vault_root = dir.path().to_string_lossy().into_owned();
        settings.keep_audio = false;
        store.update_settings(&settings).unwrap();

        let runner = JobRunner::new(
            Arc::clone(&store),
            Arc::new(ChildTable::new()),
            RunnerConfig::default(),
            CancellationToken::new(),
        );
        (dir, store, runner)
    }

    fn entry_in_stage(store: &JournalStore, kind: EntryKind, stage: Stage) -> Entry {
        let entry = store.create_entry(kind, "2026-08-01", "UTC").unwrap();
        store
            .update_entry(
                &entry.id,
                &EntryPatch {
                    stage: Some(stage),
                    raw_transcript: Some("hello world".to_owned()),
                    raw_transcript_locked_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .unwrap()
    }

    #[tokio::test]
    async fn writing_stage_completes_a_quick_note() {
        let (dir, store, runner) = runner_with_vault();
        let entry = entry_in_stage(&store, EntryKind::QuickNote, Stage::Writing);

        runner.tick().await;

        let done = store.get_entry(&entry.id).unwrap();
        assert_eq!(done.stage, Stage::Completed);
        assert!(done.locked_by.is_none());
        let note_path = dir.path().join(done.note_path.unwrap());
        let text = std::fs::read_to_string(note_path).unwrap();
        assert!(text.contains("hello world"));
        assert!(done.note_mtime.is_some());
    }

    #[tokio::test]
    async fn missing_vault_config_fails_the_entry() {
        let store = Arc::new(JournalStore::open_in_memory().unwrap());
        let runner = JobRunner::new(
            Arc::clone(&store),
            Arc::new(ChildTable::new()),
            RunnerConfig::default(),
            CancellationToken::new(),
        );
        let entry = entry_in_stage(&store, EntryKind::QuickNote, Stage::Writing);

        runner.tick().await;

        let failed = store.get_entry(&entry.id).unwrap();
        assert_eq!(failed.stage, Stage::Failed);
        assert!(failed.error_message.unwrap().contains("vault root"));
        assert!(failed.locked_by.is_none());
    }

    #[tokio::test]
    async fn cancel_sweep_finalizes_queued_entries() {
        let (dir, store, runner) = runner_with_vault();
        let entry = store
            .create_entry(EntryKind::QuickNote, "2026-08-01", "UTC")
            .unwrap();
        // Simulate a cancel accepted while queued, with a normalized WAV on
        // disk from a previous partial run.
        let wav_rel = format!("journal/audio/{}-normalized.wav", entry.id);
        let wav_abs = dir.path().join(&wav_rel);
        std::fs::create_dir_all(wav_abs.parent().unwrap()).unwrap();
        std::fs::write(&wav_abs, b"riff").unwrap();
        store
            .update_entry(
                &entry.id,
                &EntryPatch {
                    stage: Some(Stage::CancelRequested),
                    normalized_audio_path: Some(Some(wav_rel)),
                    ..Default::default()
                },
            )
            .unwrap();

        runner.tick().await;

        let cancelled = store.get_entry(&entry.id).unwrap();
        assert_eq!(cancelled.stage, Stage::Cancelled);
        assert!(!wav_abs.exists());
    }

    #[tokio::test]
    async fn cancelled_entries_stay_cancelled() {
        // P5: cancel_requested only ever leads to cancelled.
        let (_dir, store, runner) = runner_with_vault();
        let entry = entry_in_stage(&store, EntryKind::QuickNote, Stage::Writing);
        store
            .update_entry(
                &entry.id,
                &EntryPatch {
                    stage: Some(Stage::CancelRequested),
                    ..Default::default()
                },
            )
            .unwrap();

        for _ in 0..3 {
            runner.tick().await;
        }
        assert_eq!(store.get_entry(&entry.id).unwrap().stage, Stage::Cancelled);
    }

    #[tokio::test]
    async fn keep_audio_false_deletes_audio_on_completion() {
        let (dir, store, runner) = runner_with_vault();
        let entry = entry_in_stage(&store, EntryKind::QuickNote, Stage::Writing);

        let orig_rel = format!("journal/audio/{}-original.webm", entry.id);
        let norm_rel = format!("journal/audio/{}-normalized.wav", entry.id);
        for rel in [&orig_rel, &norm_rel] {
            let abs = dir.path().join(rel);
            std::fs::create_dir_all(abs.parent().unwrap()).unwrap();
            std::fs::write(&abs, b"data").unwrap();
        }
        store
            .update_entry(
                &entry.id,
                &EntryPatch {
                    original_audio_path: Some(Some(orig_rel.clone())),
                    normalized_audio_path: Some(Some(norm_rel.clone())),
                    ..Default::default()
                },
            )
            .unwrap();

        runner.tick().await;

        assert_eq!(store.get_entry(&entry.id).unwrap().stage, Stage::Completed);
        assert!(!dir.path().join(orig_rel).exists());
        assert!(!dir.path().join(norm_rel).exists());
    }

    #[tokio::test]
    async fn resumed_transcribing_with_locked_transcript_parks() {
        // Crash recovery re-queued an entry whose transcript already locked:
        // the stage must not recompute, just park for review (I1).
        let (_dir, store, runner) = runner_with_vault();
        let entry = entry_in_stage(&store, EntryKind::BrainDump, Stage::Transcribing);
        assert!(store.try_lease(&entry.id, runner.worker_id(), Stage::Transcribing).unwrap());

        runner.run_entry(entry.id.clone()).await;

        let parked = store.get_entry(&entry.id).unwrap();
        assert_eq!(parked.stage, Stage::AwaitingReview);
        assert_eq!(parked.raw_transcript.as_deref(), Some("hello world"));
        assert!(parked.locked_by.is_none());
    }

    #[tokio::test]
    async fn tick_is_quiet_on_an_empty_queue() {
        let (_dir, _store, runner) = runner_with_vault();
        runner.tick().await;
    }
}
