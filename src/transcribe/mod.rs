//! Speech-to-text over normalized WAV audio.
//!
//! Drives the whisper command-line tool. Short recordings transcribe in a
//! single shot; long recordings are split into overlapping chunks which
//! transcribe sequentially (the tool is heavy, so no parallelism), each
//! checked for hallucination and conservatively retried when flagged.

pub mod hallucination;
pub mod merge;

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{info, warn};

use crate::audio::{self, CHUNK_OVERLAP_SECS};
use crate::error::{JournalError, Result};
use crate::process::{run_tool, ChildTable};
use hallucination::HallucinationFlag;

/// Options for one transcription run, resolved from settings.
#[derive(Debug, Clone)]
pub struct TranscribeOptions {
    /// Path to the whisper command-line binary.
    pub binary: PathBuf,
    /// Path to the model file.
    pub model_path: PathBuf,
    /// Spoken language, or `None` for auto-detection.
    pub language: Option<String>,
    /// Optional initial prompt carried across the run.
    pub priming_text: Option<String>,
    /// Voice-activity-detection model; `Some` enables VAD.
    pub vad_model_path: Option<PathBuf>,
    /// Chunk window in seconds. Audio longer than this is split.
    pub chunk_secs: f64,
}

/// A chunk whose primary transcription tripped the hallucination detector.
#[derive(Debug, Clone)]
struct FlaggedChunk {
    index: usize,
    flag: HallucinationFlag,
    alternative: String,
}

/// Transcriber bound to one entry, so spawned tools are killable by id.
pub struct Transcriber<'a> {
    table: &'a ChildTable,
    entry_id: &'a str,
    opts: TranscribeOptions,
}

impl<'a> Transcriber<'a> {
    pub fn new(table: &'a ChildTable, entry_id: &'a str, opts: TranscribeOptions) -> Self {
        Self {
            table,
            entry_id,
            opts,
        }
    }

    /// Transcribe `wav` of `duration_secs`, using `temp_dir` for chunk files
    /// and tool output. `heartbeat` is invoked before each long-running tool
    /// call so the worker lease stays fresh.
    pub async fn transcribe(
        &self,
        wav: &Path,
        duration_secs: f64,
        temp_dir: &Path,
        heartbeat: &(dyn Fn() + Sync),
    ) -> Result<String> {
        if duration_secs <= self.opts.chunk_secs {
            heartbeat();
            let prefix = temp_dir.join("transcript");
            return self.transcribe_one(wav, &prefix, false).await;
        }
        self.transcribe_chunked(wav, duration_secs, temp_dir, heartbeat)
            .await
    }

    async fn transcribe_chunked(
        &self,
        wav: &Path,
        duration_secs: f64,
        temp_dir: &Path,
        heartbeat: &(dyn Fn() + Sync),
    ) -> Result<String> {
        let chunks = audio::split(
            self.table,
            self.entry_id,
            wav,
            duration_secs,
            self.opts.chunk_secs,
            CHUNK_OVERLAP_SECS,
            temp_dir,
        )
        .await?;
        info!(
            entry_id = self.entry_id,
            chunks = chunks.len(),
            "transcribing long audio in chunks"
        );

        let mut primaries: Vec<String> = Vec::with_capacity(chunks.len());
        let mut flagged: Vec<FlaggedChunk> = Vec::new();

        for chunk in &chunks {
            heartbeat();
            let prefix = temp_dir.join(format!("chunk_{:03}", chunk.index));
            let text = self.transcribe_one(&chunk.path, &prefix, false).await?;

            match hallucination::check(&text, chunk.duration_secs) {
                None => primaries.push(text),
                Some(flag) => {
                    warn!(
                        entry_id = self.entry_id,
                        chunk = chunk.index,
                        reason = %flag.reason,
                        "possible hallucination, retrying conservatively"
                    );
                    heartbeat();
                    let retry_prefix = temp_dir.join(format!("chunk_{:03}_retry", chunk.index));
                    let retry = self.transcribe_one(&chunk.path, &retry_prefix, true).await?;

                    // Prefer the retry when it passes the detector; keep the
                    // rejected text visible to the reviewer either way.
                    match hallucination::check(&retry, chunk.duration_secs) {
                        None => {
                            flagged.push(FlaggedChunk {
                                index: chunk.index,
                                flag,
                                alternative: text,
                            });
                            primaries.push(retry);
                        }
                        Some(_) => {
                            flagged.push(FlaggedChunk {
                                index: chunk.index,
                                flag,
                                alternative: retry,
                            });
                            primaries.push(text);
                        }
                    }
                }
            }
        }

        for chunk in &chunks {
            audio::remove_audio(&chunk.path)?;
        }

        let mut merged = merge::merge_chunks(&primaries, CHUNK_OVERLAP_SECS);
        if !flagged.is_empty() {
            merged.push_str(&render_alternatives(&flagged));
        }
        Ok(merged)
    }

    /// One invocation of the speech tool over a single WAV file. The tool
    /// writes a companion `.txt`; read it, trim it, delete it.
    async fn transcribe_one(
        &self,
        wav: &Path,
        output_prefix: &Path,
        conservative: bool,
    ) -> Result<String> {
        let mut cmd = Command::new(&self.opts.binary);
        cmd.args(self.build_args(wav, output_prefix, conservative));

        let output = run_tool(self.table, self.entry_id, &mut cmd, "whisper").await?;
        if !output.success {
            return Err(JournalError::Transcribe(format!(
                "speech tool failed: {}",
                output.stderr_tail()
            )));
        }

        let txt_path = output_prefix.with_extension("txt");
        let text = std::fs::read_to_string(&txt_path).map_err(|e| {
            JournalError::Transcribe(format!(
                "speech tool produced no output at {}: {e}",
                txt_path.display()
            ))
        })?;
        let _ = std::fs::remove_file(&txt_path);
        Ok(text.trim().to_owned())
    }

    /// Build the argument list for one tool invocation.
    ///
    /// The conservative variant narrows the beam, pins temperature to zero,
    /// reduces threads, and raises the VAD threshold. Both variants run with
    /// a fresh decoder context per segment so one bad window cannot
    /// contaminate the rest of the file.
    fn build_args(&self, wav: &Path, output_prefix: &Path, conservative: bool) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-m".into(),
            self.opts.model_path.as_os_str().to_owned(),
            "-f".into(),
            wav.as_os_str().to_owned(),
            "-l".into(),
            self.opts.language.as_deref().unwrap_or("auto").into(),
            "--no-timestamps".into(),
            "--no-context".into(),
            "--entropy-thold".into(),
            "2.4".into(),
        ];

        if conservative {
            args.extend(
                ["--beam-size", "3", "--best-of", "3", "--temperature", "0.0", "--threads", "2"]
                    .map(OsString::from),
            );
        } else {
            args.extend(["--beam-size", "5", "--best-of", "5", "--no-fallback"].map(OsString::from));
        }

        if let Some(vad_model) = &self.opts.vad_model_path {
            args.extend(["--vad", "--vad-model"].map(OsString::from));
            args.push(vad_model.as_os_str().to_owned());
            args.extend(
                [
                    "--vad-threshold",
                    if conservative { "0.6" } else { "0.5" },
                    "--vad-min-speech-duration-ms",
                    "250",
                    "--vad-min-silence-duration-ms",
                    "100",
                ]
                .map(OsString::from),
            );
        }

        if let Some(priming) = self
            .opts
            .priming_text
            .as_deref()
            .filter(|p| !p.trim().is_empty())
        {
            args.extend(["--prompt", priming, "--carry-initial-prompt"].map(OsString::from));
        }

        args.push("--output-txt".into());
        args.push("--output-file".into());
        args.push(output_prefix.as_os_str().to_owned());

        args
    }
}

/// Render the advisory alternatives block appended after the merged text.
/// This is reviewer-facing content, never an error.
fn render_alternatives(flagged: &[FlaggedChunk]) -> String {
    let mut out = String::from("\n\n---\n\nAlternative transcriptions (possible hallucination):\n");
    for chunk in flagged {
        out.push_str(&format!(
            "\n[Chunk {}] {}\n{}\n",
            chunk.index,
            chunk.flag.reason,
            if chunk.alternative.trim().is_empty() {
                "(empty)"
            } else {
                chunk.alternative.trim()
            }
        ));
    }
    out
}
