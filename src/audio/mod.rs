//! Audio tooling: probe, normalize, split, delete.
//!
//! All sample handling is delegated to `ffmpeg`/`ffprobe`; this module owns
//! the invocations and the chunk plan. Every spawn is registered in the
//! [`ChildTable`] so a cancel request can kill the tool mid-run.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{JournalError, Result};
use crate::process::{run_tool, ChildTable};

/// Canonical sample rate for normalized audio.
pub const SAMPLE_RATE: u32 = 16_000;

/// Default overlap between adjacent chunks, in seconds.
pub const CHUNK_OVERLAP_SECS: f64 = 5.0;

/// Safety ceiling on the number of chunks a single recording may produce.
pub const MAX_CHUNKS: usize = 100;

/// Probe the duration of an audio file in seconds.
pub async fn probe_duration(table: &ChildTable, entry_id: &str, path: &Path) -> Result<f64> {
    let mut cmd = Command::new("ffprobe");
    cmd.args(["-v", "error", "-show_entries", "format=duration", "-of"])
        .arg("default=noprint_wrappers=1:nokey=1")
        .arg(path);

    let output = run_tool(table, entry_id, &mut cmd, "ffprobe").await?;
    if !output.success {
        return Err(JournalError::Audio(format!(
            "ffprobe failed: {}",
            output.stderr_tail()
        )));
    }

    let raw = output.stdout.trim();
    raw.parse::<f64>().map_err(|_| {
        JournalError::Audio(format!("ffprobe produced unparsable duration: {raw:?}"))
    })
}

/// Resample `src` to a single-channel 16 kHz 16-bit PCM WAV at `dest`.
///
/// ffmpeg overwrites `dest` in place (`-y`), which keeps re-runs of the
/// normalize stage idempotent. On nonzero exit the tail of the diagnostic
/// stream becomes the error.
pub async fn normalize(table: &ChildTable, entry_id: &str, src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-y")
        .arg("-i")
        .arg(src)
        .args(["-ar", "16000", "-ac", "1", "-c:a", "pcm_s16le"])
        .arg(dest);

    let output = run_tool(table, entry_id, &mut cmd, "ffmpeg").await?;
    if !output.success {
        return Err(JournalError::Audio(format!(
            "ffmpeg normalization failed: {}",
            output.stderr_tail()
        )));
    }

    info!(entry_id, dest = %dest.display(), "normalized audio");
    Ok(())
}

/// One planned chunk of a long recording.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPlan {
    pub index: usize,
    /// Offset into the source, seconds.
    pub start_secs: f64,
    /// Chunk length, seconds. The last chunk is shorter when the audio ends
    /// mid-window.
    pub length_secs: f64,
}

/// Compute the overlapping chunk layout: segment `i` covers
/// `[i * (window - overlap), min(i * (window - overlap) + window, total)]`.
pub fn plan_chunks(total_secs: f64, window_secs: f64, overlap_secs: f64) -> Result<Vec<ChunkPlan>> {
    let step = window_secs - overlap_secs;
    if !(step > 0.0) {
        return Err(JournalError::Audio(format!(
            "chunk window {window_secs}s must exceed overlap {overlap_secs}s"
        )));
    }

    let mut plan = Vec::new();
    let mut start = 0.0f64;
    loop {
        let length = (total_secs - start).min(window_secs);
        plan.push(ChunkPlan {
            index: plan.len(),
            start_secs: start,
            length_secs: length,
        });
        if plan.len() > MAX_CHUNKS {
            return Err(JournalError::Audio(format!(
                "audio would split into more than {MAX_CHUNKS} chunks ({total_secs:.0}s total)"
            )));
        }
        if start + window_secs >= total_secs {
            break;
        }
        start += step;
    }
    Ok(plan)
}

/// A chunk written to disk.
#[derive(Debug, Clone)]
pub struct ChunkFile {
    pub index: usize,
    pub path: PathBuf,
    pub duration_secs: f64,
}

/// Cut `wav` into overlapping chunks under `dir` (transient
/// `chunk_000.wav`-style files), inheriting the canonical sample format.
pub async fn split(
    table: &ChildTable,
    entry_id: &str,
    wav: &Path,
    total_secs: f64,
    window_secs: f64,
    overlap_secs: f64,
    dir: &Path,
) -> Result<Vec<ChunkFile>> {
    let plan = plan_chunks(total_secs, window_secs, overlap_secs)?;
    std::fs::create_dir_all(dir)?;

    let mut files = Vec::with_capacity(plan.len());
    for chunk in plan {
        let path = dir.join(format!("chunk_{:03}.wav", chunk.index));
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-y")
            .arg("-i")
            .arg(wav)
            .args(["-ss", &format!("{:.3}", chunk.start_secs)])
            .args(["-t", &format!("{:.3}", chunk.length_secs)])
            .args(["-ar", "16000", "-ac", "1", "-c:a", "pcm_s16le"])
            .arg(&path);

        let output = run_tool(table, entry_id, &mut cmd, "ffmpeg").await?;
        if !output.success {
            return Err(JournalError::Audio(format!(
                "ffmpeg chunk split failed at {:.0}s: {}",
                chunk.start_secs,
                output.stderr_tail()
            )));
        }
        debug!(entry_id, chunk = chunk.index, "wrote audio chunk");
        files.push(ChunkFile {
            index: chunk.index,
            path,
            duration_secs: chunk.length_secs,
        });
    }
    Ok(files)
}

/// Remove an audio file. Absence is not an error.
pub fn remove_audio(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
