//! System endpoints: audio serving, settings, prerequisites, path
//! validation, model listing, note opening.

use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::{ApiError, ApiResult, AppState};
use crate::store::{Settings, SettingsPatch};

/// Vault-relative prefix audio may be served from.
const AUDIO_PREFIX: &str = "journal/audio/";

// ---------------------------------------------------------------------------
// Audio serving
// ---------------------------------------------------------------------------

fn audio_content_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("wav") => "audio/wav",
        Some("mp3" | "mpeg" | "mpga") => "audio/mpeg",
        Some("webm") => "audio/webm",
        Some("m4a" | "mp4") => "audio/mp4",
        Some("ogg" | "oga") => "audio/ogg",
        Some("flac") => "audio/flac",
        _ => "application/octet-stream",
    }
}

/// Reject anything that could resolve outside `<vault>/journal/audio/`:
/// absolute paths, parent components, or a prefix mismatch after
/// canonicalization.
fn resolve_audio_path(vault: &Path, rel: &str) -> Result<PathBuf, ApiError> {
    if !rel.starts_with(AUDIO_PREFIX) {
        return Err(ApiError::forbidden("audio is only served from journal/audio/"));
    }

    let rel_path = Path::new(rel);
    let traversal = rel_path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if traversal || rel.contains('\\') {
        return Err(ApiError::forbidden("path traversal rejected"));
    }

    let abs = vault.join(rel_path);
    let canonical = abs
        .canonicalize()
        .map_err(|_| ApiError::not_found(format!("no such audio file: {rel}")))?;
    let canonical_root = vault
        .join(AUDIO_PREFIX)
        .canonicalize()
        .map_err(|_| ApiError::not_found("audio directory does not exist"))?;
    if !canonical.starts_with(&canonical_root) {
        return Err(ApiError::forbidden("resolved path escapes the audio directory"));
    }
    Ok(canonical)
}

pub(super) async fn serve_audio(
    State(state): State<AppState>,
    UrlPath(rel): UrlPath<String>,
) -> ApiResult<Response> {
    let settings = state.store.settings()?;
    let vault = settings.vault_root.trim();
    if vault.is_empty() {
        return Err(ApiError::bad_request("vault root is not configured"));
    }

    let path = resolve_audio_path(Path::new(vault), &rel)?;
    let bytes = std::fs::read(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ApiError::not_found(format!("no such audio file: {rel}")),
        _ => ApiError::internal(e.to_string()),
    })?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, audio_content_type(&path))],
        bytes,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

pub(super) async fn get_settings(State(state): State<AppState>) -> ApiResult<Json<Settings>> {
    Ok(Json(state.store.settings()?))
}

pub(super) async fn patch_settings(
    State(state): State<AppState>,
    Json(patch): Json<SettingsPatch>,
) -> ApiResult<Json<Settings>> {
    if let Some(tz) = patch.timezone.as_deref()
        && tz.parse::<chrono_tz::Tz>().is_err()
    {
        return Err(ApiError::bad_request(format!("invalid timezone {tz:?}")));
    }
    if let Some(secs) = patch.chunk_duration_secs
        && secs < 1
    {
        return Err(ApiError::bad_request("chunkDurationSecs must be at least 1"));
    }

    let mut settings = state.store.settings()?;
    settings.apply(patch);
    state.store.update_settings(&settings)?;
    info!("settings updated");
    Ok(Json(settings))
}

// ---------------------------------------------------------------------------
// Prerequisites
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BinaryProbe {
    found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
}

fn probe_binary(name: &str) -> BinaryProbe {
    match which::which(name) {
        Ok(path) => BinaryProbe {
            found: true,
            path: Some(path.to_string_lossy().into_owned()),
        },
        Err(_) => BinaryProbe {
            found: false,
            path: None,
        },
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct PrerequisitesResponse {
    ffmpeg: BinaryProbe,
    ffprobe: BinaryProbe,
    whisper_cli: BinaryProbe,
    whisper_model: BinaryProbe,
    llm: LlmProbe,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LlmProbe {
    reachable: bool,
    url: String,
}

pub(super) async fn prerequisites(
    State(state): State<AppState>,
) -> ApiResult<Json<PrerequisitesResponse>> {
    let settings = state.store.settings()?;

    let model_path = if settings.whisper_model_path.trim().is_empty() {
        crate::paths::models_dir().join(format!("ggml-{}.bin", settings.whisper_model))
    } else {
        PathBuf::from(settings.whisper_model_path.trim())
    };
    let whisper_model = BinaryProbe {
        found: model_path.is_file(),
        path: Some(model_path.to_string_lossy().into_owned()),
    };

    let url = format!("{}/api/tags", settings.llm_base_url.trim_end_matches('/'));
    let reachable = match reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
    {
        Ok(client) => client
            .get(&url)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false),
        Err(_) => false,
    };

    Ok(Json(PrerequisitesResponse {
        ffmpeg: probe_binary("ffmpeg"),
        ffprobe: probe_binary("ffprobe"),
        whisper_cli: probe_binary("whisper-cli"),
        whisper_model,
        llm: LlmProbe {
            reachable,
            url: settings.llm_base_url,
        },
    }))
}

// ---------------------------------------------------------------------------
// Path validation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(super) struct ValidatePathBody {
    path: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ValidatePathResponse {
    exists: bool,
    is_directory: bool,
    writable: bool,
}

pub(super) async fn validate_path(
    Json(body): Json<ValidatePathBody>,
) -> ApiResult<Json<ValidatePathResponse>> {
    let raw = body.path.trim();
    if raw.is_empty() {
        return Err(ApiError::bad_request("path is empty"));
    }
    let path = Path::new(raw);
    let exists = path.exists();
    let is_directory = path.is_dir();

    let writable = if is_directory {
        let probe = path.join(format!(".wj-write-probe-{}", std::process::id()));
        match std::fs::write(&probe, b"") {
            Ok(()) => {
                let _ = std::fs::remove_file(&probe);
                true
            }
            Err(_) => false,
        }
    } else {
        false
    };

    Ok(Json(ValidatePathResponse {
        exists,
        is_directory,
        writable,
    }))
}

// ---------------------------------------------------------------------------
// Whisper model listing
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WhisperModel {
    name: String,
    path: String,
    size_bytes: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct WhisperModelsResponse {
    models_dir: String,
    models: Vec<WhisperModel>,
}

pub(super) async fn whisper_models() -> ApiResult<Json<WhisperModelsResponse>> {
    let dir = crate::paths::models_dir();
    let mut models = Vec::new();

    if let Ok(entries) = std::fs::read_dir(&dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(name) = file_name
                .strip_prefix("ggml-")
                .and_then(|n| n.strip_suffix(".bin"))
            else {
                continue;
            };
            let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            models.push(WhisperModel {
                name: name.to_owned(),
                path: path.to_string_lossy().into_owned(),
                size_bytes,
            });
        }
    }
    models.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(Json(WhisperModelsResponse {
        models_dir: dir.to_string_lossy().into_owned(),
        models,
    }))
}

// ---------------------------------------------------------------------------
// Open note
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct OpenNoteBody {
    entry_id: String,
    action: String,
}

pub(super) async fn open_note(
    State(state): State<AppState>,
    Json(body): Json<OpenNoteBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let entry = state.store.get_entry(&body.entry_id)?;
    let rel = entry
        .note_path
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("entry has no note yet"))?;

    let settings = state.store.settings()?;
    let vault = settings.vault_root.trim();
    if vault.is_empty() {
        return Err(ApiError::bad_request("vault root is not configured"));
    }
    let abs = Path::new(vault).join(rel);
    if !abs.is_file() {
        return Err(ApiError::not_found("note file is missing from the vault"));
    }

    match body.action.as_str() {
        "obsidian" => {
            let url = format!(
                "obsidian://open?path={}",
                urlencoding::encode(&abs.to_string_lossy())
            );
            spawn_opener(&url, true)?;
        }
        "finder" => {
            spawn_opener(&abs.to_string_lossy(), false)?;
        }
        other => {
            return Err(ApiError::bad_request(format!(
                "unknown action {other:?}, want obsidian or finder"
            )));
        }
    }
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// Fire the platform open command and return immediately.
fn spawn_opener(target: &str, is_url: bool) -> Result<(), ApiError> {
    let mut cmd = if cfg!(target_os = "macos") {
        let mut c = std::process::Command::new("open");
        if !is_url {
            // Reveal the file in Finder instead of launching an editor.
            c.arg("-R");
        }
        c.arg(target);
        c
    } else if cfg!(target_os = "windows") {
        let mut c = std::process::Command::new("cmd");
        c.args(["/C", "start", ""]).arg(target);
        c
    } else {
        let mut c = std::process::Command::new("xdg-open");
        c.arg(target);
        c
    };

    match cmd.spawn() {
        Ok(_) => Ok(()),
        Err(e) => {
            warn!(error = %e, "platform opener failed");
            Err(ApiError::internal(format!("could not launch opener: {e}")))
        }
    }
}
