//! Entry endpoints: CRUD, search, audio upload, continue, cancel, links.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::Utc;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

use super::{ApiError, ApiResult, AppState};
use crate::note::NoteWriter;
use crate::runner::progress::overall_progress;
use crate::store::{
    Entry, EntryKind, EntryPatch, LinkType, PromptAnswer, SearchQuery, Stage, StageClass,
};

const DEFAULT_PAGE_LIMIT: usize = 20;
const MAX_PAGE_LIMIT: usize = 200;

/// Entry plus the computed fields clients render.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct EntryView {
    #[serde(flatten)]
    entry: Entry,
    overall_progress: u8,
    has_external_edits: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    note_content: Option<String>,
}

fn entry_view(state: &AppState, entry: Entry, include_note: bool) -> ApiResult<EntryView> {
    let settings = state.store.settings()?;
    let vault = settings.vault_root.trim();

    let (has_external_edits, note_content) = if vault.is_empty() {
        (false, None)
    } else {
        let writer = NoteWriter::new(vault);
        let drift = writer.has_external_edits(&entry).unwrap_or(false);
        let content = if include_note {
            writer.read_note(&entry).unwrap_or(None)
        } else {
            None
        };
        (drift, content)
    };

    Ok(EntryView {
        overall_progress: overall_progress(entry.stage),
        has_external_edits,
        note_content,
        entry,
    })
}

fn parse_entry_date(raw: &str) -> ApiResult<String> {
    chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ApiError::bad_request(format!("invalid entryDate {raw:?}, want YYYY-MM-DD")))?;
    Ok(raw.to_owned())
}

fn parse_timezone(raw: &str) -> ApiResult<Tz> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("invalid timezone {raw:?}")))
}

// ---------------------------------------------------------------------------
// Create / list / search / fetch
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateEntryBody {
    entry_type: String,
    entry_date: Option<String>,
    timezone: Option<String>,
}

pub(super) async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateEntryBody>,
) -> ApiResult<Json<EntryView>> {
    let kind = EntryKind::parse(&body.entry_type)
        .ok_or_else(|| ApiError::bad_request(format!("unknown entryType {:?}", body.entry_type)))?;

    let settings = state.store.settings()?;
    let tz_name = body.timezone.unwrap_or(settings.timezone);
    let tz = parse_timezone(&tz_name)?;

    let entry_date = match body.entry_date {
        Some(raw) => parse_entry_date(&raw)?,
        None => Utc::now().with_timezone(&tz).format("%Y-%m-%d").to_string(),
    };

    let entry = state.store.create_entry(kind, &entry_date, &tz_name)?;
    info!(entry_id = %entry.id, kind = kind.as_str(), "created entry");
    entry_view(&state, entry, false).map(Json)
}

#[derive(Debug, Deserialize)]
pub(super) struct ListParams {
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub(super) struct ListResponse {
    entries: Vec<Entry>,
    count: i64,
}

pub(super) async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<ListResponse>> {
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_LIMIT).min(MAX_PAGE_LIMIT);
    let entries = state.store.list_entries(limit, params.offset.unwrap_or(0))?;
    let count = state.store.count_entries()?;
    Ok(Json(ListResponse { entries, count }))
}

#[derive(Debug, Deserialize)]
pub(super) struct SearchParams {
    q: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    status: Option<String>,
    from: Option<String>,
    to: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

pub(super) async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<crate::store::SearchPage>> {
    let kind = params
        .kind
        .as_deref()
        .map(|raw| {
            EntryKind::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown type {raw:?}")))
        })
        .transpose()?;
    let stage_class = params
        .status
        .as_deref()
        .map(|raw| {
            StageClass::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown status {raw:?}")))
        })
        .transpose()?;
    let from_date = params.from.as_deref().map(parse_entry_date).transpose()?;
    let to_date = params.to.as_deref().map(parse_entry_date).transpose()?;

    let query = SearchQuery {
        term: params.q,
        kind,
        stage_class,
        from_date,
        to_date,
        limit: params.limit.unwrap_or(DEFAULT_PAGE_LIMIT).min(MAX_PAGE_LIMIT),
        offset: params.offset.unwrap_or(0),
    };
    Ok(Json(state.store.search(&query)?))
}

pub(super) async fn fetch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<EntryView>> {
    let entry = state.store.get_entry(&id)?;
    entry_view(&state, entry, true).map(Json)
}

pub(super) async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.store.delete_entry(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Patch (edits + continue)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct PatchBody {
    edited_transcript: Option<String>,
    prompt_answers: Option<HashMap<String, PromptAnswer>>,
    entry_date: Option<String>,
    edited_sections: Option<HashMap<String, String>>,
    action: Option<String>,
}

pub(super) async fn patch(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PatchBody>,
) -> ApiResult<Json<EntryView>> {
    let entry = state.store.get_entry(&id)?;

    let mut patch = EntryPatch::default();
    if let Some(raw) = &body.entry_date {
        // The date drives the note filename and frontmatter; once writing
        // has begun it is frozen.
        if matches!(entry.stage, Stage::Writing | Stage::Completed) {
            return Err(ApiError::bad_request(
                "entryDate can no longer be changed: note writing has begun",
            ));
        }
        patch.entry_date = Some(parse_entry_date(raw)?);
    }
    if let Some(text) = body.edited_transcript {
        patch.edited_transcript = Some(text);
    }
    if let Some(answers) = body.prompt_answers {
        patch.prompt_answers = Some(answers);
    }

    let mut entry = state.store.update_entry(&id, &patch)?;

    if let Some(sections) = &body.edited_sections {
        let settings = state.store.settings()?;
        let vault = settings.vault_root.trim();
        if vault.is_empty() {
            return Err(ApiError::bad_request("vault root is not configured"));
        }
        let writer = NoteWriter::new(vault);
        let mtime = writer.update_note_content(&entry, sections)?;
        entry = state.store.update_entry(
            &id,
            &EntryPatch {
                note_mtime: Some(mtime),
                ..Default::default()
            },
        )?;
    }

    if body.action.as_deref() == Some("continue") {
        entry = apply_continue(&state, entry)?;
    }

    entry_view(&state, entry, false).map(Json)
}

/// Advance a parked entry. Entries in any other stage are returned
/// unchanged: continue is idempotent from the client's point of view.
fn apply_continue(state: &AppState, entry: Entry) -> ApiResult<Entry> {
    let next = match (entry.stage, entry.kind) {
        (Stage::AwaitingReview, EntryKind::QuickNote) => Stage::Writing,
        (Stage::AwaitingReview, EntryKind::BrainDump) => Stage::Generating,
        (Stage::AwaitingReview, EntryKind::DailyReflection) => Stage::AwaitingPrompts,
        (Stage::AwaitingPrompts, _) => Stage::Generating,
        _ => return Ok(entry),
    };

    let message = match next {
        Stage::AwaitingPrompts => "Awaiting prompt answers",
        Stage::Generating => "Queued for generation",
        _ => "Queued for writing",
    };

    info!(entry_id = %entry.id, from = entry.stage.as_str(), to = next.as_str(), "continue");
    Ok(state.store.update_entry(
        &entry.id,
        &EntryPatch {
            stage: Some(next),
            stage_message: Some(Some(message.to_owned())),
            // A fresh heartbeat keeps stuck-recovery from re-queuing the
            // entry before the worker picks it back up.
            heartbeat_at: Some(Utc::now().timestamp()),
            ..Default::default()
        },
    )?)
}

// ---------------------------------------------------------------------------
// Audio upload / cancel
// ---------------------------------------------------------------------------

fn sanitize_extension(filename: Option<&str>, content_type: &str) -> String {
    let from_name = filename
        .and_then(|n| n.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| {
            !ext.is_empty() && ext.len() <= 8 && ext.bytes().all(|b| b.is_ascii_alphanumeric())
        });

    from_name.unwrap_or_else(|| {
        let subtype = content_type.rsplit('/').next().unwrap_or("webm");
        let cleaned: String = subtype
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(8)
            .collect();
        if cleaned.is_empty() {
            "webm".to_owned()
        } else {
            cleaned
        }
    })
}

pub(super) async fn upload_audio(
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<Json<EntryView>> {
    let entry = state.store.get_entry(&id)?;
    if entry.stage != Stage::Pending {
        return Err(ApiError::bad_request(format!(
            "audio can only be uploaded while pending (stage is {})",
            entry.stage.as_str()
        )));
    }

    let settings = state.store.settings()?;
    let vault = settings.vault_root.trim();
    if vault.is_empty() {
        return Err(ApiError::bad_request("vault root is not configured"));
    }

    let mut stored: Option<String> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("malformed multipart body: {e}")))?
    {
        if field.name() != Some("audio") {
            continue;
        }

        let content_type = field.content_type().unwrap_or("").to_owned();
        if !content_type.starts_with("audio/") {
            return Err(ApiError::bad_request(format!(
                "field 'audio' must have an audio/* content type, got {content_type:?}"
            )));
        }

        let ext = sanitize_extension(field.file_name(), &content_type);
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("upload read failed: {e}")))?;
        if data.is_empty() {
            return Err(ApiError::bad_request("uploaded audio is empty"));
        }

        let rel = format!("journal/audio/{id}-original.{ext}");
        let abs = std::path::Path::new(vault).join(&rel);
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ApiError::internal(e.to_string()))?;
        }
        std::fs::write(&abs, &data).map_err(|e| ApiError::internal(e.to_string()))?;
        info!(entry_id = %id, bytes = data.len(), path = %rel, "stored uploaded audio");
        stored = Some(rel);
        break;
    }

    let rel = stored.ok_or_else(|| ApiError::bad_request("missing multipart field 'audio'"))?;

    let entry = state.store.update_entry(
        &id,
        &EntryPatch {
            original_audio_path: Some(Some(rel)),
            stage: Some(Stage::Queued),
            stage_message: Some(Some("Queued".to_owned())),
            ..Default::default()
        },
    )?;
    entry_view(&state, entry, false).map(Json)
}

pub(super) async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<EntryView>> {
    let entry = state.store.get_entry(&id)?;
    if !entry.stage.is_cancellable() {
        return Err(ApiError::bad_request(format!(
            "cannot cancel an entry in stage {}",
            entry.stage.as_str()
        )));
    }

    let entry = state.store.update_entry(
        &id,
        &EntryPatch {
            stage: Some(Stage::CancelRequested),
            stage_message: Some(Some("Cancel requested".to_owned())),
            ..Default::default()
        },
    )?;

    // Best-effort: the worker's next check performs the real finalization.
    state.children.kill(&id).await;
    entry_view(&state, entry, false).map(Json)
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct LinkBody {
    target_id: String,
    link_type: String,
}

#[derive(Debug, Serialize)]
pub(super) struct LinksResponse {
    links: Vec<crate::store::EntryLink>,
}

pub(super) async fn list_links(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<LinksResponse>> {
    // 404 for unknown source id, empty list otherwise.
    state.store.get_entry(&id)?;
    Ok(Json(LinksResponse {
        links: state.store.links_for(&id)?,
    }))
}

pub(super) async fn add_link(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<LinkBody>,
) -> ApiResult<Json<LinksResponse>> {
    let link_type = LinkType::parse(&body.link_type)
        .ok_or_else(|| ApiError::bad_request(format!("unknown linkType {:?}", body.link_type)))?;
    state.store.get_entry(&id)?;
    state.store.get_entry(&body.target_id)?;

    state.store.add_link(&id, &body.target_id, link_type)?;
    Ok(Json(LinksResponse {
        links: state.store.links_for(&id)?,
    }))
}

pub(super) async fn remove_link(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<LinkBody>,
) -> ApiResult<Json<LinksResponse>> {
    let link_type = LinkType::parse(&body.link_type)
        .ok_or_else(|| ApiError::bad_request(format!("unknown linkType {:?}", body.link_type)))?;
    state.store.remove_link(&id, &body.target_id, link_type)?;
    Ok(Json(LinksResponse {
        links: state.store.links_for(&id)?,
    }))
}
