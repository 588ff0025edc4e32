//! HTTP facade over the store, note writer, and job runner.
//!
//! Thin RPC layer: handlers validate, mutate the store, and nudge the
//! pipeline by setting stages; the worker does everything heavy. JSON in and
//! out, camelCase field names.

mod entries;
mod system;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::error::JournalError;
use crate::process::ChildTable;
use crate::store::JournalStore;

/// Maximum accepted upload size (audio files).
const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

/// Shared state for axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<JournalStore>,
    pub children: Arc<ChildTable>,
}

/// Error type returned by handlers; maps the crate error onto HTTP status
/// codes (400 preconditions, 403 traversal, 404 unknown ids, 5xx internal).
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<JournalError> for ApiError {
    fn from(err: JournalError) -> Self {
        let status = match &err {
            JournalError::Precondition(_) | JournalError::Note(_) => StatusCode::BAD_REQUEST,
            JournalError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<crate::store::StoreError> for ApiError {
    fn from(err: crate::store::StoreError) -> Self {
        ApiError::from(JournalError::from(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

/// Handler result alias.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/entries", post(entries::create).get(entries::list))
        .route("/entries/search", get(entries::search))
        .route(
            "/entries/{id}",
            get(entries::fetch)
                .patch(entries::patch)
                .delete(entries::delete),
        )
        .route("/entries/{id}/audio", post(entries::upload_audio))
        .route("/entries/{id}/cancel", post(entries::cancel))
        .route(
            "/entries/{id}/links",
            get(entries::list_links)
                .post(entries::add_link)
                .delete(entries::remove_link),
        )
        .route("/audio/{*path}", get(system::serve_audio))
        .route("/open-note", post(system::open_note))
        .route(
            "/settings",
            get(system::get_settings).patch(system::patch_settings),
        )
        .route("/prerequisites", get(system::prerequisites))
        .route("/validate-path", post(system::validate_path))
        .route("/whisper", get(system::whisper_models))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}
