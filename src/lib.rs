//! Whisper Journal: local voice-to-note pipeline.
//!
//! An uploaded audio clip becomes a structured Markdown note in an
//! Obsidian-style vault:
//! Upload → normalize (ffmpeg) → transcribe (whisper) → human review →
//! LLM formatting → atomic note write.
//!
//! # Architecture
//!
//! - **store**: SQLite state for entries, links, settings, and full-text
//!   search. The only shared mutable state in the process.
//! - **audio / transcribe / llm / note**: the pipeline stages, each a thin
//!   owner of one external contract (ffmpeg, whisper-cli, the local LLM
//!   endpoint, the vault filesystem).
//! - **runner**: the single worker that drives entries through the stage
//!   machine, with heartbeats, stuck-job recovery, and cancellation.
//! - **server**: the axum HTTP facade the browser UI talks to.

pub mod audio;
pub mod error;
pub mod llm;
pub mod note;
pub mod paths;
pub mod process;
pub mod runner;
pub mod server;
pub mod store;
pub mod transcribe;

pub use error::{JournalError, Result};
pub use process::ChildTable;
pub use runner::{JobRunner, RunnerConfig};
pub use server::{router, AppState};
pub use store::JournalStore;

pub(crate) use paths::models_dir;
