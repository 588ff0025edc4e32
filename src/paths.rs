//! Platform-appropriate application directories.

use std::path::PathBuf;

/// Application data directory (`~/.local/share/whisper-journal` on Linux,
/// `~/Library/Application Support/whisper-journal` on macOS).
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("whisper-journal")
}

/// Directory holding whisper model files (`ggml-<name>.bin`).
pub fn models_dir() -> PathBuf {
    data_dir().join("models")
}
