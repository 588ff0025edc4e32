//! Stage-to-progress mapping for the HTTP facade.

use crate::store::Stage;

/// `[start, end]` of each stage on the 0 to 100 scale. Clients display
/// `start`.
pub fn progress_range(stage: Stage) -> (u8, u8) {
    match stage {
        Stage::Pending => (0, 0),
        Stage::Queued => (0, 5),
        Stage::Normalizing => (5, 15),
        Stage::Transcribing => (15, 60),
        Stage::AwaitingReview | Stage::AwaitingPrompts => (60, 60),
        Stage::Generating => (60, 90),
        Stage::Writing => (90, 100),
        Stage::Completed => (100, 100),
        Stage::Failed | Stage::Cancelled | Stage::CancelRequested => (0, 0),
    }
}

/// The progress value a client should display for a stage.
pub fn overall_progress(stage: Stage) -> u8 {
    progress_range(stage).0
}
