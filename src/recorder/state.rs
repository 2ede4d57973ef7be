//! Recording state machine.
//!
//! One authoritative enumeration replaces the original tangle of optional
//! fields and boolean flags; every lifecycle move goes through
//! [`RecordingState::transition`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle of a single recording session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    /// No recording in progress.
    Idle,
    /// Writer created and tracks being declared; session clock not open.
    Configuring,
    /// Session clock open, samples being appended.
    Writing,
    /// Stop requested, container finalizing in the background.
    Finishing,
    /// Finalize completed, file playable.
    Finished,
    /// Writer failed; any partial file is discardable.
    Failed,
    /// Recording aborted; no output exists.
    Aborted,
}

impl Default for RecordingState {
    fn default() -> Self {
        Self::Idle
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("illegal recording state transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: RecordingState,
    pub to: RecordingState,
}

impl RecordingState {
    /// A recording is underway (a second `start_recording` must be
    /// rejected).
    pub fn is_active(&self) -> bool {
        matches!(self, RecordingState::Configuring | RecordingState::Writing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecordingState::Finished | RecordingState::Failed | RecordingState::Aborted
        )
    }

    fn allows(self, to: RecordingState) -> bool {
        use RecordingState::*;
        matches!(
            (self, to),
            (Idle, Configuring)
                | (Configuring, Writing)
                | (Configuring, Failed)
                | (Configuring, Aborted)
                | (Configuring, Idle)
                | (Writing, Finishing)
                | (Writing, Failed)
                | (Writing, Aborted)
                | (Finishing, Finished)
                | (Finishing, Failed)
                | (Finished, Idle)
                | (Failed, Idle)
                | (Aborted, Idle)
        )
    }

    /// Move to `to`, or report the illegal edge.
    pub fn transition(self, to: RecordingState) -> Result<RecordingState, InvalidTransition> {
        if self.allows(to) {
            tracing::debug!("recording state {self:?} -> {to:?}");
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }
}
