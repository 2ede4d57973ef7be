//! Container writer seam.
//!
//! The [`ContainerWriter`] multiplexes independently-timed audio and video
//! sample streams into one playable file. Tracks must all be declared
//! before the session clock opens; per-track [`is_ready`] is the
//! back-pressure signal used to avoid overrunning the encoder.
//!
//! [`is_ready`]: ContainerWriter::is_ready

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::media::{AudioBuffer, AudioFormat, MediaTime, VideoFrame};

/// Which track a sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

/// Writer health; mirrors the underlying encoder processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterStatus {
    Writing,
    Failed,
}

/// Errors surfaced by the container writer. Cloneable so a stored terminal
/// error can be both raised from an intake call and reported to the
/// listener.
#[derive(Debug, Clone, Error)]
pub enum WriterError {
    #[error("failed to create container writer: {0}")]
    Create(String),

    #[error("failed to add {kind:?} track: {reason}")]
    Track { kind: TrackKind, reason: String },

    #[error("container session is not open")]
    SessionNotOpen,

    #[error("encoder failed: {0}")]
    Encoder(String),

    #[error("finalize failed: {0}")]
    Finalize(String),
}

/// Video track parameters: samples are encoded at this fixed target
/// resolution regardless of the camera's native size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoTrackConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for VideoTrackConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
        }
    }
}

/// AAC bitrate for the audio track; sample rate and channel count come
/// from the live input format.
pub const AUDIO_BITRATE: u32 = 64_000;

/// Incremental multiplexer for one output file.
///
/// Lifecycle: declare tracks, `start_session` at the first accepted video
/// timestamp, append in arrival order per track, then either `finish`
/// (finalize a playable file) or `cancel` (no usable output). `finish` and
/// `cancel` consume the writer; `finish` may block and is intended to run
/// on a detached thread.
pub trait ContainerWriter: Send {
    fn add_video_track(&mut self, config: &VideoTrackConfig) -> Result<(), WriterError>;

    fn add_audio_track(&mut self, format: &AudioFormat) -> Result<(), WriterError>;

    /// Open the session clock; `at` becomes time zero of the output file.
    fn start_session(&mut self, at: MediaTime) -> Result<(), WriterError>;

    /// Whether the track can accept another sample right now.
    fn is_ready(&self, track: TrackKind) -> bool;

    fn append_video(&mut self, frame: &VideoFrame) -> Result<(), WriterError>;

    fn append_audio(&mut self, buffer: &AudioBuffer) -> Result<(), WriterError>;

    fn status(&self) -> WriterStatus;

    /// The error behind a `Failed` status, if any.
    fn error(&self) -> Option<WriterError>;

    /// Close the session at `end` and finalize the container, returning
    /// the playable file's location.
    fn finish(self: Box<Self>, end: MediaTime) -> Result<PathBuf, WriterError>;

    /// Tear down without producing usable output; removes any partial
    /// file.
    fn cancel(self: Box<Self>, end: MediaTime);
}

/// Creates one writer per recording attempt.
pub trait WriterFactory: Send + Sync {
    fn create(&self, destination: &Path) -> Result<Box<dyn ContainerWriter>, WriterError>;
}
