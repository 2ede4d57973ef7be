//! Recording pipeline: state machine, container seam, ffmpeg writer and
//! the recorder that drives them.

pub mod container;
pub mod ffmpeg;
pub mod state;
pub mod writer;

use std::path::{Path, PathBuf};

pub use container::{
    ContainerWriter, TrackKind, VideoTrackConfig, WriterError, WriterFactory, WriterStatus,
};
pub use ffmpeg::{FfmpegWriter, FfmpegWriterFactory};
pub use state::{InvalidTransition, RecordingState};
pub use writer::{KeepAwake, KeepAwakeToken, Recorder, RecorderError, RecorderListener};

/// Fresh collision-free destination for one recording attempt.
pub fn recording_destination(dir: &Path) -> PathBuf {
    dir.join(format!("{}.mp4", uuid::Uuid::new_v4()))
}
