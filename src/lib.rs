//! Camera capture and MP4 recording pipeline.
//!
//! A [`capture::CaptureSession`] binds a camera and microphone from a
//! [`device::DeviceSource`], stamps every sample against one shared session
//! clock, and fans frames out to a preview sink and a
//! [`recorder::Recorder`]. The recorder drives a swappable container writer
//! (ffmpeg-backed by default) through an explicit recording state machine;
//! finished files are described by [`catalog::VideoRecord`]s. An optional
//! [`overlay::TextOverlay`] stamps a caption onto frames on the way through.

pub mod capture;
pub mod catalog;
pub mod device;
pub mod media;
pub mod overlay;
pub mod recorder;

#[cfg(test)]
pub(crate) mod test_support;

pub use capture::{CaptureError, CaptureListener, CaptureSession};
pub use catalog::{JsonCatalog, VideoCatalog, VideoRecord};
pub use device::{DeviceError, DevicePosition, DeviceSource, QualityPreset};
pub use media::{AudioBuffer, AudioFormat, MediaTime, Orientation, SessionClock, VideoFrame};
pub use overlay::TextOverlay;
pub use recorder::{Recorder, RecorderError, RecorderListener, RecordingState};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing for binaries embedding the pipeline. Honors
/// `RUST_LOG`, defaulting to debug logging for this crate.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camcorder=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
