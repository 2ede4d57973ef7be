//! Capture device enumeration and selection.
//!
//! Platform-agnostic seams for the capture session: a [`DeviceSource`]
//! resolves cameras and microphones, a [`CameraDevice`] delivers frames on a
//! blocking pull loop, a [`Microphone`] pushes buffers from its own callback
//! context. The system-backed implementations live in [`system`].

pub mod system;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::media::{AudioBuffer, SessionClock, VideoFrame};

/// Which physical camera to bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePosition {
    Front,
    Back,
}

impl DevicePosition {
    pub fn flipped(self) -> Self {
        match self {
            DevicePosition::Front => DevicePosition::Back,
            DevicePosition::Back => DevicePosition::Front,
        }
    }
}

/// Capability requirement a selected camera must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    Low,
    Medium,
    High,
}

impl QualityPreset {
    /// Minimum capture resolution implied by the preset.
    pub fn min_resolution(&self) -> (u32, u32) {
        match self {
            QualityPreset::Low => (640, 480),
            QualityPreset::Medium => (1280, 720),
            QualityPreset::High => (1920, 1080),
        }
    }
}

/// Description of a candidate camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Backend device id.
    pub id: String,

    /// Human-readable device name.
    pub name: String,

    /// Physical position the device reports (or is inferred to have).
    pub position: DevicePosition,

    /// Whether the device carries a controllable torch.
    pub has_torch: bool,
}

/// Device-layer errors. `NoDevice` and `UnsupportedPreset` are distinct
/// because callers react differently (retry vs give up).
#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    #[error("no capture device available for position {0:?}")]
    NoDevice(DevicePosition),

    #[error("no device at position {position:?} supports preset {preset:?}")]
    UnsupportedPreset {
        position: DevicePosition,
        preset: QualityPreset,
    },

    #[error("no audio input device available")]
    NoMicrophone,

    #[error("torch is not supported by the active device")]
    TorchUnsupported,

    #[error("device stream is not open")]
    StreamClosed,

    #[error("device backend error: {0}")]
    Backend(String),
}

/// Sink for microphone buffers; invoked on the audio delivery context.
pub type AudioSink = Arc<dyn Fn(AudioBuffer) + Send + Sync>;

/// A bound video capture device.
///
/// `next_frame` is a blocking pull and is intended to be driven from a
/// dedicated worker thread; torch and stream control are called from that
/// same thread (or before the device is handed to it).
pub trait CameraDevice: Send {
    fn info(&self) -> DeviceInfo;

    fn position(&self) -> DevicePosition {
        self.info().position
    }

    fn has_torch(&self) -> bool {
        self.info().has_torch
    }

    /// Set the torch on or off. Fails on devices without a torch.
    fn set_torch(&mut self, on: bool) -> Result<(), DeviceError>;

    /// Begin continuous delivery; frames are stamped against `clock`.
    fn open_stream(&mut self, clock: SessionClock) -> Result<(), DeviceError>;

    /// Block until the next frame arrives.
    fn next_frame(&mut self) -> Result<VideoFrame, DeviceError>;

    fn stop_stream(&mut self);
}

/// A bound audio input device.
pub trait Microphone: Send {
    fn name(&self) -> String;

    /// Begin delivery; `sink` is invoked from the device's own context with
    /// buffers stamped against `clock`.
    fn start(&mut self, clock: SessionClock, sink: AudioSink) -> Result<(), DeviceError>;

    fn stop(&mut self);
}

/// Resolves capture devices for the session.
pub trait DeviceSource: Send + Sync {
    /// Candidate cameras for a position, in platform preference order.
    /// An empty list is a valid, reportable outcome.
    fn list_cameras(&self, position: DevicePosition) -> Vec<DeviceInfo>;

    /// First candidate (in source order) whose capabilities satisfy the
    /// preset.
    fn select_camera(
        &self,
        position: DevicePosition,
        preset: QualityPreset,
    ) -> Result<Box<dyn CameraDevice>, DeviceError>;

    /// The default audio input device.
    fn default_microphone(&self) -> Result<Box<dyn Microphone>, DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeDeviceSource;

    #[test]
    fn empty_candidate_list_reports_no_device() {
        let source = FakeDeviceSource::empty();
        assert!(source.list_cameras(DevicePosition::Back).is_empty());

        let error = source
            .select_camera(DevicePosition::Back, QualityPreset::High)
            .err()
            .expect("selection should fail");
        match error {
            DeviceError::NoDevice(DevicePosition::Back) => {}
            other => panic!("expected NoDevice, got {other:?}"),
        }
    }

    #[test]
    fn candidates_without_preset_support_report_unsupported() {
        let source = FakeDeviceSource::with_cameras(vec![(
            DevicePosition::Back,
            QualityPreset::Low,
            false,
        )]);

        let error = source
            .select_camera(DevicePosition::Back, QualityPreset::High)
            .err()
            .expect("selection should fail");
        match error {
            DeviceError::UnsupportedPreset { preset, .. } => {
                assert_eq!(preset, QualityPreset::High)
            }
            other => panic!("expected UnsupportedPreset, got {other:?}"),
        }
    }

    #[test]
    fn first_qualifying_candidate_wins() {
        let source = FakeDeviceSource::with_cameras(vec![
            (DevicePosition::Back, QualityPreset::Low, false),
            (DevicePosition::Back, QualityPreset::High, true),
            (DevicePosition::Back, QualityPreset::High, false),
        ]);

        let camera = source
            .select_camera(DevicePosition::Back, QualityPreset::High)
            .unwrap();
        assert!(camera.has_torch(), "second candidate should be selected");
    }

    #[test]
    fn position_flips_both_ways() {
        assert_eq!(DevicePosition::Front.flipped(), DevicePosition::Back);
        assert_eq!(DevicePosition::Back.flipped(), DevicePosition::Front);
    }
}
