//! System-backed device source using nokhwa (camera) and cpal (microphone).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use nokhwa::pixel_format::RgbAFormat;
use nokhwa::utils::{ApiBackend, CameraIndex, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;

use super::{
    AudioSink, CameraDevice, DeviceError, DeviceInfo, DevicePosition, DeviceSource, Microphone,
    QualityPreset,
};
use crate::media::{AudioBuffer, AudioFormat, Orientation, PixelFormat, SessionClock, VideoFrame};

/// Enumerates real cameras and the default microphone.
pub struct SystemDeviceSource;

impl SystemDeviceSource {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SystemDeviceSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Desktop backends report no facing information, so position is inferred
/// from the device name: user-facing name hints map to Front, everything
/// else to Back.
fn inferred_position(name: &str) -> DevicePosition {
    let name = name.to_ascii_lowercase();
    if name.contains("front") || name.contains("facetime") || name.contains("integrated") {
        DevicePosition::Front
    } else {
        DevicePosition::Back
    }
}

fn query_cameras() -> Vec<(CameraIndex, DeviceInfo)> {
    match nokhwa::query(ApiBackend::Auto) {
        Ok(cameras) => cameras
            .into_iter()
            .map(|info| {
                let id = match info.index() {
                    CameraIndex::Index(i) => i.to_string(),
                    CameraIndex::String(s) => s.to_string(),
                };
                let name = info.human_name().to_string();
                let position = inferred_position(&name);
                (
                    info.index().clone(),
                    DeviceInfo {
                        id,
                        name,
                        position,
                        has_torch: false,
                    },
                )
            })
            .collect(),
        Err(e) => {
            tracing::warn!("failed to enumerate cameras: {e:?}");
            Vec::new()
        }
    }
}

/// Whether the device behind `index` can deliver at least the preset's
/// resolution. Probing opens the device without streaming.
fn supports_preset(index: &CameraIndex, preset: QualityPreset) -> bool {
    let (min_w, min_h) = preset.min_resolution();
    let requested =
        RequestedFormat::new::<RgbAFormat>(RequestedFormatType::AbsoluteHighestResolution);

    let mut camera = match Camera::new(index.clone(), requested) {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!("probe of camera {index:?} failed: {e:?}");
            return false;
        }
    };

    match camera.compatible_camera_formats() {
        Ok(formats) => formats
            .iter()
            .any(|f| f.resolution().width() >= min_w && f.resolution().height() >= min_h),
        Err(e) => {
            tracing::debug!("format query for camera {index:?} failed: {e:?}");
            false
        }
    }
}

impl DeviceSource for SystemDeviceSource {
    fn list_cameras(&self, position: DevicePosition) -> Vec<DeviceInfo> {
        query_cameras()
            .into_iter()
            .filter(|(_, info)| info.position == position)
            .map(|(_, info)| info)
            .collect()
    }

    fn select_camera(
        &self,
        position: DevicePosition,
        preset: QualityPreset,
    ) -> Result<Box<dyn CameraDevice>, DeviceError> {
        let candidates: Vec<_> = query_cameras()
            .into_iter()
            .filter(|(_, info)| info.position == position)
            .collect();

        if candidates.is_empty() {
            return Err(DeviceError::NoDevice(position));
        }

        for (index, info) in candidates {
            if supports_preset(&index, preset) {
                tracing::info!("selected camera {} for {position:?} at {preset:?}", info.name);
                return Ok(Box::new(NokhwaCamera::new(index, info)));
            }
        }

        Err(DeviceError::UnsupportedPreset { position, preset })
    }

    fn default_microphone(&self) -> Result<Box<dyn Microphone>, DeviceError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(DeviceError::NoMicrophone)?;
        let name = device.name().unwrap_or_else(|_| "unknown".to_string());
        Ok(Box::new(CpalMicrophone::new(name)))
    }
}

/// Camera bound through nokhwa; frames are pulled on the session's video
/// worker thread.
pub struct NokhwaCamera {
    index: CameraIndex,
    info: DeviceInfo,
    camera: Option<Camera>,
    clock: Option<SessionClock>,
}

impl NokhwaCamera {
    fn new(index: CameraIndex, info: DeviceInfo) -> Self {
        Self {
            index,
            info,
            camera: None,
            clock: None,
        }
    }
}

impl CameraDevice for NokhwaCamera {
    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn set_torch(&mut self, _on: bool) -> Result<(), DeviceError> {
        // nokhwa exposes no torch control.
        Err(DeviceError::TorchUnsupported)
    }

    fn open_stream(&mut self, clock: SessionClock) -> Result<(), DeviceError> {
        let requested =
            RequestedFormat::new::<RgbAFormat>(RequestedFormatType::AbsoluteHighestResolution);
        let mut camera = Camera::new(self.index.clone(), requested)
            .map_err(|e| DeviceError::Backend(format!("open camera: {e}")))?;
        camera
            .open_stream()
            .map_err(|e| DeviceError::Backend(format!("open stream: {e}")))?;

        let format = camera.camera_format();
        tracing::info!(
            "camera {} streaming at {}x{} @ {}fps",
            self.info.name,
            format.resolution().width(),
            format.resolution().height(),
            format.frame_rate()
        );

        self.camera = Some(camera);
        self.clock = Some(clock);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<VideoFrame, DeviceError> {
        let camera = self.camera.as_mut().ok_or(DeviceError::StreamClosed)?;
        let clock = self.clock.as_ref().ok_or(DeviceError::StreamClosed)?;

        let buffer = camera
            .frame()
            .map_err(|e| DeviceError::Backend(format!("capture frame: {e}")))?;
        let pts = clock.now();
        let image = buffer
            .decode_image::<RgbAFormat>()
            .map_err(|e| DeviceError::Backend(format!("decode frame: {e}")))?;
        let (width, height) = (image.width(), image.height());

        Ok(VideoFrame {
            data: image.into_raw(),
            width,
            height,
            format: PixelFormat::Rgba8,
            pts,
            orientation: Orientation::default(),
        })
    }

    fn stop_stream(&mut self) {
        if let Some(mut camera) = self.camera.take() {
            if let Err(e) = camera.stop_stream() {
                tracing::warn!("error stopping camera stream: {e:?}");
            }
        }
        self.clock = None;
    }
}

/// Default microphone bound through cpal.
///
/// The cpal stream is not `Send`, so it lives on a dedicated thread for the
/// duration of delivery (the stream's own callback is the audio delivery
/// context).
pub struct CpalMicrophone {
    name: String,
    running: Arc<AtomicBool>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl CpalMicrophone {
    fn new(name: String) -> Self {
        Self {
            name,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

/// Widen integer PCM to the pipeline's f32 interleaved representation.
pub(crate) fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / i16::MAX as f32).collect()
}

pub(crate) fn u16_to_f32(samples: &[u16]) -> Vec<f32> {
    samples
        .iter()
        .map(|&s| (s as f32 - u16::MAX as f32 / 2.0) / (u16::MAX as f32 / 2.0))
        .collect()
}

impl Microphone for CpalMicrophone {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn start(&mut self, clock: SessionClock, sink: AudioSink) -> Result<(), DeviceError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let running = self.running.clone();
        let ready = Arc::new(std::sync::Barrier::new(2));
        let ready_worker = ready.clone();
        let failure: Arc<parking_lot::Mutex<Option<DeviceError>>> =
            Arc::new(parking_lot::Mutex::new(None));
        let failure_worker = failure.clone();

        let handle = std::thread::spawn(move || {
            let fail = |e: DeviceError| {
                *failure_worker.lock() = Some(e);
                ready_worker.wait();
            };

            let host = cpal::default_host();
            let device = match host.default_input_device() {
                Some(d) => d,
                None => return fail(DeviceError::NoMicrophone),
            };
            let supported = match device.default_input_config() {
                Ok(c) => c,
                Err(e) => return fail(DeviceError::Backend(format!("input config: {e}"))),
            };

            let format = AudioFormat {
                sample_rate: supported.sample_rate().0,
                channels: supported.channels(),
            };
            let config = supported.config();
            let err_fn = |e| tracing::warn!("audio stream error: {e}");

            let deliver = move |samples: Vec<f32>, clock: &SessionClock| {
                sink(AudioBuffer {
                    samples,
                    format,
                    pts: clock.now(),
                });
            };

            let stream = match supported.sample_format() {
                SampleFormat::F32 => {
                    let clock = clock.clone();
                    let deliver = deliver.clone();
                    device.build_input_stream(
                        &config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            deliver(data.to_vec(), &clock)
                        },
                        err_fn,
                        None,
                    )
                }
                SampleFormat::I16 => {
                    let clock = clock.clone();
                    let deliver = deliver.clone();
                    device.build_input_stream(
                        &config,
                        move |data: &[i16], _: &cpal::InputCallbackInfo| {
                            deliver(i16_to_f32(data), &clock)
                        },
                        err_fn,
                        None,
                    )
                }
                SampleFormat::U16 => {
                    let clock = clock.clone();
                    let deliver = deliver.clone();
                    device.build_input_stream(
                        &config,
                        move |data: &[u16], _: &cpal::InputCallbackInfo| {
                            deliver(u16_to_f32(data), &clock)
                        },
                        err_fn,
                        None,
                    )
                }
                other => {
                    return fail(DeviceError::Backend(format!(
                        "unsupported sample format {other:?}"
                    )))
                }
            };

            let stream = match stream {
                Ok(s) => s,
                Err(e) => return fail(DeviceError::Backend(format!("build stream: {e}"))),
            };
            if let Err(e) = stream.play() {
                return fail(DeviceError::Backend(format!("start stream: {e}")));
            }

            tracing::info!("microphone streaming at {}Hz {}ch", format.sample_rate, format.channels);
            ready_worker.wait();

            while running.load(Ordering::SeqCst) {
                std::thread::sleep(std::time::Duration::from_millis(20));
            }
            drop(stream);
        });

        // Wait for the stream to come up (or fail) before reporting.
        ready.wait();
        if let Some(e) = failure.lock().take() {
            self.running.store(false, Ordering::SeqCst);
            let _ = handle.join();
            return Err(e);
        }

        self.worker = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}
