//! Shared fakes for unit tests: an in-memory container writer with a
//! shared call log, scripted capture devices, and polling helpers for
//! asserting on work done by background threads.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::capture::CaptureListener;
use crate::device::{
    AudioSink, CameraDevice, DeviceError, DeviceInfo, DevicePosition, DeviceSource, Microphone,
    QualityPreset,
};
use crate::media::{
    AudioBuffer, AudioFormat, MediaTime, Orientation, SessionClock, VideoFrame,
};
use crate::recorder::container::{
    ContainerWriter, TrackKind, VideoTrackConfig, WriterError, WriterFactory, WriterStatus,
};
use crate::recorder::{RecorderError, RecorderListener};

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

// ---------------------------------------------------------------- writer --

/// Everything a [`MockWriter`] was asked to do, shared with the test.
#[derive(Default)]
pub struct WriterLog {
    pub created: Vec<PathBuf>,
    pub video_config: Option<VideoTrackConfig>,
    pub audio_format: Option<AudioFormat>,
    pub session_start: Option<MediaTime>,
    pub video_pts: Vec<MediaTime>,
    pub video_orientations: Vec<Orientation>,
    pub audio_pts: Vec<MediaTime>,
    pub finished_at: Option<MediaTime>,
    pub cancelled_at: Option<MediaTime>,
}

#[derive(Clone)]
pub struct MockFactory {
    pub log: Arc<Mutex<WriterLog>>,
    pub fail_create: Arc<AtomicBool>,
    pub fail_video_append: Arc<AtomicBool>,
    pub fail_finish: Arc<AtomicBool>,
    pub video_ready: Arc<AtomicBool>,
    pub audio_ready: Arc<AtomicBool>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(WriterLog::default())),
            fail_create: Arc::new(AtomicBool::new(false)),
            fail_video_append: Arc::new(AtomicBool::new(false)),
            fail_finish: Arc::new(AtomicBool::new(false)),
            video_ready: Arc::new(AtomicBool::new(true)),
            audio_ready: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl WriterFactory for MockFactory {
    fn create(&self, destination: &Path) -> Result<Box<dyn ContainerWriter>, WriterError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(WriterError::Create("scripted create failure".into()));
        }
        // Leave a file behind like a real writer would, so deletion paths
        // are observable.
        std::fs::File::create(destination)
            .map_err(|e| WriterError::Create(format!("touch {destination:?}: {e}")))?;
        self.log.lock().created.push(destination.to_path_buf());
        Ok(Box::new(MockWriter {
            log: self.log.clone(),
            destination: destination.to_path_buf(),
            fail_video_append: self.fail_video_append.clone(),
            fail_finish: self.fail_finish.clone(),
            video_ready: self.video_ready.clone(),
            audio_ready: self.audio_ready.clone(),
            error: None,
        }))
    }
}

pub struct MockWriter {
    log: Arc<Mutex<WriterLog>>,
    destination: PathBuf,
    fail_video_append: Arc<AtomicBool>,
    fail_finish: Arc<AtomicBool>,
    video_ready: Arc<AtomicBool>,
    audio_ready: Arc<AtomicBool>,
    error: Option<WriterError>,
}

impl ContainerWriter for MockWriter {
    fn add_video_track(&mut self, config: &VideoTrackConfig) -> Result<(), WriterError> {
        self.log.lock().video_config = Some(*config);
        Ok(())
    }

    fn add_audio_track(&mut self, format: &AudioFormat) -> Result<(), WriterError> {
        self.log.lock().audio_format = Some(*format);
        Ok(())
    }

    fn start_session(&mut self, at: MediaTime) -> Result<(), WriterError> {
        self.log.lock().session_start = Some(at);
        Ok(())
    }

    fn is_ready(&self, track: TrackKind) -> bool {
        match track {
            TrackKind::Video => self.video_ready.load(Ordering::SeqCst),
            TrackKind::Audio => self.audio_ready.load(Ordering::SeqCst),
        }
    }

    fn append_video(&mut self, frame: &VideoFrame) -> Result<(), WriterError> {
        if self.fail_video_append.load(Ordering::SeqCst) {
            let error = WriterError::Encoder("scripted append failure".into());
            self.error = Some(error.clone());
            return Err(error);
        }
        let mut log = self.log.lock();
        log.video_pts.push(frame.pts);
        log.video_orientations.push(frame.orientation);
        Ok(())
    }

    fn append_audio(&mut self, buffer: &AudioBuffer) -> Result<(), WriterError> {
        self.log.lock().audio_pts.push(buffer.pts);
        Ok(())
    }

    fn status(&self) -> WriterStatus {
        if self.error.is_some() {
            WriterStatus::Failed
        } else {
            WriterStatus::Writing
        }
    }

    fn error(&self) -> Option<WriterError> {
        self.error.clone()
    }

    fn finish(self: Box<Self>, end: MediaTime) -> Result<PathBuf, WriterError> {
        self.log.lock().finished_at = Some(end);
        if self.fail_finish.load(Ordering::SeqCst) {
            return Err(WriterError::Finalize("scripted finalize failure".into()));
        }
        Ok(self.destination)
    }

    fn cancel(self: Box<Self>, end: MediaTime) {
        self.log.lock().cancelled_at = Some(end);
    }
}

// ------------------------------------------------------------- listeners --

#[derive(Debug, Clone, PartialEq)]
pub enum RecorderEvent {
    Began,
    Finished(PathBuf),
    Failed(String),
}

#[derive(Default)]
pub struct MockRecorderListener {
    pub events: Mutex<Vec<RecorderEvent>>,
}

impl MockRecorderListener {
    pub fn events(&self) -> Vec<RecorderEvent> {
        self.events.lock().clone()
    }
}

impl RecorderListener for MockRecorderListener {
    fn on_began(&self) {
        self.events.lock().push(RecorderEvent::Began);
    }

    fn on_finished(&self, path: &Path) {
        self.events
            .lock()
            .push(RecorderEvent::Finished(path.to_path_buf()));
    }

    fn on_failed(&self, error: &RecorderError) {
        self.events
            .lock()
            .push(RecorderEvent::Failed(error.to_string()));
    }
}

#[derive(Default)]
pub struct MockCaptureListener {
    pub events: Mutex<Vec<&'static str>>,
}

impl MockCaptureListener {
    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().clone()
    }
}

impl CaptureListener for MockCaptureListener {
    fn on_started(&self) {
        self.events.lock().push("started");
    }

    fn on_stopped(&self) {
        self.events.lock().push("stopped");
    }
}

// --------------------------------------------------------------- devices --

/// Test-side handle onto a selected [`FakeCamera`].
#[derive(Clone)]
pub struct CameraHandle {
    pub info: DeviceInfo,
    pub torch_on: Arc<AtomicBool>,
    pub stream_open: Arc<AtomicBool>,
    /// When set, every `next_frame` call fails, simulating a camera that
    /// was yanked or claimed by another process.
    pub fail_frames: Arc<AtomicBool>,
    queue: Arc<Mutex<VecDeque<VideoFrame>>>,
}

impl CameraHandle {
    pub fn push_frame(&self, frame: VideoFrame) {
        self.queue.lock().push_back(frame);
    }

    pub fn torch_on(&self) -> bool {
        self.torch_on.load(Ordering::SeqCst)
    }
}

struct FakeCamera {
    handle: CameraHandle,
    clock: Option<SessionClock>,
}

impl CameraDevice for FakeCamera {
    fn info(&self) -> DeviceInfo {
        self.handle.info.clone()
    }

    fn set_torch(&mut self, on: bool) -> Result<(), DeviceError> {
        if !self.handle.info.has_torch {
            return Err(DeviceError::TorchUnsupported);
        }
        self.handle.torch_on.store(on, Ordering::SeqCst);
        Ok(())
    }

    fn open_stream(&mut self, clock: SessionClock) -> Result<(), DeviceError> {
        self.handle.stream_open.store(true, Ordering::SeqCst);
        self.clock = Some(clock);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<VideoFrame, DeviceError> {
        if !self.handle.stream_open.load(Ordering::SeqCst) {
            return Err(DeviceError::StreamClosed);
        }
        if self.handle.fail_frames.load(Ordering::SeqCst) {
            return Err(DeviceError::Backend("scripted frame failure".into()));
        }
        let clock = self.clock.as_ref().ok_or(DeviceError::StreamClosed)?;
        if let Some(frame) = self.handle.queue.lock().pop_front() {
            return Ok(frame);
        }
        // A camera never runs dry; synthesize filler at the live clock.
        std::thread::sleep(Duration::from_millis(2));
        Ok(VideoFrame::blank(4, 4, clock.now()))
    }

    fn stop_stream(&mut self) {
        self.handle.stream_open.store(false, Ordering::SeqCst);
    }
}

struct FakeMicrophone {
    started: Arc<AtomicBool>,
    sink_slot: Arc<Mutex<Option<AudioSink>>>,
}

impl Microphone for FakeMicrophone {
    fn name(&self) -> String {
        "Fake Microphone".into()
    }

    fn start(&mut self, _clock: SessionClock, sink: AudioSink) -> Result<(), DeviceError> {
        *self.sink_slot.lock() = Some(sink);
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        *self.sink_slot.lock() = None;
        self.started.store(false, Ordering::SeqCst);
    }
}

/// Scripted device source: cameras are declared as
/// `(position, best supported preset, has torch)` tuples.
pub struct FakeDeviceSource {
    specs: Vec<(DevicePosition, QualityPreset, bool)>,
    pub selected: Mutex<Vec<CameraHandle>>,
    pub mic_started: Arc<AtomicBool>,
    mic_sink: Arc<Mutex<Option<AudioSink>>>,
}

impl FakeDeviceSource {
    pub fn empty() -> Self {
        Self::with_cameras(Vec::new())
    }

    pub fn with_cameras(specs: Vec<(DevicePosition, QualityPreset, bool)>) -> Self {
        Self {
            specs,
            selected: Mutex::new(Vec::new()),
            mic_started: Arc::new(AtomicBool::new(false)),
            mic_sink: Arc::new(Mutex::new(None)),
        }
    }

    /// Handle onto the most recently selected camera.
    pub fn last_camera(&self) -> CameraHandle {
        self.selected
            .lock()
            .last()
            .cloned()
            .expect("no camera selected yet")
    }

    /// Push an audio buffer through the live microphone sink, as the audio
    /// delivery context would.
    pub fn emit_audio(&self, buffer: AudioBuffer) {
        let sink = self.mic_sink.lock().clone();
        if let Some(sink) = sink {
            sink(buffer);
        }
    }

    fn info_for(index: usize, position: DevicePosition, has_torch: bool) -> DeviceInfo {
        DeviceInfo {
            id: format!("fake-{index}"),
            name: format!("Fake {position:?} Camera {index}"),
            position,
            has_torch,
        }
    }
}

impl DeviceSource for FakeDeviceSource {
    fn list_cameras(&self, position: DevicePosition) -> Vec<DeviceInfo> {
        self.specs
            .iter()
            .enumerate()
            .filter(|(_, (p, _, _))| *p == position)
            .map(|(i, (p, _, torch))| Self::info_for(i, *p, *torch))
            .collect()
    }

    fn select_camera(
        &self,
        position: DevicePosition,
        preset: QualityPreset,
    ) -> Result<Box<dyn CameraDevice>, DeviceError> {
        let mut any = false;
        for (index, (p, best, torch)) in self.specs.iter().enumerate() {
            if *p != position {
                continue;
            }
            any = true;
            if *best < preset {
                continue;
            }
            let handle = CameraHandle {
                info: Self::info_for(index, *p, *torch),
                torch_on: Arc::new(AtomicBool::new(false)),
                stream_open: Arc::new(AtomicBool::new(false)),
                fail_frames: Arc::new(AtomicBool::new(false)),
                queue: Arc::new(Mutex::new(VecDeque::new())),
            };
            self.selected.lock().push(handle.clone());
            return Ok(Box::new(FakeCamera {
                handle,
                clock: None,
            }));
        }
        if any {
            Err(DeviceError::UnsupportedPreset { position, preset })
        } else {
            Err(DeviceError::NoDevice(position))
        }
    }

    fn default_microphone(&self) -> Result<Box<dyn Microphone>, DeviceError> {
        Ok(Box::new(FakeMicrophone {
            started: self.mic_started.clone(),
            sink_slot: self.mic_sink.clone(),
        }))
    }
}
