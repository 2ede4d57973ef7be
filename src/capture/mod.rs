//! Capture session: binds one camera and one microphone, runs the camera on
//! a dedicated worker thread, and fans frames out to the preview sink and
//! the recorder.
//!
//! The worker owns the camera exclusively; control operations (flip, torch,
//! orientation) reach it over a command channel and are applied between
//! frames. Audio is push-based and flows straight from the microphone's
//! delivery context into the recorder.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use thiserror::Error;

use crate::device::{
    AudioSink, CameraDevice, DeviceError, DevicePosition, DeviceSource, Microphone, QualityPreset,
};
use crate::media::{Orientation, SessionClock, VideoFrame};
use crate::recorder::Recorder;

/// Consecutive delivery failures tolerated before the session treats the
/// camera as gone and shuts down.
const MAX_FRAME_ERRORS: u32 = 10;

/// Session lifecycle events; invoked from the worker thread or the caller
/// of `start`/`stop`.
pub trait CaptureListener: Send + Sync {
    fn on_started(&self);
    fn on_stopped(&self);
}

#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("capture session error: {0}")]
    Session(String),
}

/// Optional per-frame transform applied before fan-out; `None` means the
/// frame passes through untouched.
pub type FrameDecorator = Arc<dyn Fn(&VideoFrame) -> Option<VideoFrame> + Send + Sync>;

/// Receives every delivered (possibly decorated) frame, e.g. for an
/// on-screen preview.
pub type PreviewSink = Arc<dyn Fn(&VideoFrame) + Send + Sync>;

enum Command {
    Swap(Box<dyn CameraDevice>, DevicePosition),
    SetTorch(bool),
    SetOrientation(Orientation),
    Stop,
}

/// State shared between the session facade, the camera worker, and the
/// microphone's delivery context.
struct Shared {
    running: AtomicBool,
    recorder: Mutex<Option<Arc<Recorder>>>,
    listener: Mutex<Option<Weak<dyn CaptureListener>>>,
    decorator: Mutex<Option<FrameDecorator>>,
    preview: Mutex<Option<PreviewSink>>,
    microphone: Mutex<Option<Box<dyn Microphone>>>,
}

impl Shared {
    fn notify(&self, f: impl FnOnce(&dyn CaptureListener)) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener.and_then(|w| w.upgrade()) {
            f(listener.as_ref());
        }
    }

    /// Fan one frame out to the decorator, preview and recorder. Each hook
    /// is cloned out of its slot before it runs; no lock is held across a
    /// callback, so hooks may freely touch the session's setters.
    fn deliver(&self, frame: VideoFrame) {
        let decorator = self.decorator.lock().clone();
        let decorated = decorator.as_ref().and_then(|d| d(&frame)).unwrap_or(frame);

        let preview = self.preview.lock().clone();
        if let Some(preview) = preview {
            preview(&decorated);
        }

        let recorder = self.recorder.lock().clone();
        if let Some(recorder) = recorder {
            // Intake failures are reported through the recorder's own
            // listener.
            let _ = recorder.add_video_sample(&decorated);
        }
    }

    fn stop_microphone(&self) {
        let microphone = self.microphone.lock().take();
        if let Some(mut microphone) = microphone {
            microphone.stop();
        }
    }
}

struct Worker {
    commands: Sender<Command>,
    join: std::thread::JoinHandle<()>,
}

pub struct CaptureSession {
    source: Arc<dyn DeviceSource>,
    preset: QualityPreset,
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
    clock: Mutex<Option<SessionClock>>,
    position: Mutex<DevicePosition>,
    orientation: Mutex<Orientation>,
    torch_preference: AtomicBool,
    /// Whether the camera currently (or most recently) driven by the worker
    /// carries a torch.
    active_has_torch: AtomicBool,
}

impl CaptureSession {
    /// Bind to a device source, verifying up front that the requested
    /// position and preset can actually be satisfied. Devices are
    /// re-resolved on every `start`, so a later hardware change surfaces
    /// there instead.
    pub fn new(
        source: Arc<dyn DeviceSource>,
        position: DevicePosition,
        preset: QualityPreset,
    ) -> Result<Self, CaptureError> {
        drop(source.select_camera(position, preset)?);
        drop(source.default_microphone()?);
        Ok(Self::unchecked(source, position, preset))
    }

    fn unchecked(
        source: Arc<dyn DeviceSource>,
        position: DevicePosition,
        preset: QualityPreset,
    ) -> Self {
        Self {
            source,
            preset,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                recorder: Mutex::new(None),
                listener: Mutex::new(None),
                decorator: Mutex::new(None),
                preview: Mutex::new(None),
                microphone: Mutex::new(None),
            }),
            worker: Mutex::new(None),
            clock: Mutex::new(None),
            position: Mutex::new(position),
            orientation: Mutex::new(Orientation::default()),
            torch_preference: AtomicBool::new(false),
            active_has_torch: AtomicBool::new(false),
        }
    }

    pub fn set_recorder(&self, recorder: Arc<Recorder>) {
        *self.shared.recorder.lock() = Some(recorder);
    }

    pub fn set_listener(&self, listener: &Arc<dyn CaptureListener>) {
        *self.shared.listener.lock() = Some(Arc::downgrade(listener));
    }

    pub fn set_frame_decorator(&self, decorator: Option<FrameDecorator>) {
        *self.shared.decorator.lock() = decorator;
    }

    pub fn set_preview_sink(&self, sink: Option<PreviewSink>) {
        *self.shared.preview.lock() = sink;
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn position(&self) -> DevicePosition {
        *self.position.lock()
    }

    /// Bind devices and begin delivery. A no-op while running; a session
    /// that stopped itself (camera interruption) is reclaimed and started
    /// fresh.
    pub fn start(&self) -> Result<(), CaptureError> {
        let mut worker_slot = self.worker.lock();
        if self.shared.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(worker) = worker_slot.take() {
            // Leftover from a self-stopped session.
            let _ = worker.commands.send(Command::Stop);
            let _ = worker.join.join();
            self.shared.stop_microphone();
        }

        let position = *self.position.lock();
        let clock = SessionClock::start();
        let mut camera = self.source.select_camera(position, self.preset)?;
        let has_torch = camera.has_torch();
        self.apply_torch(camera.as_mut(), position);
        camera.open_stream(clock.clone())?;

        let mut microphone = self.source.default_microphone()?;
        let shared = self.shared.clone();
        let sink: AudioSink = Arc::new(move |buffer| {
            if !shared.running.load(Ordering::SeqCst) {
                return;
            }
            let recorder = shared.recorder.lock().clone();
            if let Some(recorder) = recorder {
                let _ = recorder.add_audio_sample(&buffer);
            }
        });
        if let Err(e) = microphone.start(clock.clone(), sink) {
            camera.stop_stream();
            return Err(e.into());
        }

        let (commands, receiver) = unbounded();
        let shared = self.shared.clone();
        let orientation = *self.orientation.lock();
        shared.running.store(true, Ordering::SeqCst);
        let join = std::thread::spawn(move || run_worker(camera, orientation, receiver, shared));

        *worker_slot = Some(Worker { commands, join });
        *self.shared.microphone.lock() = Some(microphone);
        *self.clock.lock() = Some(clock);
        self.active_has_torch.store(has_torch, Ordering::SeqCst);
        drop(worker_slot);

        tracing::info!("capture session started ({position:?}, {:?})", self.preset);
        self.shared.notify(|l| l.on_started());
        Ok(())
    }

    /// End delivery and release both devices. A no-op when not running.
    pub fn stop(&self) {
        let worker = self.worker.lock().take();
        let Some(worker) = worker else {
            return;
        };
        let was_running = self.shared.running.swap(false, Ordering::SeqCst);
        let _ = worker.commands.send(Command::Stop);
        if let Err(e) = worker.join.join() {
            tracing::error!("capture worker panicked: {e:?}");
        }
        self.shared.stop_microphone();
        *self.clock.lock() = None;
        self.active_has_torch.store(false, Ordering::SeqCst);
        if was_running {
            tracing::info!("capture session stopped");
            self.shared.notify(|l| l.on_stopped());
        }
    }

    /// Switch to the opposite camera.
    ///
    /// The replacement device is resolved before anything is torn down; a
    /// resolution failure leaves the current camera delivering. While the
    /// session is idle this only toggles the position used by the next
    /// `start`.
    pub fn flip_camera(&self) -> Result<DevicePosition, CaptureError> {
        let worker = self.worker.lock();
        let next = self.position.lock().flipped();

        let Some(worker) = worker.as_ref() else {
            *self.position.lock() = next;
            return Ok(next);
        };

        let Some(clock) = self.clock.lock().clone() else {
            return Err(CaptureError::Session("session clock is gone".into()));
        };
        let mut camera = self.source.select_camera(next, self.preset)?;
        let has_torch = camera.has_torch();
        self.apply_torch(camera.as_mut(), next);
        camera.open_stream(clock)?;
        worker
            .commands
            .send(Command::Swap(camera, next))
            .map_err(|_| CaptureError::Session("capture worker is gone".into()))?;
        *self.position.lock() = next;
        self.active_has_torch.store(has_torch, Ordering::SeqCst);
        tracing::info!("camera flipped to {next:?}");
        Ok(next)
    }

    /// Record the torch preference and return the state actually applied:
    /// the torch only lights while the session runs, on a back camera that
    /// has one. The preference is kept either way so it re-applies after a
    /// flip back. Idempotent per call.
    pub fn set_torch(&self, force: bool) -> bool {
        self.torch_preference.store(force, Ordering::SeqCst);
        let applied = force
            && self.is_running()
            && *self.position.lock() == DevicePosition::Back
            && self.active_has_torch.load(Ordering::SeqCst);
        if let Some(worker) = self.worker.lock().as_ref() {
            let _ = worker.commands.send(Command::SetTorch(applied));
        }
        applied
    }

    /// Orientation stamped on every frame delivered from now on.
    pub fn set_orientation(&self, orientation: Orientation) {
        *self.orientation.lock() = orientation;
        if let Some(worker) = self.worker.lock().as_ref() {
            let _ = worker.commands.send(Command::SetOrientation(orientation));
        }
    }

    /// Torch state implied by the stored preference for `position`; applied
    /// to freshly resolved devices before their stream opens.
    fn apply_torch(&self, camera: &mut dyn CameraDevice, position: DevicePosition) {
        let want = self.torch_preference.load(Ordering::SeqCst) && position == DevicePosition::Back;
        if !want {
            return;
        }
        if !camera.has_torch() {
            tracing::warn!("torch requested but {:?} has none", camera.info().name);
            return;
        }
        if let Err(e) = camera.set_torch(true) {
            tracing::warn!("could not light torch: {e}");
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(
    mut camera: Box<dyn CameraDevice>,
    mut orientation: Orientation,
    commands: Receiver<Command>,
    shared: Arc<Shared>,
) {
    let mut consecutive_errors = 0u32;
    loop {
        loop {
            match commands.try_recv() {
                Ok(Command::Stop) => {
                    camera.stop_stream();
                    return;
                }
                Ok(Command::Swap(next, position)) => {
                    camera.stop_stream();
                    camera = next;
                    consecutive_errors = 0;
                    tracing::debug!("worker now driving {position:?} camera");
                }
                Ok(Command::SetTorch(on)) => {
                    if let Err(e) = camera.set_torch(on) {
                        tracing::warn!("torch change failed: {e}");
                    }
                }
                Ok(Command::SetOrientation(o)) => orientation = o,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    camera.stop_stream();
                    return;
                }
            }
        }

        match camera.next_frame() {
            Ok(mut frame) => {
                consecutive_errors = 0;
                frame.orientation = orientation;
                shared.deliver(frame);
            }
            Err(e) => {
                consecutive_errors += 1;
                tracing::warn!("frame delivery failed ({consecutive_errors}): {e}");
                if consecutive_errors >= MAX_FRAME_ERRORS {
                    tracing::error!("camera interrupted, stopping capture");
                    camera.stop_stream();
                    shared.running.store(false, Ordering::SeqCst);
                    shared.stop_microphone();
                    shared.notify(|l| l.on_stopped());
                    return;
                }
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
        }
    }
}
