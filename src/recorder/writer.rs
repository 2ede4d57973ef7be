//! Recorder: owns the container writer lifecycle and accepts interleaved
//! audio/video samples from the capture session's delivery contexts.
//!
//! All session state lives behind one mutex. Intake paths mutate under the
//! lock and keep critical sections short (writer appends are non-blocking
//! channel sends). Anything that can block or re-enter, such as writer
//! finalize/cancel, file deletion and listener callbacks, happens after the
//! lock is released, against fields snapshotted out of the session.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;

use super::container::{ContainerWriter, TrackKind, VideoTrackConfig, WriterError, WriterFactory, WriterStatus};
use super::state::RecordingState;
use crate::media::{AudioBuffer, AudioFormat, MediaTime, VideoFrame};

/// Lifecycle events consumed by the surrounding UI layer. Callbacks are
/// invoked synchronously from whichever context triggered the event;
/// marshaling to a UI-owned context is the listener's concern.
pub trait RecorderListener: Send + Sync {
    fn on_began(&self);
    fn on_finished(&self, path: &Path);
    fn on_failed(&self, error: &RecorderError);
}

#[derive(Debug, Clone, Error)]
pub enum RecorderError {
    #[error("a recording is already in progress")]
    AlreadyRecording,

    #[error("recording was never opened")]
    NeverOpened,

    #[error(transparent)]
    Writer(#[from] WriterError),
}

/// Platform "keep running in background" capability. A token is acquired
/// for the duration of a recording attempt and released exactly once on
/// every terminal path (drop-based).
pub trait KeepAwake: Send + Sync {
    fn acquire(&self) -> KeepAwakeToken;
}

pub struct KeepAwakeToken {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl KeepAwakeToken {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn noop() -> Self {
        Self { release: None }
    }
}

impl Drop for KeepAwakeToken {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

#[derive(Default)]
struct Inner {
    state: RecordingState,
    writer: Option<Box<dyn ContainerWriter>>,
    destination: Option<PathBuf>,
    /// Most recent format seen on the audio intake, in any state. Used to
    /// configure the audio track once recording starts.
    audio_format: Option<AudioFormat>,
    audio_track_added: bool,
    start_time: Option<MediaTime>,
    latest_video_time: Option<MediaTime>,
    wake_token: Option<KeepAwakeToken>,
}

impl Inner {
    /// Clear everything tied to the current session. Format discovery
    /// survives: the last seen audio format outlives any one recording.
    fn reset(&mut self) {
        self.state = RecordingState::Idle;
        self.writer = None;
        self.destination = None;
        self.audio_track_added = false;
        self.start_time = None;
        self.latest_video_time = None;
        self.wake_token = None;
    }
}

/// Session fields snapshotted out under the lock so the failure cleanup
/// (cancel, delete, notify) can run outside it.
struct FailedSession {
    writer: Option<Box<dyn ContainerWriter>>,
    destination: Option<PathBuf>,
    token: Option<KeepAwakeToken>,
    end: MediaTime,
    error: WriterError,
}

pub struct Recorder {
    factory: Box<dyn WriterFactory>,
    video_config: VideoTrackConfig,
    keep_awake: Option<Arc<dyn KeepAwake>>,
    listener: Mutex<Option<Weak<dyn RecorderListener>>>,
    inner: Mutex<Inner>,
}

impl Recorder {
    pub fn new(factory: Box<dyn WriterFactory>) -> Self {
        Self::with_config(factory, VideoTrackConfig::default(), None)
    }

    pub fn with_config(
        factory: Box<dyn WriterFactory>,
        video_config: VideoTrackConfig,
        keep_awake: Option<Arc<dyn KeepAwake>>,
    ) -> Self {
        Self {
            factory,
            video_config,
            keep_awake,
            listener: Mutex::new(None),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Non-owning; the listener's lifetime is managed elsewhere and a dead
    /// reference is treated as "no listener".
    pub fn set_listener(&self, listener: &Arc<dyn RecorderListener>) {
        *self.listener.lock() = Some(Arc::downgrade(listener));
    }

    pub fn state(&self) -> RecordingState {
        self.inner.lock().state
    }

    pub fn is_recording(&self) -> bool {
        self.inner.lock().state.is_active()
    }

    fn notify(&self, f: impl FnOnce(&dyn RecorderListener)) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener.and_then(|w| w.upgrade()) {
            f(listener.as_ref());
        }
    }

    /// Begin a new recording to `destination`.
    ///
    /// Fails synchronously when a recording is already active. The audio
    /// track is added here when the live format is already known, otherwise
    /// lazily on the first audio intake.
    pub fn start_recording(&self, destination: &Path) -> Result<(), RecorderError> {
        let mut inner = self.inner.lock();
        if inner.state.is_active() {
            return Err(RecorderError::AlreadyRecording);
        }
        inner.reset();

        if destination.exists() {
            if let Err(e) = std::fs::remove_file(destination) {
                tracing::warn!("could not remove stale file at {destination:?}: {e}");
            }
        }

        let setup = (|| -> Result<Box<dyn ContainerWriter>, WriterError> {
            let mut writer = self.factory.create(destination)?;
            writer.add_video_track(&self.video_config)?;
            if let Some(format) = inner.audio_format {
                writer.add_audio_track(&format)?;
                inner.audio_track_added = true;
            }
            Ok(writer)
        })();

        let writer = match setup {
            Ok(writer) => writer,
            Err(error) => {
                inner.audio_track_added = false;
                drop(inner);
                // No file left behind by a failed attempt.
                let _ = std::fs::remove_file(destination);
                let error = RecorderError::Writer(error);
                tracing::error!("failed to start recording: {error}");
                self.notify(|l| l.on_failed(&error));
                return Err(error);
            }
        };

        inner.state = inner
            .state
            .transition(RecordingState::Configuring)
            .unwrap_or(RecordingState::Configuring);
        inner.writer = Some(writer);
        inner.destination = Some(destination.to_path_buf());
        inner.wake_token = self.keep_awake.as_ref().map(|k| k.acquire());
        drop(inner);

        tracing::info!("recording configured for {destination:?}");
        self.notify(|l| l.on_began());
        Ok(())
    }

    /// Video intake, called from the video delivery context.
    ///
    /// Ignored until the audio track exists (all tracks must be declared
    /// before the session clock opens). The first accepted frame opens the
    /// session and becomes time zero; frames older than that are silently
    /// discarded.
    pub fn add_video_sample(&self, frame: &VideoFrame) -> Result<(), RecorderError> {
        let mut inner = self.inner.lock();
        if !inner.state.is_active() || !inner.audio_track_added || inner.writer.is_none() {
            return Ok(());
        }

        let health = inner.writer.as_ref().map(|w| (w.status(), w.error()));
        if let Some((WriterStatus::Failed, error)) = health {
            let error = error.unwrap_or_else(|| WriterError::Encoder("writer failed".into()));
            let failed = Self::take_failed(&mut inner, error);
            drop(inner);
            return Err(self.dispose_failed(failed));
        }

        if inner.start_time.is_none() {
            let pts = frame.pts;
            let open = inner
                .writer
                .as_mut()
                .map(|w| w.start_session(pts))
                .unwrap_or(Err(WriterError::SessionNotOpen));
            if let Err(error) = open {
                let failed = Self::take_failed(&mut inner, error);
                drop(inner);
                return Err(self.dispose_failed(failed));
            }
            inner.start_time = Some(pts);
            match inner.state.transition(RecordingState::Writing) {
                Ok(next) => inner.state = next,
                Err(e) => tracing::error!("{e}"),
            }
            tracing::info!("recording session opened at {:.3}s", pts.as_secs_f64());
        }

        let Some(start) = inner.start_time else {
            return Ok(());
        };
        if frame.pts < start {
            // Late arrival against a just-opened session.
            return Ok(());
        }
        inner.latest_video_time = Some(frame.pts);

        let ready = inner
            .writer
            .as_ref()
            .map(|w| w.is_ready(TrackKind::Video))
            .unwrap_or(false);
        if !ready {
            tracing::debug!(
                "video track not ready, dropping frame at {:.3}s",
                frame.pts.as_secs_f64()
            );
            return Ok(());
        }
        let append = inner
            .writer
            .as_mut()
            .map(|w| w.append_video(frame))
            .unwrap_or(Ok(()));
        if let Err(error) = append {
            let failed = Self::take_failed(&mut inner, error);
            drop(inner);
            return Err(self.dispose_failed(failed));
        }
        Ok(())
    }

    /// Audio intake, called from the audio delivery context.
    ///
    /// The buffer's format is always recorded, in any state, so format
    /// discovery can precede `start_recording`. The track itself is added
    /// lazily while configuring; buffers are only appended once the session
    /// clock is open.
    pub fn add_audio_sample(&self, buffer: &AudioBuffer) -> Result<(), RecorderError> {
        let mut inner = self.inner.lock();
        inner.audio_format = Some(buffer.format);

        if !inner.state.is_active() || inner.writer.is_none() {
            return Ok(());
        }

        if !inner.audio_track_added {
            let format = buffer.format;
            let added = inner
                .writer
                .as_mut()
                .map(|w| w.add_audio_track(&format))
                .unwrap_or(Ok(()));
            if let Err(error) = added {
                let failed = Self::take_failed(&mut inner, error);
                drop(inner);
                return Err(self.dispose_failed(failed));
            }
            inner.audio_track_added = true;
            tracing::info!("audio track added: {}Hz {}ch", format.sample_rate, format.channels);
        }

        let Some(start) = inner.start_time else {
            // Session clock not open yet; this buffer only contributed its
            // format.
            return Ok(());
        };
        if buffer.pts < start {
            return Ok(());
        }

        let health = inner.writer.as_ref().map(|w| (w.status(), w.error()));
        if let Some((WriterStatus::Failed, error)) = health {
            let error = error.unwrap_or_else(|| WriterError::Encoder("writer failed".into()));
            let failed = Self::take_failed(&mut inner, error);
            drop(inner);
            return Err(self.dispose_failed(failed));
        }
        let ready = inner
            .writer
            .as_ref()
            .map(|w| w.is_ready(TrackKind::Audio))
            .unwrap_or(false);
        if !ready {
            tracing::debug!("audio track not ready, dropping buffer");
            return Ok(());
        }
        let append = inner
            .writer
            .as_mut()
            .map(|w| w.append_audio(buffer))
            .unwrap_or(Ok(()));
        if let Err(error) = append {
            let failed = Self::take_failed(&mut inner, error);
            drop(inner);
            return Err(self.dispose_failed(failed));
        }
        Ok(())
    }

    /// Stop and finalize.
    ///
    /// Internal state is reset synchronously so a new recording can start
    /// immediately; the container finalize runs on a detached thread and
    /// reports completion through the listener. A recording whose session
    /// never opened is reported as a failure.
    pub fn stop_recording(&self) {
        let mut inner = self.inner.lock();
        let writer = inner.writer.take();
        let start_time = inner.start_time;
        let latest = inner.latest_video_time;
        let token = inner.wake_token.take();
        let state = inner.state;
        inner.reset();
        drop(inner);

        let (Some(writer), Some(start)) = (writer, start_time) else {
            drop(token);
            let error = RecorderError::NeverOpened;
            tracing::warn!("stop requested but {error}");
            self.notify(|l| l.on_failed(&error));
            return;
        };

        let mut session_state = match state.transition(RecordingState::Finishing) {
            Ok(next) => next,
            Err(e) => {
                tracing::error!("{e}");
                RecordingState::Finishing
            }
        };
        let end = latest.unwrap_or(start);
        let listener = self.listener.lock().clone();

        std::thread::spawn(move || {
            let result = writer.finish(end);
            let listener = listener.and_then(|w| w.upgrade());
            match result {
                Ok(path) => {
                    session_state = session_state
                        .transition(RecordingState::Finished)
                        .unwrap_or(RecordingState::Finished);
                    tracing::info!("recording finalized at {path:?} ({session_state:?})");
                    if let Some(listener) = listener {
                        listener.on_finished(&path);
                    }
                }
                Err(error) => {
                    session_state = session_state
                        .transition(RecordingState::Failed)
                        .unwrap_or(RecordingState::Failed);
                    let error = RecorderError::Writer(error);
                    tracing::error!("finalize failed: {error} ({session_state:?})");
                    if let Some(listener) = listener {
                        listener.on_failed(&error);
                    }
                }
            }
            drop(token);
        });
    }

    /// Tear down the current recording without producing a file.
    ///
    /// Safe to call concurrently with in-flight intake calls: the reset
    /// happens under the same lock, so a sample either completes against
    /// the old session or observes the reset and is dropped. No listener
    /// event fires after this returns.
    pub fn abort_recording(&self) {
        let mut inner = self.inner.lock();
        let writer = inner.writer.take();
        let destination = inner.destination.take();
        let token = inner.wake_token.take();
        let end = inner
            .latest_video_time
            .or(inner.start_time)
            .unwrap_or(MediaTime::ZERO);
        let opened = inner.start_time.is_some();
        if inner.state.is_active() {
            match inner.state.transition(RecordingState::Aborted) {
                Ok(_) => {}
                Err(e) => tracing::error!("{e}"),
            }
        }
        inner.reset();
        drop(inner);

        if let Some(writer) = writer {
            if opened {
                writer.cancel(end);
            } else {
                writer.cancel(MediaTime::ZERO);
            }
        }
        if let Some(destination) = destination {
            if let Err(e) = std::fs::remove_file(&destination) {
                if destination.exists() {
                    tracing::warn!("could not remove aborted file {destination:?}: {e}");
                }
            }
        }
        drop(token);
        tracing::info!("recording aborted");
    }

    fn take_failed(inner: &mut Inner, error: WriterError) -> FailedSession {
        let end = inner
            .latest_video_time
            .or(inner.start_time)
            .unwrap_or(MediaTime::ZERO);
        let failed = FailedSession {
            writer: inner.writer.take(),
            destination: inner.destination.take(),
            token: inner.wake_token.take(),
            end,
            error,
        };
        if inner.state.is_active() {
            match inner.state.transition(RecordingState::Failed) {
                Ok(_) => {}
                Err(e) => tracing::error!("{e}"),
            }
        }
        inner.reset();
        failed
    }

    /// Runs outside the lock: cancel the writer, drop the partial file,
    /// release the token, report once, and hand the error back to the
    /// intake caller.
    fn dispose_failed(&self, failed: FailedSession) -> RecorderError {
        if let Some(writer) = failed.writer {
            writer.cancel(failed.end);
        }
        if let Some(destination) = failed.destination {
            let _ = std::fs::remove_file(destination);
        }
        drop(failed.token);
        let error = RecorderError::Writer(failed.error);
        tracing::error!("recording failed: {error}");
        self.notify(|l| l.on_failed(&error));
        error
    }
}
