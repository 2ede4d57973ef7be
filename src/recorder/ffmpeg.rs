//! FFmpeg-backed container writer.
//!
//! One ffmpeg child process per track encodes raw media fed over stdin
//! (H.264 for video, 64 kbps AAC for audio); a finalize pass muxes the two
//! encoded tracks into the destination MP4, offsetting the audio by the gap
//! between the session start and the first accepted audio buffer so the
//! independently-clocked streams line up. Each track's stdin is fed through
//! a bounded channel by a feeder thread; channel fullness is the track's
//! "not ready for more data" signal.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Sender, TrySendError};
use tempfile::TempDir;

use super::container::{
    ContainerWriter, TrackKind, VideoTrackConfig, WriterError, WriterFactory, WriterStatus,
    AUDIO_BITRATE,
};
use crate::media::{AudioBuffer, AudioFormat, MediaTime, PixelFormat, VideoFrame};

const VIDEO_QUEUE_DEPTH: usize = 8;
const AUDIO_QUEUE_DEPTH: usize = 32;

/// Creates [`FfmpegWriter`]s; fails fast at construction when the ffmpeg
/// binary is not on the path.
pub struct FfmpegWriterFactory {
    command: PathBuf,
}

impl FfmpegWriterFactory {
    pub fn new() -> Result<Self, WriterError> {
        Self::with_command("ffmpeg")
    }

    pub fn with_command(command: impl Into<PathBuf>) -> Result<Self, WriterError> {
        let command = command.into();
        Command::new(&command)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|e| {
                WriterError::Create(format!("ffmpeg not found ({e}); install ffmpeg first"))
            })?;
        Ok(Self { command })
    }
}

impl WriterFactory for FfmpegWriterFactory {
    fn create(&self, destination: &Path) -> Result<Box<dyn ContainerWriter>, WriterError> {
        Ok(Box::new(FfmpegWriter::create(
            self.command.clone(),
            destination,
        )?))
    }
}

fn base_args() -> Vec<String> {
    ["-hide_banner", "-nostats", "-loglevel", "error", "-y"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn video_encode_args(config: &VideoTrackConfig, output: &Path) -> Vec<String> {
    let mut args = base_args();
    args.extend(
        [
            "-f",
            "rawvideo",
            "-pixel_format",
            "rgba",
            "-video_size",
            &format!("{}x{}", config.width, config.height),
            "-framerate",
            &config.fps.to_string(),
            "-i",
            "-",
            "-c:v",
            "libx264",
            "-preset",
            "veryfast",
            "-pix_fmt",
            "yuv420p",
            "-g",
            &(config.fps * 2).to_string(),
            "-movflags",
            "+faststart",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args.push(output.to_string_lossy().to_string());
    args
}

fn audio_encode_args(format: &AudioFormat, output: &Path) -> Vec<String> {
    let mut args = base_args();
    args.extend(
        [
            "-f",
            "f32le",
            "-ar",
            &format.sample_rate.to_string(),
            "-ac",
            &format.channels.to_string(),
            "-i",
            "-",
            "-c:a",
            "aac",
            "-b:a",
            &AUDIO_BITRATE.to_string(),
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args.push(output.to_string_lossy().to_string());
    args
}

fn mux_args(
    video: &Path,
    audio: Option<(&Path, f64)>,
    duration_secs: f64,
    destination: &Path,
) -> Vec<String> {
    let mut args = base_args();
    args.push("-i".into());
    args.push(video.to_string_lossy().to_string());
    if let Some((audio, offset_secs)) = audio {
        args.push("-itsoffset".into());
        args.push(format!("{offset_secs:.6}"));
        args.push("-i".into());
        args.push(audio.to_string_lossy().to_string());
    }
    args.extend(
        ["-c", "copy", "-movflags", "+faststart", "-t"]
            .iter()
            .map(|s| s.to_string()),
    );
    args.push(format!("{duration_secs:.6}"));
    args.push(destination.to_string_lossy().to_string());
    args
}

/// Nearest-neighbor rescale of an RGBA buffer; identity when the sizes
/// already match. The raw video pipe needs a constant frame size even when
/// a device swap changes the camera's native resolution mid-recording.
fn scale_rgba(data: &[u8], sw: u32, sh: u32, dw: u32, dh: u32) -> Vec<u8> {
    if (sw, sh) == (dw, dh) {
        return data.to_vec();
    }
    let mut out = vec![0u8; dw as usize * dh as usize * 4];
    for dy in 0..dh {
        let sy = (dy as u64 * sh as u64 / dh as u64) as u32;
        for dx in 0..dw {
            let sx = (dx as u64 * sw as u64 / dw as u64) as u32;
            let src = ((sy * sw + sx) * 4) as usize;
            let dst = ((dy * dw + dx) * 4) as usize;
            out[dst..dst + 4].copy_from_slice(&data[src..src + 4]);
        }
    }
    out
}

/// One encoder child plus the bounded feed into its stdin.
struct TrackPipe {
    sender: Option<Sender<Vec<u8>>>,
    feeder: Option<std::thread::JoinHandle<()>>,
    child: Option<Child>,
    output: PathBuf,
    failed: Arc<AtomicBool>,
    label: &'static str,
}

impl TrackPipe {
    fn spawn(
        command: &Path,
        args: Vec<String>,
        output: PathBuf,
        depth: usize,
        label: &'static str,
    ) -> Result<Self, WriterError> {
        let mut child = Command::new(command)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| WriterError::Encoder(format!("spawn {label} encoder: {e}")))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| WriterError::Encoder(format!("{label} encoder has no stdin")))?;

        let (sender, receiver) = bounded::<Vec<u8>>(depth);
        let failed = Arc::new(AtomicBool::new(false));
        let failed_feeder = failed.clone();
        let feeder = std::thread::spawn(move || {
            for chunk in receiver {
                if let Err(e) = stdin.write_all(&chunk) {
                    tracing::warn!("{label} encoder feed failed: {e}");
                    failed_feeder.store(true, Ordering::SeqCst);
                    break;
                }
            }
            // Dropping stdin here signals EOF to the encoder.
        });

        tracing::info!("{label} encoder started -> {output:?}");
        Ok(Self {
            sender: Some(sender),
            feeder: Some(feeder),
            child: Some(child),
            output,
            failed,
            label,
        })
    }

    fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    fn is_ready(&self) -> bool {
        !self.has_failed()
            && self
                .sender
                .as_ref()
                .map(|s| !s.is_full())
                .unwrap_or(false)
    }

    fn feed(&self, bytes: Vec<u8>) -> Result<(), WriterError> {
        let Some(sender) = self.sender.as_ref() else {
            return Err(WriterError::Encoder(format!("{} feed closed", self.label)));
        };
        match sender.try_send(bytes) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                // Caller should have honored is_ready; drop under pressure.
                tracing::debug!("{} queue full, sample dropped", self.label);
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(WriterError::Encoder(format!(
                "{} encoder exited early",
                self.label
            ))),
        }
    }

    /// Close the feed and wait for the encoder to finish its output file.
    fn close(mut self) -> Result<PathBuf, WriterError> {
        drop(self.sender.take());
        if let Some(feeder) = self.feeder.take() {
            let _ = feeder.join();
        }
        let Some(child) = self.child.take() else {
            return Err(WriterError::Encoder(format!("{} already closed", self.label)));
        };
        let out = child
            .wait_with_output()
            .map_err(|e| WriterError::Encoder(format!("wait for {} encoder: {e}", self.label)))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(WriterError::Encoder(format!(
                "{} encoder exited with {}: {}",
                self.label,
                out.status,
                stderr.trim()
            )));
        }
        Ok(self.output.clone())
    }

    fn kill(mut self) {
        drop(self.sender.take());
        if let Some(feeder) = self.feeder.take() {
            let _ = feeder.join();
        }
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                tracing::debug!("{} encoder already gone: {e}", self.label);
            }
            let _ = child.wait();
        }
    }
}

impl Drop for TrackPipe {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(feeder) = self.feeder.take() {
            let _ = feeder.join();
        }
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

pub struct FfmpegWriter {
    command: PathBuf,
    destination: PathBuf,
    scratch: TempDir,
    video: Option<TrackPipe>,
    audio: Option<TrackPipe>,
    video_config: Option<VideoTrackConfig>,
    session_start: Option<MediaTime>,
    first_audio_pts: Option<MediaTime>,
    error: Option<WriterError>,
}

impl FfmpegWriter {
    fn create(command: PathBuf, destination: &Path) -> Result<Self, WriterError> {
        let parent = destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        let scratch = tempfile::Builder::new()
            .prefix(".camcorder-")
            .tempdir_in(parent)
            .map_err(|e| WriterError::Create(format!("scratch dir: {e}")))?;
        Ok(Self {
            command,
            destination: destination.to_path_buf(),
            scratch,
            video: None,
            audio: None,
            video_config: None,
            session_start: None,
            first_audio_pts: None,
            error: None,
        })
    }

    fn health_error(&self) -> Option<WriterError> {
        if let Some(e) = &self.error {
            return Some(e.clone());
        }
        for pipe in [self.video.as_ref(), self.audio.as_ref()].into_iter().flatten() {
            if pipe.has_failed() {
                return Some(WriterError::Encoder(format!(
                    "{} encoder pipe broke",
                    pipe.label
                )));
            }
        }
        None
    }
}

impl ContainerWriter for FfmpegWriter {
    fn add_video_track(&mut self, config: &VideoTrackConfig) -> Result<(), WriterError> {
        if self.video.is_some() {
            return Err(WriterError::Track {
                kind: TrackKind::Video,
                reason: "track already added".into(),
            });
        }
        let output = self.scratch.path().join("video.mp4");
        let pipe = TrackPipe::spawn(
            &self.command,
            video_encode_args(config, &output),
            output,
            VIDEO_QUEUE_DEPTH,
            "video",
        )
        .map_err(|e| WriterError::Track {
            kind: TrackKind::Video,
            reason: e.to_string(),
        })?;
        self.video = Some(pipe);
        self.video_config = Some(*config);
        Ok(())
    }

    fn add_audio_track(&mut self, format: &AudioFormat) -> Result<(), WriterError> {
        if self.audio.is_some() {
            return Err(WriterError::Track {
                kind: TrackKind::Audio,
                reason: "track already added".into(),
            });
        }
        if self.session_start.is_some() {
            return Err(WriterError::Track {
                kind: TrackKind::Audio,
                reason: "session already open".into(),
            });
        }
        let output = self.scratch.path().join("audio.m4a");
        let pipe = TrackPipe::spawn(
            &self.command,
            audio_encode_args(format, &output),
            output,
            AUDIO_QUEUE_DEPTH,
            "audio",
        )
        .map_err(|e| WriterError::Track {
            kind: TrackKind::Audio,
            reason: e.to_string(),
        })?;
        self.audio = Some(pipe);
        Ok(())
    }

    fn start_session(&mut self, at: MediaTime) -> Result<(), WriterError> {
        if self.video.is_none() {
            return Err(WriterError::SessionNotOpen);
        }
        self.session_start = Some(at);
        Ok(())
    }

    fn is_ready(&self, track: TrackKind) -> bool {
        match track {
            TrackKind::Video => self.video.as_ref().map(TrackPipe::is_ready).unwrap_or(false),
            TrackKind::Audio => self.audio.as_ref().map(TrackPipe::is_ready).unwrap_or(false),
        }
    }

    fn append_video(&mut self, frame: &VideoFrame) -> Result<(), WriterError> {
        let Some(pipe) = self.video.as_ref() else {
            return Err(WriterError::SessionNotOpen);
        };
        let Some(config) = self.video_config else {
            return Err(WriterError::SessionNotOpen);
        };
        if frame.format != PixelFormat::Rgba8 {
            return Err(WriterError::Encoder(format!(
                "unexpected pixel format {:?}",
                frame.format
            )));
        }
        let bytes = scale_rgba(
            &frame.data,
            frame.width,
            frame.height,
            config.width,
            config.height,
        );
        let result = pipe.feed(bytes);
        if let Err(e) = &result {
            self.error = Some(e.clone());
        }
        result
    }

    fn append_audio(&mut self, buffer: &AudioBuffer) -> Result<(), WriterError> {
        let Some(pipe) = self.audio.as_ref() else {
            return Err(WriterError::SessionNotOpen);
        };
        if self.first_audio_pts.is_none() {
            self.first_audio_pts = Some(buffer.pts);
        }
        let mut bytes = Vec::with_capacity(buffer.samples.len() * 4);
        for sample in &buffer.samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        let result = pipe.feed(bytes);
        if let Err(e) = &result {
            self.error = Some(e.clone());
        }
        result
    }

    fn status(&self) -> WriterStatus {
        if self.health_error().is_some() {
            WriterStatus::Failed
        } else {
            WriterStatus::Writing
        }
    }

    fn error(&self) -> Option<WriterError> {
        self.health_error()
    }

    fn finish(mut self: Box<Self>, end: MediaTime) -> Result<PathBuf, WriterError> {
        let start = self.session_start.ok_or(WriterError::SessionNotOpen)?;
        if let Some(e) = self.health_error() {
            return Err(e);
        }

        let video = self.video.take().ok_or(WriterError::SessionNotOpen)?;
        let video_path = video.close()?;

        let audio_path = match self.audio.take() {
            Some(audio) => Some(audio.close()?),
            None => None,
        };

        let duration = (end.as_secs_f64() - start.as_secs_f64()).max(0.0);
        let audio_offset = self
            .first_audio_pts
            .map(|p| (p.as_secs_f64() - start.as_secs_f64()).max(0.0))
            .unwrap_or(0.0);
        let audio = audio_path.as_deref().map(|p| (p, audio_offset));

        let args = mux_args(&video_path, audio, duration, &self.destination);
        tracing::info!(
            "muxing {:.3}s recording into {:?} (audio offset {:.3}s)",
            duration,
            self.destination,
            audio_offset
        );
        let out = Command::new(&self.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| WriterError::Finalize(format!("run mux: {e}")))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(WriterError::Finalize(format!(
                "mux exited with {}: {}",
                out.status,
                stderr.trim()
            )));
        }
        Ok(self.destination.clone())
    }

    fn cancel(mut self: Box<Self>, end: MediaTime) {
        tracing::info!(
            "cancelling recording to {:?} at {:.3}s",
            self.destination,
            end.as_secs_f64()
        );
        if let Some(video) = self.video.take() {
            video.kill();
        }
        if let Some(audio) = self.audio.take() {
            audio.kill();
        }
        if let Err(e) = std::fs::remove_file(&self.destination) {
            if self.destination.exists() {
                tracing::warn!("could not remove {:?}: {e}", self.destination);
            }
        }
        // Scratch directory cleans itself up on drop.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_args_request_h264_at_target_size() {
        let config = VideoTrackConfig::default();
        let args = video_encode_args(&config, Path::new("/tmp/v.mp4"));
        let has = |flag: &str| args.iter().any(|a| a == flag);

        assert!(has("rawvideo"));
        assert!(has("rgba"));
        assert!(has("1280x720"));
        assert!(has("libx264"));
        assert!(has("yuv420p"));
        assert!(has("+faststart"));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/v.mp4"));
    }

    #[test]
    fn audio_args_carry_live_format_and_fixed_bitrate() {
        let format = AudioFormat {
            sample_rate: 44_100,
            channels: 2,
        };
        let args = audio_encode_args(&format, Path::new("/tmp/a.m4a"));
        let has = |flag: &str| args.iter().any(|a| a == flag);

        assert!(has("f32le"));
        assert!(has("44100"));
        assert!(has("aac"));
        assert!(has("64000"));
    }

    #[test]
    fn mux_args_offset_audio_and_trim_duration() {
        let args = mux_args(
            Path::new("v.mp4"),
            Some((Path::new("a.m4a"), 0.125)),
            2.5,
            Path::new("out.mp4"),
        );
        let offset_at = args.iter().position(|a| a == "-itsoffset").unwrap();
        assert_eq!(args[offset_at + 1], "0.125000");
        assert_eq!(args[offset_at + 2], "-i");
        assert_eq!(args[offset_at + 3], "a.m4a");

        let t_at = args.iter().position(|a| a == "-t").unwrap();
        assert_eq!(args[t_at + 1], "2.500000");
        assert_eq!(args.last().map(String::as_str), Some("out.mp4"));
    }

    #[test]
    fn mux_args_without_audio_have_no_offset() {
        let args = mux_args(Path::new("v.mp4"), None, 1.0, Path::new("out.mp4"));
        assert!(!args.iter().any(|a| a == "-itsoffset"));
    }

    #[test]
    fn scale_is_identity_for_matching_sizes() {
        let data: Vec<u8> = (0..16).collect();
        assert_eq!(scale_rgba(&data, 2, 2, 2, 2), data);
    }

    #[test]
    fn scale_doubles_pixels_by_nearest_neighbor() {
        // 1x1 red pixel scaled to 2x2 stays red everywhere.
        let data = vec![255, 0, 0, 255];
        let out = scale_rgba(&data, 1, 1, 2, 2);
        assert_eq!(out.len(), 16);
        for px in out.chunks(4) {
            assert_eq!(px, &[255, 0, 0, 255]);
        }
    }
}
