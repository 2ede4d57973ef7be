//! Shared media sample and timestamp types.
//!
//! Every sample that moves through the pipeline carries a [`MediaTime`]
//! presentation timestamp stamped against one [`SessionClock`], so the two
//! independently-delivered streams (video frames, audio buffers) can be
//! aligned by the writer.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Rational presentation timestamp: `value / timescale` seconds.
///
/// Kept rational rather than floating point so equal times compare equal
/// regardless of which clock produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTime {
    pub value: i64,
    pub timescale: u32,
}

/// Timescale used for clock-derived timestamps (microsecond resolution).
pub const DEFAULT_TIMESCALE: u32 = 1_000_000;

impl MediaTime {
    pub const ZERO: MediaTime = MediaTime {
        value: 0,
        timescale: DEFAULT_TIMESCALE,
    };

    pub fn new(value: i64, timescale: u32) -> Self {
        debug_assert!(timescale > 0);
        Self { value, timescale }
    }

    pub fn from_duration(d: Duration) -> Self {
        Self::new(d.as_micros() as i64, DEFAULT_TIMESCALE)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Self::new((secs * DEFAULT_TIMESCALE as f64).round() as i64, DEFAULT_TIMESCALE)
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.value as f64 / self.timescale as f64
    }
}

impl PartialOrd for MediaTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MediaTime {
    fn cmp(&self, other: &Self) -> Ordering {
        // Cross-multiplied comparison; i128 avoids overflow for any
        // realistic value/timescale pair.
        let lhs = self.value as i128 * other.timescale as i128;
        let rhs = other.value as i128 * self.timescale as i128;
        lhs.cmp(&rhs)
    }
}

/// Monotonic epoch shared by every producer in one capture session.
///
/// Cloning is cheap; all clones report time against the same origin.
#[derive(Debug, Clone)]
pub struct SessionClock {
    epoch: Arc<Instant>,
}

impl SessionClock {
    pub fn start() -> Self {
        Self {
            epoch: Arc::new(Instant::now()),
        }
    }

    /// Current session time.
    pub fn now(&self) -> MediaTime {
        MediaTime::from_duration(self.epoch.elapsed())
    }
}

/// Pixel layout of uncompressed frames moving through the pipeline.
///
/// The capture outputs are configured for a single fixed format; everything
/// downstream (overlay, writer) assumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 8-bit RGBA, 4 bytes per pixel, row-major.
    Rgba8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgba8 => 4,
        }
    }
}

/// Frame orientation, applied by the capture session and stamped on every
/// delivered frame. Remembered across device swaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Orientation {
    Portrait,
    PortraitUpsideDown,
    LandscapeLeft,
    LandscapeRight,
}

impl Default for Orientation {
    fn default() -> Self {
        Self::Portrait
    }
}

/// One uncompressed video frame.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub pts: MediaTime,
    pub orientation: Orientation,
}

impl VideoFrame {
    /// Allocate a black frame, useful for fakes and transforms.
    pub fn blank(width: u32, height: u32, pts: MediaTime) -> Self {
        Self {
            data: vec![0; width as usize * height as usize * PixelFormat::Rgba8.bytes_per_pixel()],
            width,
            height,
            format: PixelFormat::Rgba8,
            pts,
            orientation: Orientation::default(),
        }
    }
}

/// Audio signal format, discovered from the live input rather than
/// configured ahead of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// One buffer of interleaved f32 audio samples.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub format: AudioFormat,
    pub pts: MediaTime,
}
