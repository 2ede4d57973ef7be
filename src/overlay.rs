//! Caption overlay: stamps a line of text over a translucent patch near the
//! bottom of each frame.
//!
//! The overlay never mutates its input; it hands back a decorated copy, or
//! `None` when there is nothing to draw (which the capture session treats as
//! passthrough). Geometry scales with the frame so the patch sits in the
//! same relative spot at every capture resolution.

use ab_glyph::{point, Font, FontVec, Glyph, PxScale, ScaleFont};
use parking_lot::Mutex;
use thiserror::Error;

use crate::media::{PixelFormat, VideoFrame};

/// Caption glyph size in pixels.
pub const CAPTION_FONT_SIZE: f32 = 17.0;

/// Patch fill, premixed gray at 40% opacity.
const PATCH_BACKGROUND: [u8; 4] = [142, 142, 147, 102];

const DEFAULT_TEXT_COLOR: [u8; 3] = [255, 255, 255];
const TEXT_INSET: f32 = 8.0;

#[derive(Debug, Clone, Error)]
pub enum OverlayError {
    #[error("font data could not be parsed")]
    InvalidFont,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PatchRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

/// Caption patch placement for a frame of the given size: anchored one
/// tenth in from the left and one tenth up from the bottom, spanning most
/// of the width at one fifteenth of the height.
fn patch_rect(frame_width: u32, frame_height: u32) -> Option<PatchRect> {
    let x = frame_width / 10;
    let y = frame_height.checked_sub(frame_height / 10)?;
    let width = frame_width.checked_sub(frame_width / 8)?;
    let height = frame_height / 15;
    if width == 0 || height == 0 || x + width > frame_width || y + height > frame_height {
        return None;
    }
    Some(PatchRect {
        x,
        y,
        width,
        height,
    })
}

/// Source-over blend of `src` (straight alpha) onto `dst`.
fn blend_px(dst: &mut [u8], src: [u8; 4]) {
    let alpha = src[3] as u32;
    let inverse = 255 - alpha;
    for c in 0..3 {
        dst[c] = ((src[c] as u32 * alpha + dst[c] as u32 * inverse) / 255) as u8;
    }
    dst[3] = 255;
}

/// Frame decorator that renders the current caption onto each frame.
pub struct TextOverlay {
    font: Option<FontVec>,
    caption: Mutex<Option<String>>,
    color: Mutex<[u8; 3]>,
}

impl TextOverlay {
    /// Background-patch-only overlay; captions need a font.
    pub fn new() -> Self {
        Self {
            font: None,
            caption: Mutex::new(None),
            color: Mutex::new(DEFAULT_TEXT_COLOR),
        }
    }

    pub fn with_font_bytes(bytes: Vec<u8>) -> Result<Self, OverlayError> {
        let font = FontVec::try_from_vec(bytes).map_err(|_| OverlayError::InvalidFont)?;
        Ok(Self {
            font: Some(font),
            caption: Mutex::new(None),
            color: Mutex::new(DEFAULT_TEXT_COLOR),
        })
    }

    /// Caption color; defaults to white.
    pub fn set_text_color(&self, rgb: [u8; 3]) {
        *self.color.lock() = rgb;
    }

    /// Text drawn on frames from now on; `None` disables the overlay.
    pub fn set_caption(&self, caption: Option<String>) {
        *self.caption.lock() = caption;
    }

    pub fn caption(&self) -> Option<String> {
        self.caption.lock().clone()
    }

    /// Adapter for [`CaptureSession::set_frame_decorator`].
    ///
    /// [`CaptureSession::set_frame_decorator`]: crate::capture::CaptureSession::set_frame_decorator
    pub fn decorator(self: &std::sync::Arc<Self>) -> crate::capture::FrameDecorator {
        let overlay = self.clone();
        std::sync::Arc::new(move |frame| overlay.apply(frame))
    }

    /// Decorate one frame. `None` means nothing to draw; the input is
    /// never touched either way.
    pub fn apply(&self, frame: &VideoFrame) -> Option<VideoFrame> {
        let caption = self.caption.lock().clone()?;
        if frame.format != PixelFormat::Rgba8 {
            return None;
        }
        let rect = patch_rect(frame.width, frame.height)?;

        let mut decorated = frame.clone();
        fill_patch(&mut decorated, rect);
        if let Some(font) = &self.font {
            draw_caption(&mut decorated, rect, font, &caption, *self.color.lock());
        }
        Some(decorated)
    }
}

impl Default for TextOverlay {
    fn default() -> Self {
        Self::new()
    }
}

fn fill_patch(frame: &mut VideoFrame, rect: PatchRect) {
    let stride = frame.width as usize * 4;
    for row in rect.y..rect.y + rect.height {
        let base = row as usize * stride + rect.x as usize * 4;
        for col in 0..rect.width as usize {
            let at = base + col * 4;
            blend_px(&mut frame.data[at..at + 4], PATCH_BACKGROUND);
        }
    }
}

fn draw_caption(
    frame: &mut VideoFrame,
    rect: PatchRect,
    font: &FontVec,
    text: &str,
    color: [u8; 3],
) {
    let scale = PxScale::from(CAPTION_FONT_SIZE);
    let scaled = font.as_scaled(scale);

    // Baseline that vertically centers the x-height band in the patch.
    let baseline = rect.y as f32 + (rect.height as f32 + scaled.ascent()) / 2.0;
    let mut caret = point(rect.x as f32 + TEXT_INSET, baseline);
    let mut previous: Option<Glyph> = None;

    for ch in text.chars() {
        let mut glyph = scaled.scaled_glyph(ch);
        if let Some(prev) = previous.take() {
            caret.x += scaled.kern(prev.id, glyph.id);
        }
        glyph.position = caret;
        caret.x += scaled.h_advance(glyph.id);
        previous = Some(glyph.clone());

        if caret.x > (rect.x + rect.width) as f32 - TEXT_INSET {
            break;
        }
        let Some(outlined) = font.outline_glyph(glyph) else {
            continue;
        };
        let bounds = outlined.px_bounds();
        outlined.draw(|gx, gy, coverage| {
            let px = bounds.min.x as i64 + gx as i64;
            let py = bounds.min.y as i64 + gy as i64;
            if px < 0 || py < 0 || px >= frame.width as i64 || py >= frame.height as i64 {
                return;
            }
            let at = (py as usize * frame.width as usize + px as usize) * 4;
            let alpha = (coverage * 255.0) as u8;
            blend_px(
                &mut frame.data[at..at + 4],
                [color[0], color[1], color[2], alpha],
            );
        });
    }
}
