//! Frame downscaling and face box drawing.

use crate::types::BoundingBox;
use ab_glyph::{FontVec, InvalidFont};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::Path;
use thiserror::Error;

/// Frames are encoded at 1/DOWNSCALE resolution for speed; detected boxes
/// are multiplied back up by the same factor.
pub const DOWNSCALE: u32 = 4;

const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const BOX_THICKNESS: u32 = 2;
const LABEL_BAR_HEIGHT: u32 = 35;
const LABEL_PADDING: i32 = 6;
const LABEL_TEXT_SCALE: f32 = 24.0;

#[derive(Error, Debug)]
pub enum FontError {
    #[error("failed to read font file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid font data: {0}")]
    Invalid(#[from] InvalidFont),
}

/// TrueType/OpenType font used for the label text under each face.
pub struct LabelFont(FontVec);

impl LabelFont {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FontError> {
        Self::from_bytes(std::fs::read(path)?)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self, FontError> {
        Ok(Self(FontVec::try_from_vec(data)?))
    }
}

/// Shrink a frame by [`DOWNSCALE`] in both dimensions.
pub fn downscale(frame: &RgbImage) -> RgbImage {
    let w = (frame.width() / DOWNSCALE).max(1);
    let h = (frame.height() / DOWNSCALE).max(1);
    imageops::resize(frame, w, h, FilterType::Triangle)
}

/// Draw a box outline around a face and a filled label bar along its bottom
/// edge carrying `label`. The box is clamped to the frame first; text is
/// only rendered when a font is available.
pub fn draw_face(frame: &mut RgbImage, face: &BoundingBox, label: &str, font: Option<&LabelFont>) {
    let Some(area) = clamp_to_frame(frame, face) else {
        return;
    };

    for inset in 0..BOX_THICKNESS {
        if let Some(edge) = inset_rect(area, inset) {
            draw_hollow_rect_mut(frame, edge, BOX_COLOR);
        }
    }

    let bar_height = LABEL_BAR_HEIGHT.min(area.height());
    let bar = Rect::at(area.left(), area.bottom() + 1 - bar_height as i32)
        .of_size(area.width(), bar_height);
    draw_filled_rect_mut(frame, bar, BOX_COLOR);

    if let Some(font) = font {
        draw_text_mut(
            frame,
            TEXT_COLOR,
            bar.left() + LABEL_PADDING,
            bar.top() + LABEL_PADDING,
            LABEL_TEXT_SCALE,
            &font.0,
            label,
        );
    }
}

/// The face box as a non-empty rectangle inside the frame, if any of it is.
fn clamp_to_frame(frame: &RgbImage, face: &BoundingBox) -> Option<Rect> {
    let left = face.left.min(frame.width());
    let right = face.right.min(frame.width());
    let top = face.top.min(frame.height());
    let bottom = face.bottom.min(frame.height());
    if right <= left || bottom <= top {
        return None;
    }
    Some(Rect::at(left as i32, top as i32).of_size(right - left, bottom - top))
}

fn inset_rect(rect: Rect, inset: u32) -> Option<Rect> {
    let (w, h) = (rect.width(), rect.height());
    if w <= 2 * inset || h <= 2 * inset {
        return None;
    }
    let i = inset as i32;
    Some(Rect::at(rect.left() + i, rect.top() + i).of_size(w - 2 * inset, h - 2 * inset))
}
