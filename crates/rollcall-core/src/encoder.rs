//! Seams to the external face capability and frame source.

use crate::types::DetectedFace;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("encoder failed: {0}")]
    Failed(String),
    #[error("encoder io: {0}")]
    Io(#[from] std::io::Error),
    #[error("image encoding: {0}")]
    Image(#[from] image::ImageError),
}

/// Face detection + encoding, delegated to an external library.
///
/// Returns zero or more faces in detection order.
pub trait FaceEncoder {
    fn detect_and_encode(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, EncoderError>;
}

impl<E: FaceEncoder + ?Sized> FaceEncoder for Box<E> {
    fn detect_and_encode(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, EncoderError> {
        (**self).detect_and_encode(image)
    }
}

/// Something that yields camera frames. `None` means no frame this time
/// (read failure or device not ready); the caller just skips the tick.
pub trait FrameSource {
    fn next_frame(&mut self) -> Option<RgbImage>;

    /// The camera loop stopped; give back any streaming resources. The next
    /// `next_frame` reacquires them.
    fn release(&mut self) {}
}
