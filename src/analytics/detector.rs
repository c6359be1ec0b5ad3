use image::RgbImage;
use thiserror::Error;

use crate::geometry::BBox;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("failed to load model {path}: {reason}")]
    Model { path: String, reason: BoxError },
    #[error("inference failed: {0}")]
    Inference(BoxError),
}

/// Finds objects of a fixed class in an image.
///
/// Implementations own whatever model state they need and may be slow, but
/// must not have side effects beyond that state.
pub trait Detector: Send {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BBox>, DetectError>;
}

/// Treats the whole image as the single region of interest. Used as the
/// plate localizer when the recognizer reads plates off full vehicle crops.
#[derive(Debug, Default, Clone, Copy)]
pub struct WholeImage;

impl Detector for WholeImage {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BBox>, DetectError> {
        let (w, h) = image.dimensions();
        if w == 0 || h == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![BBox::new(0.0, 0.0, w as f32, h as f32)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_image() {
        let img = RgbImage::new(30, 20);
        assert_eq!(
            WholeImage.detect(&img).unwrap(),
            vec![BBox::new(0.0, 0.0, 30.0, 20.0)]
        );
        assert!(WholeImage.detect(&RgbImage::new(0, 0)).unwrap().is_empty());
    }
}
