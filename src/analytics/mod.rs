mod detector;
mod object;

pub use detector::{DetectError, Detector, WholeImage};
pub use object::YoloDetector;
