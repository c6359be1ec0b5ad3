mod source;

pub use source::{FfmpegOpener, FfmpegSource, FrameSource, SourceError, SourceOpener};

#[cfg(test)]
pub(crate) use source::testing;
