mod feed;
mod orchestrator;

pub use feed::{AnnotatedFrame, FeedPipeline, FrameSampler, PipelineError, ProcessingUnit};
pub use orchestrator::{ActiveFeed, DetectorFactory, FeedOrchestrator, FrameSink, LatestFrames};
