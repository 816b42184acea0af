pub mod processor;
pub mod stats;

pub use processor::{FramePipeline, FrameProducer, PipelineOptions, PipelineState, StreamSession};
pub use stats::PipelineStats;
