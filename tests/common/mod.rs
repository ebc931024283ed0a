#![allow(dead_code)]

mod fixtures;
pub use fixtures::*;

// Re-export commonly used types from detectbot for tests
pub use detectbot::{
    ClassNames, DetectionRecord, PipelineError, PipelineErrorKind, PredictionSummary, ReplyTarget,
    RunReport, RunStage,
    core::store::{ArtifactStore, ObjectArtifactStore},
};
