pub mod config;
pub mod core;
pub mod detection;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod routing;

pub use models::{ClassNames, DetectionRecord, PredictionSummary, ReplyTarget};
pub use detection::{
    ClassCount, HttpInferenceGateway, InferenceGateway, InferenceOutput, InferenceResult,
    ParseError, parse_labels, summarize,
};
pub use pipeline::{
    Orchestrator, PipelineContext, PipelineError, PipelineErrorKind, PipelineExecutor, RunReport,
    RunStage, Submission,
};
pub use routing::{PhotoRequest, Reply, Router};
