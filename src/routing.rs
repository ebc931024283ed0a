//! Front door for submitted photos.
//!
//! A caption either names a local filter (handled by an external
//! [`ImageFilter`]) or the photo goes to the detection pipeline. Which of
//! those a bot answers is decided by its [`Capabilities`], not by subclassing.

use std::{
    future::Future,
    path::{Path, PathBuf},
};

use tracing::{error, info};

use crate::{
    core::{db::RecordStore, store::ArtifactStore},
    detection::InferenceGateway,
    models::ReplyTarget,
    pipeline::{Orchestrator, PipelineError, PipelineErrorKind},
};

/// Local transforms the filter collaborator knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterKind {
    Rotate,
    Blur,
    Contour,
    Segment,
    SaltNPepper,
}

impl FilterKind {
    pub const ALL: [FilterKind; 5] = [
        FilterKind::Rotate,
        FilterKind::Blur,
        FilterKind::Contour,
        FilterKind::Segment,
        FilterKind::SaltNPepper,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FilterKind::Rotate => "rotate",
            FilterKind::Blur => "blur",
            FilterKind::Contour => "contour",
            FilterKind::Segment => "segment",
            FilterKind::SaltNPepper => "salt_n_pepper",
        }
    }

    fn keywords(self) -> &'static [&'static str] {
        match self {
            FilterKind::Rotate => &["rotate"],
            FilterKind::Blur => &["blur"],
            FilterKind::Contour => &["contour"],
            FilterKind::Segment => &["segment"],
            FilterKind::SaltNPepper => &["salt_n_pepper", "salt n pepper"],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Filter(FilterKind),
    Detection,
}

/// Classify a photo by its caption. Filter keywords win in [`FilterKind::ALL`]
/// order; anything else, including no caption, is a detection request.
pub fn classify(caption: Option<&str>) -> RequestKind {
    let caption = caption.unwrap_or_default().to_lowercase();
    FilterKind::ALL
        .into_iter()
        .find(|kind| kind.keywords().iter().any(|kw| caption.contains(kw)))
        .map(RequestKind::Filter)
        .unwrap_or(RequestKind::Detection)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotVariant {
    Echo,
    Quote,
    ObjectDetection,
}

/// What kinds of photo requests a bot variant answers.
pub trait Capabilities: Send + Sync {
    fn variant(&self) -> BotVariant;

    fn is_filter_request(&self, caption: Option<&str>) -> bool {
        matches!(classify(caption), RequestKind::Filter(_))
    }

    fn is_detection_request(&self, caption: Option<&str>) -> bool {
        classify(caption) == RequestKind::Detection
    }
}

/// Filters and detection, the full image-processing bot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectDetectionCapabilities;

impl Capabilities for ObjectDetectionCapabilities {
    fn variant(&self) -> BotVariant {
        BotVariant::ObjectDetection
    }
}

/// Text-only variants; they never process photos.
#[derive(Debug, Clone, Copy)]
pub struct TextOnlyCapabilities(pub BotVariant);

impl Capabilities for TextOnlyCapabilities {
    fn variant(&self) -> BotVariant {
        self.0
    }

    fn is_filter_request(&self, _caption: Option<&str>) -> bool {
        false
    }

    fn is_detection_request(&self, _caption: Option<&str>) -> bool {
        false
    }
}

/// External pixel-level filter implementation.
pub trait ImageFilter: Send + Sync + 'static {
    /// Apply `kind` to the image at `local_path`, returning the new file.
    fn apply_filter(
        &self,
        kind: FilterKind,
        local_path: &Path,
    ) -> impl Future<Output = anyhow::Result<PathBuf>> + Send;
}

/// A photo handed over by the chat transport.
#[derive(Debug, Clone)]
pub struct PhotoRequest {
    pub local_path: PathBuf,
    pub caption: Option<String>,
    pub reply_target: ReplyTarget,
}

/// What the chat transport should send back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    Image(PathBuf),
}

pub const UNSUPPORTED_REPLY: &str = "Sorry, I can't process photos. Type /help for available commands.";
pub const FILTER_FAILED_REPLY: &str = "Sorry, I couldn't apply that filter to your photo.";
pub const DETECTION_FAILED_REPLY: &str = "Sorry, something went wrong while detecting objects in your photo. Please try again.";
pub const DETECTION_UNAVAILABLE_REPLY: &str = "Sorry, the object detection service is unavailable right now. Please try again later.";

pub struct Router<C, F, A, R, G> {
    capabilities: C,
    filters: F,
    orchestrator: Orchestrator<A, R, G>,
}

impl<C, F, A, R, G> Router<C, F, A, R, G>
where
    C: Capabilities,
    F: ImageFilter,
    A: ArtifactStore,
    R: RecordStore,
    G: InferenceGateway,
{
    pub fn new(capabilities: C, filters: F, orchestrator: Orchestrator<A, R, G>) -> Self {
        Self {
            capabilities,
            filters,
            orchestrator,
        }
    }

    pub fn variant(&self) -> BotVariant {
        self.capabilities.variant()
    }

    pub async fn handle(&self, request: &PhotoRequest) -> Reply {
        let caption = request.caption.as_deref();

        if self.capabilities.is_filter_request(caption) {
            let RequestKind::Filter(kind) = classify(caption) else {
                return Reply::Text(UNSUPPORTED_REPLY.to_string());
            };
            info!(filter = kind.name(), reply_target = %request.reply_target, "applying filter");
            return match self.filters.apply_filter(kind, &request.local_path).await {
                Ok(path) => Reply::Image(path),
                Err(err) => {
                    error!(filter = kind.name(), error = %format!("{err:#}"), "filter failed");
                    Reply::Text(FILTER_FAILED_REPLY.to_string())
                }
            };
        }

        if self.capabilities.is_detection_request(caption) {
            return match self
                .orchestrator
                .process(&request.local_path, &request.reply_target)
                .await
            {
                Ok(report) => Reply::Text(report.reply),
                Err(err) => {
                    error!(
                        prediction_id = %err.prediction_id,
                        stage = %err.stage,
                        error = %err.kind,
                        "detection failed"
                    );
                    Reply::Text(apology(&err).to_string())
                }
            };
        }

        Reply::Text(UNSUPPORTED_REPLY.to_string())
    }
}

/// User-facing message for a failed run.
pub fn apology(err: &PipelineError) -> &'static str {
    match err.kind {
        PipelineErrorKind::InferenceEngine { .. }
        | PipelineErrorKind::InferenceProtocol { .. }
        | PipelineErrorKind::TimedOut(_) => DETECTION_UNAVAILABLE_REPLY,
        _ => DETECTION_FAILED_REPLY,
    }
}
