//! Detection submission pipeline.
//!
//! One run takes a locally staged photo through
//! `Staged → Uploaded → Inferred → Reconciled → Parsed → Persisted → Completed`.
//! Any step can fail; the run then stops and reports the last stage it
//! reached. Nothing is retried and nothing already uploaded is rolled back.

pub mod executor;

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use time::OffsetDateTime;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::{
    core::{
        BoxError, StoreError,
        db::RecordStore,
        store::{AnnotatedKey, ArtifactStore, OriginalKey},
    },
    detection::{ClassCount, InferenceGateway, InferenceResult, ParseError, parse_labels, summarize},
    models::{ClassNames, PredictionSummary, ReplyTarget},
};

pub use executor::{PendingRun, PipelineExecutor, Submission};

/// Directory the engine writes label files into, below its output directory.
pub const LABELS_DIR_NAME: &str = "labels";

/// Progress of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunStage {
    Staged,
    Uploaded,
    Inferred,
    Reconciled,
    Parsed,
    Persisted,
    Completed,
}

impl RunStage {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RunStage::Staged,
            1 => RunStage::Uploaded,
            2 => RunStage::Inferred,
            3 => RunStage::Reconciled,
            4 => RunStage::Parsed,
            5 => RunStage::Persisted,
            _ => RunStage::Completed,
        }
    }
}

impl std::fmt::Display for RunStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunStage::Staged => "staged",
            RunStage::Uploaded => "uploaded",
            RunStage::Inferred => "inferred",
            RunStage::Reconciled => "reconciled",
            RunStage::Parsed => "parsed",
            RunStage::Persisted => "persisted",
            RunStage::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Stage shared between a running run and whoever times it out or joins it.
#[derive(Debug, Default)]
pub(crate) struct StageTracker(AtomicU8);

impl StageTracker {
    pub(crate) fn set(&self, stage: RunStage) {
        self.0.store(stage as u8, Ordering::Release);
    }

    pub(crate) fn get(&self) -> RunStage {
        RunStage::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Error for the current stage, logged once here.
    pub(crate) fn fail(&self, prediction_id: Uuid, kind: PipelineErrorKind) -> PipelineError {
        let stage = self.get();
        warn!(%stage, error = %kind, "run failed");
        PipelineError {
            prediction_id,
            stage,
            kind,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineErrorKind {
    #[error("cannot stage {path:?}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: BoxError,
    },
    #[error("upload of original image failed: {0}")]
    Upload(#[source] StoreError),
    #[error("inference engine failed (status {status:?}): {body}")]
    InferenceEngine { status: Option<u16>, body: String },
    #[error("inference engine response not understood: {reason}")]
    InferenceProtocol { reason: String },
    #[error("publishing annotated image failed: {source}")]
    Reconciliation {
        #[source]
        source: BoxError,
    },
    #[error("label file {path:?} is malformed: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ParseError,
    },
    #[error("persisting prediction summary failed: {0}")]
    Persistence(#[source] StoreError),
    #[error("run did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("run aborted: {reason}")]
    Aborted { reason: String },
}

/// A failed run: which run, how far it got, and why it stopped.
#[derive(Debug, thiserror::Error)]
#[error("prediction {prediction_id} failed after stage {stage}: {kind}")]
pub struct PipelineError {
    pub prediction_id: Uuid,
    pub stage: RunStage,
    pub kind: PipelineErrorKind,
}

/// Everything a caller needs to answer the user.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub summary: PredictionSummary,
    pub counts: ClassCount,
    pub reply: String,
}

/// Settings shared by every run of an orchestrator
#[derive(Debug, Clone)]
pub struct PipelineContext {
    /// Base for relative output directories reported by the engine.
    pub runs_dir: PathBuf,
    pub classes: ClassNames,
    pub run_timeout: Option<Duration>,
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self {
            runs_dir: PathBuf::from("."),
            classes: ClassNames::default(),
            run_timeout: None,
        }
    }
}

/// Drives one submission end to end. Cheap to clone; clones share collaborators.
pub struct Orchestrator<A, R, G> {
    artifacts: Arc<A>,
    records: Arc<R>,
    gateway: Arc<G>,
    context: Arc<PipelineContext>,
}

impl<A, R, G> Clone for Orchestrator<A, R, G> {
    fn clone(&self) -> Self {
        Self {
            artifacts: self.artifacts.clone(),
            records: self.records.clone(),
            gateway: self.gateway.clone(),
            context: self.context.clone(),
        }
    }
}

impl<A, R, G> Orchestrator<A, R, G>
where
    A: ArtifactStore,
    R: RecordStore,
    G: InferenceGateway,
{
    pub fn new(artifacts: Arc<A>, records: Arc<R>, gateway: Arc<G>) -> Self {
        Self {
            artifacts,
            records,
            gateway,
            context: Arc::new(PipelineContext::default()),
        }
    }

    pub fn with_runs_dir(mut self, runs_dir: impl Into<PathBuf>) -> Self {
        Arc::make_mut(&mut self.context).runs_dir = runs_dir.into();
        self
    }

    pub fn with_classes(mut self, classes: ClassNames) -> Self {
        Arc::make_mut(&mut self.context).classes = classes;
        self
    }

    pub fn with_run_timeout(mut self, run_timeout: Duration) -> Self {
        Arc::make_mut(&mut self.context).run_timeout = Some(run_timeout);
        self
    }

    /// Run the pipeline for one staged photo under a fresh prediction id.
    pub async fn process(
        &self,
        local_image_path: &Path,
        reply_target: &ReplyTarget,
    ) -> Result<RunReport, PipelineError> {
        let tracker = StageTracker::default();
        self.process_tracked(Uuid::new_v4(), local_image_path, reply_target, &tracker)
            .await
    }

    /// The run timeout covers everything up to the parsed summary. Once the
    /// insert has been issued the run is allowed to finish, so a timed-out run
    /// never leaves a persisted record behind.
    pub(crate) async fn process_tracked(
        &self,
        prediction_id: Uuid,
        local_image_path: &Path,
        reply_target: &ReplyTarget,
        tracker: &StageTracker,
    ) -> Result<RunReport, PipelineError> {
        let span = info_span!("prediction", %prediction_id, reply_target = %reply_target);

        let prepare = self
            .prepare(prediction_id, local_image_path, reply_target, tracker)
            .instrument(span.clone());
        let summary = match self.context.run_timeout {
            None => prepare.await?,
            Some(limit) => match tokio::time::timeout(limit, prepare).await {
                Ok(result) => result?,
                Err(_) => {
                    let stage = tracker.get();
                    span.in_scope(|| warn!(%stage, ?limit, "run timed out"));
                    return Err(PipelineError {
                        prediction_id,
                        stage,
                        kind: PipelineErrorKind::TimedOut(limit),
                    });
                }
            },
        };

        self.persist(summary, tracker).instrument(span).await
    }

    /// Upload, infer, publish and parse. Everything before persistence.
    async fn prepare(
        &self,
        prediction_id: Uuid,
        local_image_path: &Path,
        reply_target: &ReplyTarget,
        tracker: &StageTracker,
    ) -> Result<PredictionSummary, PipelineError> {
        let fail = |kind| tracker.fail(prediction_id, kind);

        info!(path = ?local_image_path, "start processing");
        tracker.set(RunStage::Staged);

        let (file_name, bytes) = stage_local_file(local_image_path).await.map_err(|source| {
            fail(PipelineErrorKind::Staging {
                path: local_image_path.to_path_buf(),
                source,
            })
        })?;

        let original_key = OriginalKey::new(reply_target.as_str(), Uuid::new_v4(), &file_name);
        self.artifacts
            .put(original_key.as_str(), bytes)
            .await
            .map_err(|err| fail(PipelineErrorKind::Upload(err)))?;
        tracker.set(RunStage::Uploaded);
        debug!(key = %original_key, "original uploaded");

        let output = match self.gateway.invoke(original_key.as_str(), prediction_id).await {
            InferenceResult::Success(output) => output,
            InferenceResult::EngineError { status, body } => {
                return Err(fail(PipelineErrorKind::InferenceEngine { status, body }));
            }
            InferenceResult::ProtocolError { reason } => {
                return Err(fail(PipelineErrorKind::InferenceProtocol { reason }));
            }
        };
        let output_dir = self
            .resolve_output_dir(&output.output_dir, prediction_id)
            .map_err(|reason| fail(PipelineErrorKind::InferenceProtocol { reason }))?;
        tracker.set(RunStage::Inferred);
        debug!(output_dir = ?output_dir, "inference done");

        let annotated_key = original_key.annotated();
        self.publish_annotated(&output_dir, &original_key, &annotated_key)
            .await
            .map_err(|source| fail(PipelineErrorKind::Reconciliation { source }))?;
        tracker.set(RunStage::Reconciled);
        debug!(key = %annotated_key, "annotated image published");

        let labels_path = labels_path(&output_dir, original_key.file_name());
        let raw_labels = read_labels(&labels_path)
            .await
            .map_err(|source| fail(PipelineErrorKind::Reconciliation { source }))?;
        if raw_labels.is_none() {
            debug!(path = ?labels_path, "no label file, nothing detected");
        }
        let detections = parse_labels(raw_labels.as_deref(), &self.context.classes).map_err(
            |source| {
                fail(PipelineErrorKind::Parse {
                    path: labels_path.clone(),
                    source,
                })
            },
        )?;
        tracker.set(RunStage::Parsed);

        Ok(PredictionSummary {
            prediction_id,
            original_image_path: original_key.as_str().to_string(),
            annotated_image_path: annotated_key.as_str().to_string(),
            detections,
            created_at: OffsetDateTime::now_utc(),
        })
    }

    async fn persist(
        &self,
        summary: PredictionSummary,
        tracker: &StageTracker,
    ) -> Result<RunReport, PipelineError> {
        self.records
            .insert(&summary)
            .await
            .map_err(|err| tracker.fail(summary.prediction_id, PipelineErrorKind::Persistence(err)))?;
        tracker.set(RunStage::Persisted);

        let (counts, reply) = summarize(&summary.detections);
        tracker.set(RunStage::Completed);
        info!(detections = summary.detections.len(), "done");

        Ok(RunReport {
            summary,
            counts,
            reply,
        })
    }

    /// Engine output directory, resolved against `runs_dir`. The engine keys its runs by
    /// prediction id, so the last segment must be this run's id.
    fn resolve_output_dir(&self, output_dir: &Path, prediction_id: Uuid) -> Result<PathBuf, String> {
        let expected = prediction_id.to_string();
        if output_dir.file_name().and_then(|name| name.to_str()) != Some(expected.as_str()) {
            return Err(format!(
                "output_dir {} does not belong to prediction {expected}",
                output_dir.display()
            ));
        }
        if output_dir.is_absolute() {
            Ok(output_dir.to_path_buf())
        } else {
            Ok(self.context.runs_dir.join(output_dir))
        }
    }

    /// Upload the engine's annotated image under its own key. The original's
    /// key is never written here.
    async fn publish_annotated(
        &self,
        output_dir: &Path,
        original_key: &OriginalKey,
        annotated_key: &AnnotatedKey,
    ) -> Result<(), BoxError> {
        let local = output_dir.join(original_key.file_name());
        let bytes = tokio::fs::read(&local)
            .await
            .map_err(|err| format!("cannot read annotated image {}: {err}", local.display()))?;
        self.artifacts
            .put(annotated_key.as_str(), Bytes::from(bytes))
            .await?;
        Ok(())
    }
}

async fn stage_local_file(path: &Path) -> Result<(String, Bytes), BoxError> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or("path has no UTF-8 file name")?
        .to_string();
    let bytes = tokio::fs::read(path).await?;
    image::guess_format(&bytes)?;
    Ok((file_name, Bytes::from(bytes)))
}

/// `<output_dir>/labels/<file_stem>.txt`
pub fn labels_path(output_dir: &Path, file_name: &str) -> PathBuf {
    let stem = Path::new(file_name)
        .file_stem()
        .map(|stem| stem.to_os_string())
        .unwrap_or_else(|| file_name.into());
    let mut labels_file = stem;
    labels_file.push(".txt");
    output_dir.join(LABELS_DIR_NAME).join(labels_file)
}

/// Label file contents, `None` if the engine wrote no label file.
async fn read_labels(path: &Path) -> Result<Option<String>, BoxError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(format!("cannot read label file {}: {err}", path.display()).into()),
    }
}
