use std::{any::Any, path::PathBuf, sync::Arc};

use tokio::{
    sync::Semaphore,
    task::{JoinError, JoinHandle},
};
use tracing::{debug, error};
use uuid::Uuid;

use crate::{
    core::{db::RecordStore, store::ArtifactStore},
    detection::InferenceGateway,
    models::ReplyTarget,
};

use super::{Orchestrator, PipelineError, PipelineErrorKind, RunReport, StageTracker};

/// A staged photo waiting for its run.
#[derive(Debug, Clone)]
pub struct Submission {
    pub local_path: PathBuf,
    pub reply_target: ReplyTarget,
}

impl Submission {
    pub fn new(local_path: impl Into<PathBuf>, reply_target: ReplyTarget) -> Self {
        Self {
            local_path: local_path.into(),
            reply_target,
        }
    }
}

/// Runs independent submissions concurrently, at most `concurrency` at a time.
pub struct PipelineExecutor<A, R, G> {
    orchestrator: Orchestrator<A, R, G>,
    permits: Arc<Semaphore>,
    concurrency: usize,
}

impl<A, R, G> PipelineExecutor<A, R, G>
where
    A: ArtifactStore,
    R: RecordStore,
    G: InferenceGateway,
{
    /// A `concurrency` of zero is treated as one.
    pub fn new(orchestrator: Orchestrator<A, R, G>, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            orchestrator,
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Spawn one run. It starts as soon as a slot is free.
    pub fn submit(&self, submission: Submission) -> PendingRun {
        let orchestrator = self.orchestrator.clone();
        let permits = self.permits.clone();
        let prediction_id = Uuid::new_v4();
        let tracker = Arc::new(StageTracker::default());
        let task_tracker = tracker.clone();
        let handle = tokio::spawn(async move {
            // the semaphore is never closed
            let _permit = permits.acquire_owned().await.ok();
            debug!(path = ?submission.local_path, "slot acquired");
            orchestrator
                .process_tracked(
                    prediction_id,
                    &submission.local_path,
                    &submission.reply_target,
                    &task_tracker,
                )
                .await
        });
        PendingRun {
            prediction_id,
            tracker,
            handle,
        }
    }

    /// Run every submission and return one outcome per submission, in
    /// submission order. A run that panics fails alone as
    /// [`PipelineErrorKind::Aborted`].
    pub async fn execute(&self, submissions: Vec<Submission>) -> Vec<Result<RunReport, PipelineError>> {
        let pending: Vec<_> = submissions
            .into_iter()
            .map(|submission| self.submit(submission))
            .collect();

        let mut results = Vec::with_capacity(pending.len());
        for run in pending {
            results.push(run.join().await);
        }
        results
    }
}

/// A spawned run.
pub struct PendingRun {
    prediction_id: Uuid,
    tracker: Arc<StageTracker>,
    handle: JoinHandle<Result<RunReport, PipelineError>>,
}

impl PendingRun {
    pub fn prediction_id(&self) -> Uuid {
        self.prediction_id
    }

    /// Wait for the run. A panicked or cancelled task is reported as
    /// `Aborted` at the last stage it reached.
    pub async fn join(self) -> Result<RunReport, PipelineError> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) => {
                let stage = self.tracker.get();
                let reason = abort_reason(err);
                error!(prediction_id = %self.prediction_id, %stage, %reason, "run aborted");
                Err(PipelineError {
                    prediction_id: self.prediction_id,
                    stage,
                    kind: PipelineErrorKind::Aborted { reason },
                })
            }
        }
    }
}

fn abort_reason(err: JoinError) -> String {
    if err.is_cancelled() {
        return "task was cancelled".to_string();
    }
    match err.try_into_panic() {
        Ok(payload) => panic_message(payload.as_ref()),
        Err(err) => err.to_string(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}
