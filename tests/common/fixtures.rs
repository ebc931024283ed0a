use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use detectbot::{
    ClassNames, InferenceGateway, InferenceOutput, InferenceResult, Orchestrator,
    PredictionSummary,
    core::{
        StoreError,
        db::RecordStore,
        store::{ArtifactStore, ObjectArtifactStore},
    },
};
use image::{ImageBuffer, Rgb};
use tempfile::TempDir;
use uuid::Uuid;

/// Bytes the fake engine appends to the original to produce its "annotated" copy.
pub const ANNOTATION_MARKER: &[u8] = b"<boxes>";

pub const PERSON_AND_DOG: &str = "0 0.5 0.5 0.2 0.3\n16 0.1 0.1 0.05 0.05";

/// Writes a 100x100 red PNG named `name` into `dir` and returns its path.
pub fn create_test_image(dir: &Path, name: &str) -> PathBuf {
    let img = ImageBuffer::from_fn(100, 100, |_, _| Rgb([255u8, 0u8, 0u8]));
    let path = dir.join(name);
    img.save_with_format(&path, image::ImageFormat::Png)
        .expect("Failed to save test image");
    path
}

/// Artifact store that remembers every key written to it.
#[derive(Debug, Clone)]
pub struct RecordingArtifactStore {
    inner: ObjectArtifactStore,
    puts: Arc<Mutex<Vec<String>>>,
    fail_puts_with_prefix: Option<String>,
}

impl RecordingArtifactStore {
    pub fn new() -> Self {
        Self {
            inner: ObjectArtifactStore::in_memory(),
            puts: Arc::new(Mutex::new(Vec::new())),
            fail_puts_with_prefix: None,
        }
    }

    pub fn failing_puts(prefix: &str) -> Self {
        Self {
            fail_puts_with_prefix: Some(prefix.to_string()),
            ..Self::new()
        }
    }

    pub fn puts(&self) -> Vec<String> {
        self.puts.lock().unwrap().clone()
    }

    pub fn backing(&self) -> ObjectArtifactStore {
        self.inner.clone()
    }
}

impl ArtifactStore for RecordingArtifactStore {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), StoreError> {
        if let Some(prefix) = &self.fail_puts_with_prefix {
            if key.starts_with(prefix.as_str()) {
                return Err(StoreError::backend(key, "bucket is read-only"));
            }
        }
        self.puts.lock().unwrap().push(key.to_string());
        self.inner.put(key, bytes).await
    }

    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        self.inner.get(key).await
    }
}

/// Record store keeping summaries in memory.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<Vec<PredictionSummary>>,
    fail: bool,
    delay: Duration,
}

impl MemoryRecordStore {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Commits each insert only after `delay`.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn records(&self) -> Vec<PredictionSummary> {
        self.records.lock().unwrap().clone()
    }
}

impl RecordStore for MemoryRecordStore {
    async fn insert(&self, summary: &PredictionSummary) -> Result<(), StoreError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(StoreError::backend(
                summary.prediction_id.to_string(),
                "connection refused",
            ));
        }
        self.records.lock().unwrap().push(summary.clone());
        Ok(())
    }
}

/// How the fake engine answers.
#[derive(Debug, Clone)]
pub enum EngineBehavior {
    /// Annotate the image; write `labels` as the label file when given.
    Detect { labels: Option<String> },
    /// Report success without writing any artifact.
    DetectWithoutArtifacts,
    /// Write full artifacts, but under another run's directory and report that.
    StaleOutput,
    Fail { status: u16, body: String },
    Garbage,
}

/// In-process stand-in for the detection engine. Like the real engine it
/// fetches the original from the artifact store and writes its output below
/// `<runs_dir>/<prediction_id>/`.
pub struct FakeGateway {
    store: ObjectArtifactStore,
    runs_dir: PathBuf,
    behavior: EngineBehavior,
    stall_on: Option<(String, Duration)>,
    panic_on: Option<String>,
    delay: Duration,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeGateway {
    pub fn new(store: ObjectArtifactStore, runs_dir: &Path, behavior: EngineBehavior) -> Self {
        Self {
            store,
            runs_dir: runs_dir.to_path_buf(),
            behavior,
            stall_on: None,
            panic_on: None,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Hang for `stall` whenever the stored file name is `file_name`.
    pub fn stalling_on(mut self, file_name: &str, stall: Duration) -> Self {
        self.stall_on = Some((file_name.to_string(), stall));
        self
    }

    /// Panic whenever the stored file name is `file_name`.
    pub fn panicking_on(mut self, file_name: &str) -> Self {
        self.panic_on = Some(file_name.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn respond(&self, stored_key: &str, prediction_id: Uuid) -> InferenceResult {
        let file_name = stored_key.rsplit('/').next().unwrap_or(stored_key).to_string();
        if let Some((stalled, stall)) = &self.stall_on {
            if *stalled == file_name {
                tokio::time::sleep(*stall).await;
            }
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.panic_on.as_deref() == Some(file_name.as_str()) {
            panic!("engine crashed on {file_name}");
        }

        let mut output_dir = PathBuf::from(prediction_id.to_string());
        let labels = match &self.behavior {
            EngineBehavior::Fail { status, body } => {
                return InferenceResult::EngineError {
                    status: Some(*status),
                    body: body.clone(),
                };
            }
            EngineBehavior::Garbage => {
                return InferenceResult::ProtocolError {
                    reason: "expected value at line 1 column 1".to_string(),
                };
            }
            EngineBehavior::DetectWithoutArtifacts => None,
            EngineBehavior::Detect { labels } => Some(labels.clone()),
            EngineBehavior::StaleOutput => {
                output_dir = PathBuf::from(Uuid::new_v4().to_string());
                Some(Some(PERSON_AND_DOG.to_string()))
            }
        };

        if let Some(labels) = labels {
            let original = self.store.get(stored_key).await.expect("original must be stored");
            let run_dir = self.runs_dir.join(&output_dir);
            std::fs::create_dir_all(run_dir.join("labels")).unwrap();

            let mut annotated = original.to_vec();
            annotated.extend_from_slice(ANNOTATION_MARKER);
            std::fs::write(run_dir.join(&file_name), annotated).unwrap();

            if let Some(labels) = labels {
                let stem = Path::new(&file_name).file_stem().unwrap().to_owned();
                let mut labels_file = stem;
                labels_file.push(".txt");
                std::fs::write(run_dir.join("labels").join(labels_file), labels).unwrap();
            }
        }

        InferenceResult::Success(InferenceOutput { output_dir })
    }
}

impl InferenceGateway for FakeGateway {
    async fn invoke(&self, stored_key: &str, prediction_id: Uuid) -> InferenceResult {
        self.calls.lock().unwrap().push(stored_key.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = self.respond(stored_key, prediction_id).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub type TestOrchestrator = Orchestrator<RecordingArtifactStore, MemoryRecordStore, FakeGateway>;

/// Everything one pipeline test needs. Keep it alive for the test's duration.
pub struct Harness {
    pub artifacts: Arc<RecordingArtifactStore>,
    pub records: Arc<MemoryRecordStore>,
    pub gateway: Arc<FakeGateway>,
    pub orchestrator: TestOrchestrator,
    pub runs_dir: TempDir,
    pub uploads_dir: TempDir,
}

impl Harness {
    pub fn new(behavior: EngineBehavior) -> Self {
        Self::build(RecordingArtifactStore::new(), MemoryRecordStore::default(), behavior, |g| g)
    }

    pub fn build(
        artifacts: RecordingArtifactStore,
        records: MemoryRecordStore,
        behavior: EngineBehavior,
        configure: impl FnOnce(FakeGateway) -> FakeGateway,
    ) -> Self {
        let runs_dir = TempDir::new().expect("Failed to create runs dir");
        let uploads_dir = TempDir::new().expect("Failed to create uploads dir");
        let gateway = configure(FakeGateway::new(artifacts.backing(), runs_dir.path(), behavior));

        let artifacts = Arc::new(artifacts);
        let records = Arc::new(records);
        let gateway = Arc::new(gateway);
        let orchestrator = Orchestrator::new(artifacts.clone(), records.clone(), gateway.clone())
            .with_runs_dir(runs_dir.path())
            .with_classes(ClassNames::coco());

        Self {
            artifacts,
            records,
            gateway,
            orchestrator,
            runs_dir,
            uploads_dir,
        }
    }

    pub fn image(&self, name: &str) -> PathBuf {
        create_test_image(self.uploads_dir.path(), name)
    }
}

/// Serve `app` on an ephemeral local port and return the address.
pub async fn spawn_server(app: axum::Router) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test server");
    let addr = listener.local_addr().expect("Failed to read local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Test server failed");
    });
    addr
}
