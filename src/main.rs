use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::Parser;
use tracing::{error, info};

use detectbot::{
    Orchestrator, PhotoRequest, PipelineExecutor, Reply, ReplyTarget, Router, Submission,
    config::{Settings, SettingsArgs},
    core::{db::SqliteRecordStore, store::ObjectArtifactStore},
    detection::HttpInferenceGateway,
    logging,
    routing::{self, FilterKind, ImageFilter, ObjectDetectionCapabilities, RequestKind},
};

#[derive(Parser)]
#[command(name = "detectbot")]
#[command(about = "Submit photos to the object detection pipeline and print the replies")]
struct Cli {
    /// Paths to staged photos
    #[arg(value_name = "IMAGE", required = true)]
    images: Vec<PathBuf>,

    /// Chat the replies belong to
    #[arg(long, default_value = "cli")]
    reply_target: String,

    /// Caption sent along with the photos
    #[arg(long)]
    caption: Option<String>,

    /// TOML configuration file
    #[arg(short, long, env = "DETECTBOT_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(flatten)]
    settings: SettingsArgs,
}

/// Pixel filters live in a separate service; this binary only routes to them.
struct NoLocalFilters;

impl ImageFilter for NoLocalFilters {
    async fn apply_filter(&self, kind: FilterKind, local_path: &Path) -> anyhow::Result<PathBuf> {
        anyhow::bail!(
            "filter {} is not available here (image {})",
            kind.name(),
            local_path.display()
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    logging::init(args.verbose)?;

    let settings = args.settings.apply(Settings::load(args.config.as_deref())?);
    settings.validate()?;

    let artifacts = ObjectArtifactStore::from_url(&settings.artifact_store_url()?)?;
    let records = SqliteRecordStore::new(&settings.database).await?;
    let gateway =
        HttpInferenceGateway::new(settings.inference_endpoint_url()?, settings.request_timeout())?;
    info!(
        endpoint = %gateway.endpoint(),
        store = %settings.artifact_store,
        concurrency = settings.concurrency,
        "pipeline ready"
    );

    let records = Arc::new(records);
    let orchestrator = Orchestrator::new(Arc::new(artifacts), records.clone(), Arc::new(gateway))
        .with_runs_dir(settings.runs_dir.clone())
        .with_classes(settings.class_names()?)
        .with_run_timeout(settings.run_timeout());

    let reply_target = ReplyTarget::new(args.reply_target);

    if let RequestKind::Filter(_) = routing::classify(args.caption.as_deref()) {
        let router = Router::new(ObjectDetectionCapabilities, NoLocalFilters, orchestrator);
        for image in args.images {
            let request = PhotoRequest {
                local_path: image.clone(),
                caption: args.caption.clone(),
                reply_target: reply_target.clone(),
            };
            print_reply(&image, &router.handle(&request).await);
        }
    } else {
        let executor = PipelineExecutor::new(orchestrator, settings.concurrency);
        let submissions: Vec<Submission> = args
            .images
            .iter()
            .map(|image| Submission::new(image, reply_target.clone()))
            .collect();
        let results = executor.execute(submissions).await;

        for (image, result) in args.images.iter().zip(results) {
            let reply = match result {
                Ok(report) => Reply::Text(report.reply),
                Err(err) => {
                    error!(
                        prediction_id = %err.prediction_id,
                        stage = %err.stage,
                        error = %err.kind,
                        "detection failed"
                    );
                    Reply::Text(routing::apology(&err).to_string())
                }
            };
            print_reply(image, &reply);
        }
    }

    records.close().await?;
    Ok(())
}

fn print_reply(image: &Path, reply: &Reply) {
    println!("=== {} ===", image.display());
    match reply {
        Reply::Text(text) => println!("{text}"),
        Reply::Image(path) => println!("[image] {}", path.display()),
    }
}
