use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docvision_core::defaults::POOL_METRICS_INTERVAL_SECS;
use docvision_core::{
    ArchiveClient, BackendLifecycle, BackendStateStore, EmbeddingBackend, IntakeEvent, JobStatus,
    JobStore, PipelineConfig, VectorStore, VisionBackend, VramProbe,
};
use docvision_daemon::{PaperlessArchive, ScanWatcher, TagPoller};
use docvision_db::{log_pool_metrics, Database, MemoryStore, PoolConfig};
use docvision_inference::{DockerLifecycle, NvidiaSmiProbe, OllamaEmbedder, OllamaVisionBackend};
use docvision_pipeline::{
    FingerprintStore, InferenceRouter, Orchestrator, PipelineComponents, Preprocessor,
    ResourceGovernor,
};

#[derive(Parser)]
#[command(name = "docvision", version, about = "Vision pipeline for scanned documents")]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true, env = "DOCVISION_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon: scan watcher, tag poller, and pipeline
    Run,
    /// Process one file and print the resulting job as JSON
    Process {
        /// Scan to process (PDF, PNG, JPEG, or TIFF)
        file: PathBuf,
    },
    /// Print the most recently updated jobs as JSON
    Jobs {
        /// Maximum number of jobs to print
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

/// Persistence collaborators for one run mode.
struct Stores {
    jobs: Arc<dyn JobStore>,
    vectors: Arc<dyn VectorStore>,
    backends: Arc<dyn BackendStateStore>,
}

impl Stores {
    fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            jobs: store.clone(),
            vectors: store.clone(),
            backends: store,
        }
    }

    fn postgres(db: &Database) -> Self {
        Self {
            jobs: Arc::new(db.jobs.clone()),
            vectors: Arc::new(db.vectors.clone()),
            backends: Arc::new(db.backends.clone()),
        }
    }
}

fn build_orchestrator(
    config: &PipelineConfig,
    stores: &Stores,
    archive: Arc<dyn ArchiveClient>,
) -> Orchestrator {
    let ollama = &config.ollama;
    let vision = |url: &str| -> Arc<dyn VisionBackend> {
        Arc::new(
            OllamaVisionBackend::new(url, ollama.vision_model.clone())
                .with_temperature(ollama.temperature)
                .with_timeout(config.retry.inference_timeout_secs),
        )
    };

    let probe: Option<Arc<dyn VramProbe>> = if config.governor.gpu_enabled {
        Some(Arc::new(NvidiaSmiProbe::new()))
    } else {
        None
    };
    let gpu = config.governor.gpu_enabled.then(|| vision(&ollama.gpu_url));
    let lifecycle: Arc<dyn BackendLifecycle> = Arc::new(DockerLifecycle::new(
        ollama.cpu_container.clone(),
        ollama.cpu_url.clone(),
    ));
    let governor = ResourceGovernor::new(
        config.governor.clone(),
        probe,
        lifecycle,
        stores.backends.clone(),
    );

    let mut fingerprints = FingerprintStore::new(stores.vectors.clone(), config.dedup.clone());
    if ollama.embeddings_enabled {
        let embedder: Arc<dyn EmbeddingBackend> = Arc::new(OllamaEmbedder::new(
            ollama.gpu_url.clone(),
            ollama.embed_model.clone(),
        ));
        fingerprints = fingerprints.with_embedder(embedder);
    }

    let router = InferenceRouter::new(
        gpu,
        vision(&ollama.cpu_url),
        governor.clone(),
        config.retry.clone(),
        ollama.prompt.clone(),
    );

    Orchestrator::new(
        config,
        PipelineComponents {
            jobs: stores.jobs.clone(),
            archive,
            preprocessor: Preprocessor::new(config.preprocess.clone()),
            fingerprints,
            governor,
            router,
        },
    )
}

async fn connect(config: &PipelineConfig, command: &str) -> anyhow::Result<Database> {
    let database_url = config
        .database_url
        .as_deref()
        .with_context(|| format!("DATABASE_URL is required for `docvision {command}`"))?;
    let db =
        Database::connect_with_config(database_url, PoolConfig::for_governor(&config.governor))
            .await?;
    db.migrate().await?;
    info!("Database ready");
    Ok(db)
}

/// Log pool usage every `interval` until `cancel`.
async fn monitor_pool(db: Database, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                log_pool_metrics(db.pool());
            }
        }
    }
}

async fn run(config: PipelineConfig) -> anyhow::Result<()> {
    let db = connect(&config, "run").await?;

    let stores = Stores::postgres(&db);
    let archive = Arc::new(PaperlessArchive::new(&config.archive, config.tags.clone())?);
    let orchestrator = build_orchestrator(&config, &stores, archive.clone());

    orchestrator.recover().await?;
    let pipeline = orchestrator.start();
    let cancel = CancellationToken::new();
    let mut tasks = vec![tokio::spawn(monitor_pool(
        db.clone(),
        Duration::from_secs(POOL_METRICS_INTERVAL_SECS),
        cancel.child_token(),
    ))];

    match &config.intake.scan_dir {
        Some(scan_dir) => {
            let watcher = ScanWatcher::new(scan_dir, stores.jobs.clone(), pipeline.intake())
                .with_consume_dir(config.intake.consume_dir.clone())
                .with_interval(Duration::from_secs(config.intake.scan_poll_interval_secs));
            tasks.push(tokio::spawn(watcher.run(cancel.child_token())));
        }
        None => warn!("SCAN_DIR not set, scan intake disabled"),
    }
    if config.intake.tag_poll_enabled {
        let poller = TagPoller::new(archive, config.tags.reprocess.clone(), pipeline.intake())
            .with_interval(Duration::from_secs(config.intake.tag_poll_interval_secs));
        tasks.push(tokio::spawn(poller.run(cancel.child_token())));
    }

    info!("docvision running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = ?e, "Background task panicked");
        }
    }
    pipeline.shutdown().await;
    Ok(())
}

async fn jobs(config: PipelineConfig, limit: i64) -> anyhow::Result<()> {
    let db = connect(&config, "jobs").await?;
    let jobs = db.jobs.list_recent(limit).await?;
    println!("{}", serde_json::to_string_pretty(&jobs)?);
    Ok(())
}

async fn process(config: PipelineConfig, file: &Path) -> anyhow::Result<()> {
    let path = file
        .canonicalize()
        .with_context(|| format!("cannot open {}", file.display()))?;
    let stores = Stores::in_memory();
    let archive = Arc::new(PaperlessArchive::new(&config.archive, config.tags.clone())?);
    let orchestrator = build_orchestrator(&config, &stores, archive);
    orchestrator.governor().restore().await?;

    let job = orchestrator
        .process(IntakeEvent::NewScan { path })
        .await?
        .context("file was not accepted for processing")?;
    println!("{}", serde_json::to_string_pretty(&job)?);

    if job.status == JobStatus::Failed {
        anyhow::bail!(
            "processing failed: {}",
            job.error.map(|e| e.message).unwrap_or_default()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, daily rotation)
    //   RUST_LOG    - standard env filter
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "docvision=info,docvision_pipeline=info,docvision_daemon=info".into()
    });
    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let path = Path::new(path);
        let dir = path.parent().unwrap_or(Path::new("."));
        let name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("docvision.log");
        let (writer, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                .init();
        } else {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false),
                )
                .init();
        }
        Some(guard)
    } else {
        // stderr keeps stdout clean for `process` output
        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        } else {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
        None
    };

    let cli = Cli::parse();
    let config = PipelineConfig::load(cli.config.as_deref())?;
    info!(
        log_format = %log_format,
        gpu_enabled = config.governor.gpu_enabled,
        dedup_enabled = config.dedup.enabled,
        "Configuration loaded"
    );

    match cli.command {
        Command::Run => run(config).await,
        Command::Process { file } => process(config, &file).await,
        Command::Jobs { limit } => jobs(config, limit).await,
    }
}
