mod api;
mod metrics;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use callaudit_core::{
    create_llm_client,
    job::JobStore,
    load_config,
    pipeline::{
        FailureSentinel, PipelineCoordinator, Reconciler, StageExecutor, StagePolicies,
        TaskDispatcher, WorkDirs,
    },
    queue::{SqliteTaskQueue, TaskQueue},
    stages::{
        Collaborators, DiarizationModel, FfmpegNormalizer, LlmScorer, ModelDiarizer, ModelHandle,
        ModelTranscriber, ModelVad, SpeechToTextModel, VadModel,
    },
    validate_config, Config, FsStorage, SanitizedConfig, SqliteJobStore, Storage, WorkerPool,
};

use api::create_router;
use state::AppState;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run() -> Result<()> {
    // Determine config path
    let config_path = std::env::var("CALLAUDIT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    // Logging needs the config, so a load failure is reported afterwards
    let loaded = load_config(&config_path);
    init_logging(loaded.as_ref().map(|c| c.logging.json).unwrap_or(false));

    info!("Loading configuration from {:?}", config_path);
    let config = loaded.with_context(|| format!("Failed to load config from {:?}", config_path))?;
    validate_config(&config).context("Configuration validation failed")?;

    info!("Configuration loaded successfully");
    info!(
        "Effective configuration: {}",
        serde_json::to_string(&SanitizedConfig::from(&config)).unwrap_or_default()
    );

    // Jobs and the task queue share one database file
    let job_store: Arc<dyn JobStore> = Arc::new(
        SqliteJobStore::new(&config.database.path).context("Failed to create job store")?,
    );
    let queue: Arc<dyn TaskQueue> = Arc::new(
        SqliteTaskQueue::new(&config.database.path).context("Failed to create task queue")?,
    );
    info!("Database opened at {:?}", config.database.path);

    let storage: Arc<dyn Storage> = Arc::new(FsStorage::new(&config.storage.root));
    let work_dirs = WorkDirs::new(&config.worker.work_root);
    let policies = StagePolicies::from_config(&config.pipeline);

    let collaborators = create_collaborators(&config, storage, Arc::clone(&job_store))?;

    let coordinator = Arc::new(PipelineCoordinator::new(
        Arc::clone(&job_store),
        Arc::clone(&queue),
        work_dirs.clone(),
    ));
    let executor = Arc::new(StageExecutor::new(
        Arc::clone(&job_store),
        collaborators,
        policies.clone(),
        work_dirs.clone(),
    ));
    let sentinel = Arc::new(FailureSentinel::new(Arc::clone(&job_store), work_dirs.clone()));
    let dispatcher = Arc::new(TaskDispatcher::new(
        coordinator,
        executor,
        sentinel,
        Arc::clone(&queue),
    ));

    // Start the worker pool
    let pool = Arc::new(WorkerPool::new(
        config.worker.clone(),
        Arc::clone(&queue),
        dispatcher,
    ));
    pool.start().await;

    // Start the reconciliation sweep
    let reconciler = Arc::new(Reconciler::new(
        config.reconciler.clone(),
        Arc::clone(&job_store),
        Arc::clone(&queue),
        policies,
        work_dirs,
    ));
    reconciler.start();

    let state = Arc::new(AppState::new(
        config.clone(),
        job_store,
        queue,
        Arc::clone(&pool),
        Arc::clone(&reconciler),
    ));
    let app = create_router(state);

    // Start ops server
    let addr = SocketAddr::new(config.server.host, config.server.port);
    info!("Starting ops server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Worker shutting down...");
    reconciler.stop();
    // Waits for in-flight attempts; anything cut short is redelivered after its lease
    pool.stop().await;
    info!("Worker stopped");

    Ok(())
}

/// Register the collaborator of each stage.
///
/// Model commands are started lazily on first use, so a worker with no
/// models configured still starts; its stages fail with a load error.
fn create_collaborators(
    config: &Config,
    storage: Arc<dyn Storage>,
    job_store: Arc<dyn JobStore>,
) -> Result<Collaborators> {
    let vad_model: ModelHandle<dyn VadModel> =
        ModelHandle::from_command("vad", config.models.vad.clone(), |m| m as Arc<dyn VadModel>);
    let diarization_model: ModelHandle<dyn DiarizationModel> = ModelHandle::from_command(
        "diarization",
        config.models.diarization.clone(),
        |m| m as Arc<dyn DiarizationModel>,
    );
    let transcription_model: ModelHandle<dyn SpeechToTextModel> = ModelHandle::from_command(
        "transcription",
        config.models.transcription.clone(),
        |m| m as Arc<dyn SpeechToTextModel>,
    );

    let llm = create_llm_client(&config.llm).context("Failed to create LLM client")?;
    info!("Scoring with {} model {}", llm.provider(), llm.model());

    Ok(Collaborators {
        normalizer: Arc::new(FfmpegNormalizer::new(
            config.normalization.clone(),
            storage,
            Arc::clone(&job_store),
        )),
        speech_detector: Arc::new(ModelVad::new(Arc::new(vad_model), config.vad.clone())),
        diarizer: Arc::new(ModelDiarizer::new(Arc::new(diarization_model))),
        transcriber: Arc::new(ModelTranscriber::new(
            Arc::new(transcription_model),
            Arc::clone(&job_store),
        )),
        scorer: Arc::new(LlmScorer::new(llm, job_store, config.scoring.clone())),
    })
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
