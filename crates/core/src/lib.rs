pub mod config;
pub mod job;
pub mod llm;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod scoring;
mod sqlite;
pub mod stages;
pub mod storage;
pub mod testing;
pub mod worker;

pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, SanitizedConfig,
};
pub use job::{
    Job, JobError, JobStatus, JobStore, ScoringTemplate, SqliteJobStore, StageName, StageRecord,
    StageStatus, Vertical,
};
pub use llm::{create_llm_client, LlmClient, LlmConfig, LlmError};
pub use pipeline::{
    FailureSentinel, PipelineCoordinator, Reconciler, Stage, StageExecutor, StagePolicies,
    SubmitJobRequest, TaskDispatcher, WorkDirs,
};
pub use queue::{SqliteTaskQueue, TaskPayload};
pub use stages::Collaborators;
pub use storage::{FsStorage, Storage};
pub use worker::{WorkerConfig, WorkerPool};
