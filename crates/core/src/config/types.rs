use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::llm::{LlmConfig, LlmProvider};
use crate::pipeline::{PipelineConfig, ReconcilerConfig};
use crate::stages::{CommandModelConfig, NormalizationConfig, ScoringConfig, VadConfig};
use crate::worker::WorkerConfig;

/// Root configuration. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub normalization: NormalizationConfig,
    #[serde(default)]
    pub vad: VadConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Ops endpoint listener
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8081
}

/// Database holding job records and the task queue
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("callaudit.db")
}

/// Where uploaded recordings are read from
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("storage")
}

/// Commands serving the speech models. A stage whose model is not configured
/// fails its attempts with a load error.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ModelsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vad: Option<CommandModelConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diarization: Option<CommandModelConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcription: Option<CommandModelConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

/// Config for startup logging and the status endpoint (secrets redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub worker: WorkerConfig,
    pub pipeline: PipelineConfig,
    pub normalization: NormalizationConfig,
    pub vad: VadConfig,
    pub models: ModelsConfig,
    pub scoring: ScoringConfig,
    pub llm: SanitizedLlmConfig,
    pub reconciler: ReconcilerConfig,
    pub logging: LoggingConfig,
}

/// LLM config with the API key hidden
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedLlmConfig {
    pub provider: LlmProvider,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    pub api_key_configured: bool,
    pub timeout_secs: u64,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            server: config.server.clone(),
            database: config.database.clone(),
            storage: config.storage.clone(),
            worker: config.worker.clone(),
            pipeline: config.pipeline.clone(),
            normalization: config.normalization.clone(),
            vad: config.vad.clone(),
            models: config.models.clone(),
            scoring: config.scoring.clone(),
            llm: SanitizedLlmConfig {
                provider: config.llm.provider,
                model: config.llm.model.clone(),
                api_base: config.llm.api_base.clone(),
                api_key_configured: config
                    .llm
                    .api_key
                    .as_deref()
                    .map(|k| !k.is_empty())
                    .unwrap_or(false),
                timeout_secs: config.llm.timeout_secs,
            },
            reconciler: config.reconciler.clone(),
            logging: config.logging.clone(),
        }
    }
}
