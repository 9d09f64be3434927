//! Worker-local model cache and the external-command model runner.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::metrics::MODEL_LOADS;
use crate::pipeline::StageError;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelError {
    #[error("failed to load model {name}: {reason}")]
    Load { name: String, reason: String },

    #[error("model {name} failed: {reason}")]
    Inference { name: String, reason: String },

    #[error("model {name} returned invalid output: {reason}")]
    InvalidOutput { name: String, reason: String },
}

impl From<ModelError> for StageError {
    fn from(e: ModelError) -> Self {
        // Loads and inference runs are flaky (GPU memory, downloads); try again
        StageError::retryable(e.to_string())
    }
}

type Loader<M> = Box<dyn Fn() -> BoxFuture<'static, Result<Arc<M>, ModelError>> + Send + Sync>;

/// A heavy model constructed at most once per worker, on first use.
///
/// A failed load is not cached: the next call tries again.
pub struct ModelHandle<M: ?Sized> {
    name: String,
    cell: OnceCell<Arc<M>>,
    loader: Loader<M>,
}

impl<M: ?Sized + Send + Sync + 'static> ModelHandle<M> {
    pub fn new<F, Fut>(name: impl Into<String>, loader: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<M>, ModelError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            cell: OnceCell::new(),
            loader: Box::new(move || loader().boxed()),
        }
    }

    /// A handle whose model is already loaded.
    pub fn preloaded(name: impl Into<String>, model: Arc<M>) -> Self {
        let name = name.into();
        let missing = name.clone();
        Self {
            name,
            cell: OnceCell::new_with(Some(model)),
            loader: Box::new(move || {
                let name = missing.clone();
                async move {
                    Err(ModelError::Load {
                        name,
                        reason: "no loader configured".to_string(),
                    })
                }
                .boxed()
            }),
        }
    }

    /// A handle that starts `config` as a [`CommandModel`] on first use.
    ///
    /// Without a config every load fails, and so does every attempt of the
    /// stage using it.
    pub fn from_command(
        name: impl Into<String>,
        config: Option<CommandModelConfig>,
        upcast: fn(Arc<CommandModel>) -> Arc<M>,
    ) -> Self {
        let name = name.into();
        let model_name = name.clone();
        Self::new(name, move || {
            let name = model_name.clone();
            let config = config.clone();
            async move {
                let config = config.ok_or_else(|| ModelError::Load {
                    name: name.clone(),
                    reason: "no command configured".to_string(),
                })?;
                let model = CommandModel::new(name, config);
                model.probe().await?;
                Ok(upcast(Arc::new(model)))
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }

    /// The model, loading it first if needed.
    pub async fn get(&self) -> Result<Arc<M>, ModelError> {
        let model = self
            .cell
            .get_or_try_init(|| async {
                info!("Loading model {}", self.name);
                let started = Instant::now();
                match (self.loader)().await {
                    Ok(model) => {
                        MODEL_LOADS.with_label_values(&[self.name.as_str(), "ok"]).inc();
                        info!("Loaded model {} in {:?}", self.name, started.elapsed());
                        Ok(model)
                    }
                    Err(e) => {
                        MODEL_LOADS.with_label_values(&[self.name.as_str(), "error"]).inc();
                        warn!("{}", e);
                        Err(e)
                    }
                }
            })
            .await?;
        Ok(Arc::clone(model))
    }
}

/// How to run a model as an external process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandModelConfig {
    pub command: PathBuf,
    /// Arguments placed before the audio path.
    #[serde(default)]
    pub args: Vec<String>,
}

/// A model served by an external command that takes an audio path as its
/// last argument and prints JSON on stdout.
#[derive(Debug, Clone)]
pub struct CommandModel {
    name: String,
    config: CommandModelConfig,
}

impl CommandModel {
    pub fn new(name: impl Into<String>, config: CommandModelConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check the command can be started. Used as the model "load".
    pub async fn probe(&self) -> Result<(), ModelError> {
        let path = &self.config.command;
        let usable = if path.components().count() > 1 {
            tokio::fs::metadata(path).await.is_ok()
        } else {
            // Bare program names are resolved through PATH at spawn time
            true
        };
        if !usable {
            return Err(ModelError::Load {
                name: self.name.clone(),
                reason: format!("command {:?} not found", path),
            });
        }
        Ok(())
    }

    /// Run the command on `audio` and parse its stdout.
    pub async fn run_json<T: DeserializeOwned>(&self, audio: &Path) -> Result<T, ModelError> {
        debug!("Running model {} on {:?}", self.name, audio);

        // Dropping the future (hard time limit) kills the process
        let output = Command::new(&self.config.command)
            .args(&self.config.args)
            .arg(audio)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ModelError::Inference {
                name: self.name.clone(),
                reason: format!("failed to start {:?}: {}", self.config.command, e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ModelError::Inference {
                name: self.name.clone(),
                reason: format!(
                    "exited with {:?}: {}",
                    output.status.code(),
                    stderr.trim()
                ),
            });
        }

        serde_json::from_slice(&output.stdout).map_err(|e| ModelError::InvalidOutput {
            name: self.name.clone(),
            reason: e.to_string(),
        })
    }
}
