//! Audio normalization stage (FFmpeg).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::job::JobStore;
use crate::pipeline::{NormalizedAudio, StageError};
use crate::storage::Storage;

use super::{Normalizer, StageContext, StageOutput, StageResult};

/// File name of the normalized audio inside the working directory.
pub const NORMALIZED_FILE: &str = "normalized.wav";

/// Target format of the normalization stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizationConfig {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_path: PathBuf,

    #[serde(default = "default_ffprobe")]
    pub ffprobe_path: PathBuf,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_channels")]
    pub channels: u16,

    #[serde(default = "default_codec")]
    pub codec: String,
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_channels() -> u16 {
    1
}

fn default_codec() -> String {
    "pcm_s16le".to_string()
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg(),
            ffprobe_path: default_ffprobe(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            codec: default_codec(),
        }
    }
}

/// Downloads the recording into the working directory and converts it with
/// ffmpeg. The probed duration is stored on the job.
pub struct FfmpegNormalizer {
    config: NormalizationConfig,
    storage: Arc<dyn Storage>,
    job_store: Arc<dyn JobStore>,
}

impl FfmpegNormalizer {
    pub fn new(
        config: NormalizationConfig,
        storage: Arc<dyn Storage>,
        job_store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            config,
            storage,
            job_store,
        }
    }

    fn build_args(&self, input: &Path, output: &Path) -> Vec<String> {
        vec![
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-ar".to_string(),
            self.config.sample_rate.to_string(),
            "-ac".to_string(),
            self.config.channels.to_string(),
            "-c:a".to_string(),
            self.config.codec.clone(),
            "-y".to_string(),
            output.to_string_lossy().to_string(),
        ]
    }

    async fn convert(&self, input: &Path, output: &Path) -> Result<(), StageError> {
        let args = self.build_args(input, output);
        debug!("Running ffmpeg with args: {:?}", args);

        let result = Command::new(&self.config.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StageError::retryable(format!(
                        "ffmpeg not found at {:?}",
                        self.config.ffmpeg_path
                    ))
                } else {
                    StageError::retryable(format!("Failed to run ffmpeg: {}", e))
                }
            })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(StageError::retryable(format!("FFmpeg error: {}", stderr.trim())));
        }
        Ok(())
    }

    /// Duration in seconds, or 0 when ffprobe cannot tell.
    async fn probe_duration(&self, path: &Path) -> f64 {
        let output = Command::new(&self.config.ffprobe_path)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                parse_duration(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                warn!(
                    "ffprobe failed on {:?}: {}",
                    path,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                0.0
            }
            Err(e) => {
                warn!("Failed to run ffprobe: {}", e);
                0.0
            }
        }
    }
}

/// Parse ffprobe's bare duration output.
fn parse_duration(stdout: &str) -> f64 {
    stdout
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|d| d.is_finite() && *d >= 0.0)
        .unwrap_or(0.0)
}

/// Local name of the downloaded input, keeping the key's extension.
fn input_file_name(input_ref: &str) -> String {
    let ext = Path::new(input_ref)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("wav");
    format!("input_audio.{}", ext)
}

#[async_trait]
impl Normalizer for FfmpegNormalizer {
    async fn normalize(&self, ctx: &StageContext, input_ref: &str) -> StageResult<NormalizedAudio> {
        let input_path = ctx.work_dir.join(input_file_name(input_ref));
        let output_path = ctx.work_dir.join(NORMALIZED_FILE);

        let bytes = self.storage.download_to(input_ref, &input_path).await?;
        debug!("Job {}: downloaded {} ({} bytes)", ctx.job_id, input_ref, bytes);

        let converted = self.convert(&input_path, &output_path).await;
        if let Err(e) = tokio::fs::remove_file(&input_path).await {
            debug!("Could not remove {:?}: {}", input_path, e);
        }
        converted?;

        let duration = self.probe_duration(&output_path).await;
        self.job_store.set_duration(ctx.job_id, duration as i64)?;

        info!(
            "Job {}: normalized {} ({:.1}s of audio)",
            ctx.job_id, input_ref, duration
        );

        Ok(StageOutput::new(NormalizedAudio {
            audio_path: output_path,
            duration_secs: duration,
            sample_rate: self.config.sample_rate,
            channels: self.config.channels,
        })
        .with_meta("duration_seconds", duration)
        .with_meta("sample_rate", self.config.sample_rate)
        .with_meta("channels", self.config.channels))
    }
}
