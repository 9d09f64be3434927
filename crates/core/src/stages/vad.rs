//! Voice activity detection stage.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::pipeline::{NormalizedAudio, SpeechActivity, SpeechSegment};

use super::models::{CommandModel, ModelError, ModelHandle};
use super::{SpeechDetector, StageContext, StageOutput, StageResult};

/// Segmentation parameters applied to the model's per-window probabilities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VadConfig {
    /// Windows with a probability above this count as speech.
    #[serde(default = "default_threshold")]
    pub confidence_threshold: f64,

    /// Padding added on both sides of every segment.
    #[serde(default = "default_hangover")]
    pub hangover_ms: u64,

    /// Speech windows closer than this are merged into one segment.
    #[serde(default = "default_merge_gap")]
    pub merge_gap_ms: u64,

    /// Window length used when the model does not report one.
    #[serde(default = "default_window")]
    pub window_ms: u64,
}

fn default_threshold() -> f64 {
    0.5
}

fn default_hangover() -> u64 {
    250
}

fn default_merge_gap() -> u64 {
    500
}

fn default_window() -> u64 {
    32 // 512 samples at 16 kHz
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_threshold(),
            hangover_ms: default_hangover(),
            merge_gap_ms: default_merge_gap(),
            window_ms: default_window(),
        }
    }
}

/// Raw output of a VAD model: one speech probability per fixed window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeechProbabilities {
    #[serde(default)]
    pub window_ms: Option<u64>,
    pub probabilities: Vec<f64>,
}

#[async_trait]
pub trait VadModel: Send + Sync {
    async fn speech_probabilities(&self, audio: &Path) -> Result<SpeechProbabilities, ModelError>;
}

#[async_trait]
impl VadModel for CommandModel {
    async fn speech_probabilities(&self, audio: &Path) -> Result<SpeechProbabilities, ModelError> {
        self.run_json(audio).await
    }
}

/// Turn per-window probabilities into padded speech segments.
///
/// Adjacent speech windows separated by less than the merge gap become one
/// segment (keeping the confidence of its first window). Padding is clamped
/// to `[0, total_duration]`.
pub fn detect_speech_segments(
    probabilities: &[f64],
    window_secs: f64,
    total_duration: f64,
    config: &VadConfig,
) -> Vec<SpeechSegment> {
    let merge_gap = config.merge_gap_ms as f64 / 1000.0;
    let mut segments: Vec<SpeechSegment> = Vec::new();

    for (i, &p) in probabilities.iter().enumerate() {
        if p <= config.confidence_threshold {
            continue;
        }
        let start = i as f64 * window_secs;
        let end = start + window_secs;

        match segments.last_mut() {
            Some(last) if start - last.end < merge_gap => last.end = end,
            _ => segments.push(SpeechSegment {
                start,
                end,
                confidence: p,
            }),
        }
    }

    let hangover = config.hangover_ms as f64 / 1000.0;
    segments
        .into_iter()
        .map(|s| SpeechSegment {
            start: (s.start - hangover).max(0.0),
            end: (s.end + hangover).min(total_duration),
            confidence: s.confidence,
        })
        .collect()
}

/// Speech detector backed by a lazily loaded VAD model.
pub struct ModelVad {
    model: Arc<ModelHandle<dyn VadModel>>,
    config: VadConfig,
}

impl ModelVad {
    pub fn new(model: Arc<ModelHandle<dyn VadModel>>, config: VadConfig) -> Self {
        Self { model, config }
    }
}

#[async_trait]
impl SpeechDetector for ModelVad {
    async fn detect(
        &self,
        ctx: &StageContext,
        audio: &NormalizedAudio,
    ) -> StageResult<SpeechActivity> {
        let model = self.model.get().await?;
        let output = model.speech_probabilities(&audio.audio_path).await?;

        let window_ms = output.window_ms.unwrap_or(self.config.window_ms);
        let window_secs = window_ms as f64 / 1000.0;
        let total_duration = if audio.duration_secs > 0.0 {
            audio.duration_secs
        } else {
            output.probabilities.len() as f64 * window_secs
        };

        let segments =
            detect_speech_segments(&output.probabilities, window_secs, total_duration, &self.config);
        let speech_duration: f64 = segments.iter().map(|s| s.end - s.start).sum();
        let speech_ratio = if total_duration > 0.0 {
            speech_duration / total_duration
        } else {
            0.0
        };

        debug!(
            "Job {}: {} speech segments, speech ratio {:.2}",
            ctx.job_id,
            segments.len(),
            speech_ratio
        );

        let num_segments = segments.len();
        Ok(StageOutput::new(SpeechActivity {
            audio_path: audio.audio_path.clone(),
            total_duration_secs: total_duration,
            segments,
        })
        .with_meta("num_segments", num_segments)
        .with_meta("speech_ratio", speech_ratio)
        .with_meta("total_duration", total_duration)
        .with_meta("speech_duration", speech_duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config() -> VadConfig {
        VadConfig::default()
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let segments = detect_speech_segments(&[0.5, 0.51], 1.0, 10.0, &config());
        assert_eq!(segments.len(), 1);
        // Second window, padded by 250ms on both sides
        assert_eq!(segments[0].start, 0.75);
        assert_eq!(segments[0].end, 2.25);
        assert_eq!(segments[0].confidence, 0.51);
    }

    #[test]
    fn test_close_windows_are_merged() {
        let mut probs = vec![0.0; 20];
        probs[0] = 0.9;
        probs[1] = 0.8;
        // 0.2s after the previous window ends: merged
        probs[4] = 0.7;
        // 1.4s after: a new segment
        probs[19] = 0.95;

        let segments = detect_speech_segments(&probs, 0.1, 2.0, &config());
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].confidence, 0.9);
        assert_eq!(segments[0].start, 0.0);
        assert!((segments[0].end - 0.75).abs() < 1e-9);
        assert_eq!(segments[1].confidence, 0.95);
        assert!((segments[1].start - 1.65).abs() < 1e-9);
        // Clamped to the audio length
        assert_eq!(segments[1].end, 2.0);
    }

    #[test]
    fn test_silence_yields_no_segments() {
        assert!(detect_speech_segments(&[0.1, 0.2, 0.0], 0.032, 0.096, &config()).is_empty());
    }

    struct FixedVad(Vec<f64>);

    #[async_trait]
    impl VadModel for FixedVad {
        async fn speech_probabilities(&self, _audio: &Path) -> Result<SpeechProbabilities, ModelError> {
            Ok(SpeechProbabilities {
                window_ms: Some(1000),
                probabilities: self.0.clone(),
            })
        }
    }

    #[tokio::test]
    async fn test_detector_reports_speech_ratio() {
        let model: Arc<ModelHandle<dyn VadModel>> = Arc::new(ModelHandle::preloaded(
            "vad",
            Arc::new(FixedVad(vec![0.9, 0.0, 0.0, 0.0])) as Arc<dyn VadModel>,
        ));
        let vad = ModelVad::new(
            model,
            VadConfig {
                hangover_ms: 0,
                ..VadConfig::default()
            },
        );
        let ctx = StageContext {
            job_id: 1,
            template_id: 1,
            work_dir: PathBuf::from("/tmp"),
            attempt: 1,
            task_id: "t".to_string(),
        };
        let audio = NormalizedAudio {
            audio_path: PathBuf::from("/tmp/normalized.wav"),
            duration_secs: 4.0,
            sample_rate: 16000,
            channels: 1,
        };

        let out = vad.detect(&ctx, &audio).await.unwrap();
        assert_eq!(out.value.segments.len(), 1);
        assert_eq!(out.metadata["num_segments"], 1);
        assert_eq!(out.metadata["speech_ratio"], 0.25);
    }
}
