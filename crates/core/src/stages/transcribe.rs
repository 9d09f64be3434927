//! Speech-to-text stage.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::job::{JobStore, TranscriptSegment};
use crate::pipeline::{Diarization, SpeakerSegment, Transcript};

use super::models::{CommandModel, ModelError, ModelHandle};
use super::{StageContext, StageOutput, StageResult, Transcriber};

/// Label for text no diarized speaker overlaps.
const UNKNOWN_SPEAKER: &str = "Unknown";

/// A timed text span from a speech-to-text model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimedText {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawTranscription {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub language_probability: Option<f64>,
    pub segments: Vec<TimedText>,
}

#[async_trait]
pub trait SpeechToTextModel: Send + Sync {
    async fn transcribe(&self, audio: &Path) -> Result<RawTranscription, ModelError>;
}

#[async_trait]
impl SpeechToTextModel for CommandModel {
    async fn transcribe(&self, audio: &Path) -> Result<RawTranscription, ModelError> {
        self.run_json(audio).await
    }
}

/// Attribute each text span to the first diarized speaker it overlaps.
pub fn align_speakers(texts: &[TimedText], speakers: &[SpeakerSegment]) -> Vec<TranscriptSegment> {
    texts
        .iter()
        .map(|t| {
            let speaker_label = speakers
                .iter()
                .find(|s| t.start < s.end && t.end > s.start)
                .map(|s| s.speaker_label.clone())
                .unwrap_or_else(|| UNKNOWN_SPEAKER.to_string());

            TranscriptSegment {
                speaker_label,
                start_time: t.start,
                end_time: t.end,
                text: t.text.trim().to_string(),
                confidence: t.confidence,
            }
        })
        .collect()
}

/// One `[Label] text` line per segment.
pub fn format_transcript(segments: &[TranscriptSegment]) -> String {
    segments
        .iter()
        .map(|s| format!("[{}] {}", s.speaker_label, s.text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Transcriber backed by a lazily loaded speech-to-text model.
///
/// Persists the segments, replacing those of any earlier attempt.
pub struct ModelTranscriber {
    model: Arc<ModelHandle<dyn SpeechToTextModel>>,
    job_store: Arc<dyn JobStore>,
}

impl ModelTranscriber {
    pub fn new(model: Arc<ModelHandle<dyn SpeechToTextModel>>, job_store: Arc<dyn JobStore>) -> Self {
        Self { model, job_store }
    }
}

#[async_trait]
impl Transcriber for ModelTranscriber {
    async fn transcribe(
        &self,
        ctx: &StageContext,
        diarization: &Diarization,
    ) -> StageResult<Transcript> {
        let model = self.model.get().await?;
        let raw = model.transcribe(&diarization.audio_path).await?;

        let segments = align_speakers(&raw.segments, &diarization.segments);
        self.job_store.replace_transcript(ctx.job_id, &segments)?;

        let transcript = Transcript {
            text: format_transcript(&segments),
            num_segments: segments.len(),
            language: raw.language.clone(),
        };

        Ok(StageOutput::new(transcript)
            .with_meta("num_segments", segments.len())
            .with_meta("language", raw.language)
            .with_meta("language_probability", raw.language_probability))
    }
}
