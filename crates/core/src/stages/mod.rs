//! Stage collaborators.
//!
//! Each stage is a typed transform from the previous stage's artifact to the
//! next. The implementations here orchestrate external tools and models; the
//! audio and speech algorithms themselves live outside this crate.
//!
//! All collaborators must be safe to re-invoke: a retry runs them again with
//! the same input.

mod diarize;
mod models;
mod normalize;
mod score;
mod transcribe;
mod vad;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::job::Metadata;
use crate::pipeline::{
    Artifact, Diarization, NormalizedAudio, ScoreSummary, SpeechActivity, Stage, StageError,
    Transcript,
};

pub use diarize::{assign_speaker_labels, DiarizationModel, ModelDiarizer, SpeakerTurn};
pub use models::{CommandModel, CommandModelConfig, ModelError, ModelHandle};
pub use normalize::{FfmpegNormalizer, NormalizationConfig, NORMALIZED_FILE};
pub use score::{build_prompt, LlmScorer, ScoringConfig, TRUNCATION_NOTICE};
pub use transcribe::{
    align_speakers, format_transcript, ModelTranscriber, RawTranscription, SpeechToTextModel,
    TimedText,
};
pub use vad::{detect_speech_segments, ModelVad, SpeechProbabilities, VadConfig, VadModel};

/// Job context handed to every collaborator call.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub job_id: i64,
    pub template_id: i64,
    pub work_dir: PathBuf,
    pub attempt: u32,
    pub task_id: String,
}

/// A collaborator result: the artifact plus metadata for the stage record.
#[derive(Debug, Clone)]
pub struct StageOutput<T> {
    pub value: T,
    pub metadata: Metadata,
}

impl<T> StageOutput<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            metadata: Metadata::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StageOutput<U> {
        StageOutput {
            value: f(self.value),
            metadata: self.metadata,
        }
    }
}

pub type StageResult<T> = Result<StageOutput<T>, StageError>;

/// Converts the uploaded recording to the canonical audio format.
#[async_trait]
pub trait Normalizer: Send + Sync {
    async fn normalize(&self, ctx: &StageContext, input_ref: &str) -> StageResult<NormalizedAudio>;
}

/// Finds the spans of the audio that contain speech.
#[async_trait]
pub trait SpeechDetector: Send + Sync {
    async fn detect(&self, ctx: &StageContext, audio: &NormalizedAudio)
        -> StageResult<SpeechActivity>;
}

/// Attributes speech to speakers.
#[async_trait]
pub trait Diarizer: Send + Sync {
    async fn diarize(&self, ctx: &StageContext, speech: &SpeechActivity)
        -> StageResult<Diarization>;
}

/// Produces a speaker-attributed transcript.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, ctx: &StageContext, diarization: &Diarization)
        -> StageResult<Transcript>;
}

/// Scores a transcript against the job's template.
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, ctx: &StageContext, transcript: &Transcript)
        -> StageResult<ScoreSummary>;
}

/// The collaborator bound to each stage, registered once at worker startup.
#[derive(Clone)]
pub struct Collaborators {
    pub normalizer: Arc<dyn Normalizer>,
    pub speech_detector: Arc<dyn SpeechDetector>,
    pub diarizer: Arc<dyn Diarizer>,
    pub transcriber: Arc<dyn Transcriber>,
    pub scorer: Arc<dyn Scorer>,
}

impl Collaborators {
    /// Run the collaborator of `stage` on `input`.
    ///
    /// An input of the wrong kind is a fatal error: retrying the same payload
    /// cannot fix it.
    pub async fn invoke(
        &self,
        stage: Stage,
        ctx: &StageContext,
        input: &Artifact,
    ) -> StageResult<Artifact> {
        match (stage, input) {
            (Stage::Normalization, Artifact::Upload { input_ref }) => self
                .normalizer
                .normalize(ctx, input_ref)
                .await
                .map(|o| o.map(Artifact::NormalizedAudio)),
            (Stage::Vad, Artifact::NormalizedAudio(audio)) => self
                .speech_detector
                .detect(ctx, audio)
                .await
                .map(|o| o.map(Artifact::SpeechActivity)),
            (Stage::Diarization, Artifact::SpeechActivity(speech)) => self
                .diarizer
                .diarize(ctx, speech)
                .await
                .map(|o| o.map(Artifact::Diarization)),
            (Stage::Transcription, Artifact::Diarization(diarization)) => self
                .transcriber
                .transcribe(ctx, diarization)
                .await
                .map(|o| o.map(Artifact::Transcript)),
            (Stage::Scoring, Artifact::Transcript(transcript)) => self
                .scorer
                .score(ctx, transcript)
                .await
                .map(|o| o.map(Artifact::Score)),
            (stage, other) => Err(StageError::fatal(format!(
                "{} stage cannot consume a {} artifact",
                stage,
                other.kind()
            ))),
        }
    }
}
