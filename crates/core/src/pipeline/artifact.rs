//! Values handed from one stage to the next.
//!
//! Artifacts are never stored as records of their own. They travel inside the
//! stage task payload; bulky data (audio) stays in the job's working directory
//! and only its path is carried.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Audio converted to the pipeline's canonical format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedAudio {
    pub audio_path: PathBuf,
    pub duration_secs: f64,
    pub sample_rate: u32,
    pub channels: u16,
}

/// A span of detected speech, in seconds from the start of the audio.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SpeechSegment {
    pub start: f64,
    pub end: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeechActivity {
    pub audio_path: PathBuf,
    pub total_duration_secs: f64,
    pub segments: Vec<SpeechSegment>,
}

/// A span attributed to one speaker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeakerSegment {
    pub start: f64,
    pub end: f64,
    /// Role label such as `Agent` or `Customer`.
    pub speaker_label: String,
    /// Raw identifier produced by the diarization model.
    pub speaker_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Diarization {
    pub audio_path: PathBuf,
    pub segments: Vec<SpeakerSegment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transcript {
    /// One `[Label] text` line per segment.
    pub text: String,
    pub num_segments: usize,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreSummary {
    pub overall_score: f64,
    pub pillar_scores: BTreeMap<String, f64>,
    pub fatal_flaw: bool,
}

/// The payload passed along the chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Artifact {
    /// Reference to the uploaded recording; input of normalization.
    Upload { input_ref: String },
    NormalizedAudio(NormalizedAudio),
    SpeechActivity(SpeechActivity),
    Diarization(Diarization),
    Transcript(Transcript),
    Score(ScoreSummary),
}

impl Artifact {
    pub fn kind(&self) -> &'static str {
        match self {
            Artifact::Upload { .. } => "upload",
            Artifact::NormalizedAudio(_) => "normalized_audio",
            Artifact::SpeechActivity(_) => "speech_activity",
            Artifact::Diarization(_) => "diarization",
            Artifact::Transcript(_) => "transcript",
            Artifact::Score(_) => "score",
        }
    }
}
