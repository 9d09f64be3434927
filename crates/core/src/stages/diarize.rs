//! Speaker diarization stage.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::pipeline::{Diarization, SpeakerSegment, SpeechActivity};

use super::models::{CommandModel, ModelError, ModelHandle};
use super::{Diarizer, StageContext, StageOutput, StageResult};

/// One speaker turn as reported by a diarization model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeakerTurn {
    pub start: f64,
    pub end: f64,
    pub speaker: String,
}

#[async_trait]
pub trait DiarizationModel: Send + Sync {
    async fn speaker_turns(&self, audio: &Path) -> Result<Vec<SpeakerTurn>, ModelError>;
}

#[async_trait]
impl DiarizationModel for CommandModel {
    async fn speaker_turns(&self, audio: &Path) -> Result<Vec<SpeakerTurn>, ModelError> {
        self.run_json(audio).await
    }
}

/// Give every model speaker a role label.
///
/// The first speaker heard is the `Agent`, the second the `Customer`, and any
/// further speaker `Speaker_<n>` with `n` its order of appearance counted
/// from zero. Returns the labelled segments and the id-to-label mapping.
pub fn assign_speaker_labels(
    turns: &[SpeakerTurn],
) -> (Vec<SpeakerSegment>, BTreeMap<String, String>) {
    let mut ordered: Vec<&SpeakerTurn> = turns.iter().collect();
    ordered.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut mapping: BTreeMap<String, String> = BTreeMap::new();
    for turn in &ordered {
        if mapping.contains_key(&turn.speaker) {
            continue;
        }
        let label = match mapping.len() {
            0 => "Agent".to_string(),
            1 => "Customer".to_string(),
            n => format!("Speaker_{}", n),
        };
        mapping.insert(turn.speaker.clone(), label);
    }

    let segments = ordered
        .into_iter()
        .map(|turn| SpeakerSegment {
            start: turn.start,
            end: turn.end,
            speaker_label: mapping
                .get(&turn.speaker)
                .cloned()
                .unwrap_or_else(|| turn.speaker.clone()),
            speaker_id: turn.speaker.clone(),
        })
        .collect();

    (segments, mapping)
}

/// Diarizer backed by a lazily loaded diarization model.
pub struct ModelDiarizer {
    model: Arc<ModelHandle<dyn DiarizationModel>>,
}

impl ModelDiarizer {
    pub fn new(model: Arc<ModelHandle<dyn DiarizationModel>>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Diarizer for ModelDiarizer {
    async fn diarize(
        &self,
        _ctx: &StageContext,
        speech: &SpeechActivity,
    ) -> StageResult<Diarization> {
        let model = self.model.get().await?;
        let turns = model.speaker_turns(&speech.audio_path).await?;
        let (segments, mapping) = assign_speaker_labels(&turns);

        let num_segments = segments.len();
        let num_speakers = mapping.len();
        let mapping = serde_json::to_value(&mapping).unwrap_or_default();

        Ok(StageOutput::new(Diarization {
            audio_path: speech.audio_path.clone(),
            segments,
        })
        .with_meta("num_speakers", num_speakers)
        .with_meta("num_segments", num_segments)
        .with_meta("speaker_mapping", mapping))
    }
}
