//! Mock stage collaborators for testing.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::pipeline::{
    Diarization, NormalizedAudio, ScoreSummary, SpeakerSegment, SpeechActivity, SpeechSegment,
    Stage, StageError, Transcript,
};
use crate::stages::{
    Collaborators, Diarizer, Normalizer, Scorer, SpeechDetector, StageContext, StageOutput,
    StageResult, Transcriber,
};

/// How a mocked stage reacts when invoked.
#[derive(Debug, Clone, PartialEq)]
pub enum MockBehavior {
    /// Return a plausible artifact.
    Succeed,
    /// Fail every invocation with a retryable error.
    FailRetryable(String),
    /// Fail every invocation with a fatal error.
    FailFatal(String),
    /// Sleep this long, then succeed.
    Hang(Duration),
    /// Fail the first `n` invocations with a retryable error, then succeed.
    FailTimes(u32),
    /// Panic with this message.
    Panic(String),
}

/// A recorded collaborator call for test assertions.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedInvocation {
    pub stage: Stage,
    pub job_id: i64,
    pub attempt: u32,
    pub task_id: String,
}

#[derive(Debug)]
struct MockState {
    behaviors: RwLock<HashMap<Stage, MockBehavior>>,
    invocations: RwLock<Vec<RecordedInvocation>>,
    score: RwLock<ScoreSummary>,
}

/// Mock implementation of all five stage collaborators.
///
/// Every stage succeeds with a small canned artifact unless told otherwise:
/// - Configure per-stage behavior (failures, hangs, panics)
/// - Count and inspect invocations
/// - Choose the score returned by the scoring stage
///
/// # Example
///
/// ```rust,ignore
/// use callaudit_core::testing::{MockBehavior, MockStages};
///
/// let mocks = MockStages::new();
/// mocks.set_behavior(Stage::Normalization, MockBehavior::FailTimes(1));
///
/// let executor = StageExecutor::new(store, mocks.collaborators(), policies, work_dirs);
/// // ...
/// assert_eq!(mocks.invocations(Stage::Normalization), 2);
/// ```
#[derive(Debug, Clone)]
pub struct MockStages {
    state: Arc<MockState>,
}

impl Default for MockStages {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStages {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState {
                behaviors: RwLock::new(HashMap::new()),
                invocations: RwLock::new(Vec::new()),
                score: RwLock::new(ScoreSummary {
                    overall_score: 75.0,
                    pillar_scores: BTreeMap::from([("CQS".to_string(), 75.0)]),
                    fatal_flaw: false,
                }),
            }),
        }
    }

    /// The collaborator table backed by this mock.
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            normalizer: Arc::new(self.clone()),
            speech_detector: Arc::new(self.clone()),
            diarizer: Arc::new(self.clone()),
            transcriber: Arc::new(self.clone()),
            scorer: Arc::new(self.clone()),
        }
    }

    pub fn set_behavior(&self, stage: Stage, behavior: MockBehavior) {
        self.state
            .behaviors
            .write()
            .unwrap()
            .insert(stage, behavior);
    }

    /// Set the result of the scoring stage.
    pub fn set_score(&self, score: ScoreSummary) {
        *self.state.score.write().unwrap() = score;
    }

    /// Number of times `stage` was invoked.
    pub fn invocations(&self, stage: Stage) -> usize {
        self.state
            .invocations
            .read()
            .unwrap()
            .iter()
            .filter(|i| i.stage == stage)
            .count()
    }

    /// All invocations, in call order.
    pub fn recorded_invocations(&self) -> Vec<RecordedInvocation> {
        self.state.invocations.read().unwrap().clone()
    }

    /// Record the call and apply the configured behavior.
    async fn run(&self, stage: Stage, ctx: &StageContext) -> Result<(), StageError> {
        let count = {
            let mut invocations = self.state.invocations.write().unwrap();
            invocations.push(RecordedInvocation {
                stage,
                job_id: ctx.job_id,
                attempt: ctx.attempt,
                task_id: ctx.task_id.clone(),
            });
            invocations.iter().filter(|i| i.stage == stage).count() as u32
        };

        let behavior = self
            .state
            .behaviors
            .read()
            .unwrap()
            .get(&stage)
            .cloned()
            .unwrap_or(MockBehavior::Succeed);

        match behavior {
            MockBehavior::Succeed => Ok(()),
            MockBehavior::FailRetryable(message) => Err(StageError::retryable(message)),
            MockBehavior::FailFatal(message) => Err(StageError::fatal(message)),
            MockBehavior::Hang(duration) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
            MockBehavior::FailTimes(n) if count <= n => Err(StageError::retryable(format!(
                "{} failure {} of {}",
                stage, count, n
            ))),
            MockBehavior::FailTimes(_) => Ok(()),
            MockBehavior::Panic(message) => panic!("{}", message),
        }
    }
}

#[async_trait]
impl Normalizer for MockStages {
    async fn normalize(&self, ctx: &StageContext, _input_ref: &str) -> StageResult<NormalizedAudio> {
        self.run(Stage::Normalization, ctx).await?;
        Ok(StageOutput::new(NormalizedAudio {
            audio_path: ctx.work_dir.join("normalized.wav"),
            duration_secs: 60.0,
            sample_rate: 16000,
            channels: 1,
        })
        .with_meta("duration_seconds", 60.0))
    }
}

#[async_trait]
impl SpeechDetector for MockStages {
    async fn detect(
        &self,
        ctx: &StageContext,
        audio: &NormalizedAudio,
    ) -> StageResult<SpeechActivity> {
        self.run(Stage::Vad, ctx).await?;
        Ok(StageOutput::new(SpeechActivity {
            audio_path: audio.audio_path.clone(),
            total_duration_secs: audio.duration_secs,
            segments: vec![SpeechSegment {
                start: 0.5,
                end: audio.duration_secs,
                confidence: 0.9,
            }],
        })
        .with_meta("num_segments", 1))
    }
}

#[async_trait]
impl Diarizer for MockStages {
    async fn diarize(
        &self,
        ctx: &StageContext,
        speech: &SpeechActivity,
    ) -> StageResult<Diarization> {
        self.run(Stage::Diarization, ctx).await?;
        let half = speech.total_duration_secs / 2.0;
        Ok(StageOutput::new(Diarization {
            audio_path: speech.audio_path.clone(),
            segments: vec![
                SpeakerSegment {
                    start: 0.0,
                    end: half,
                    speaker_label: "Agent".to_string(),
                    speaker_id: "SPEAKER_00".to_string(),
                },
                SpeakerSegment {
                    start: half,
                    end: speech.total_duration_secs,
                    speaker_label: "Customer".to_string(),
                    speaker_id: "SPEAKER_01".to_string(),
                },
            ],
        })
        .with_meta("num_speakers", 2))
    }
}

#[async_trait]
impl Transcriber for MockStages {
    async fn transcribe(
        &self,
        ctx: &StageContext,
        diarization: &Diarization,
    ) -> StageResult<Transcript> {
        self.run(Stage::Transcription, ctx).await?;
        let text = diarization
            .segments
            .iter()
            .map(|s| format!("[{}] Hello from {}", s.speaker_label, s.speaker_id))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(StageOutput::new(Transcript {
            text,
            num_segments: diarization.segments.len(),
            language: Some("en".to_string()),
        })
        .with_meta("language", "en"))
    }
}

#[async_trait]
impl Scorer for MockStages {
    async fn score(&self, ctx: &StageContext, _transcript: &Transcript) -> StageResult<ScoreSummary> {
        self.run(Stage::Scoring, ctx).await?;
        let score = self.state.score.read().unwrap().clone();
        Ok(StageOutput::new(score.clone()).with_meta("overall_score", score.overall_score))
    }
}
