//! The five-stage processing chain.
//!
//! Normalization, VAD, diarization, transcription and scoring run strictly in
//! that order, one queued task per stage attempt. Every attempt goes through
//! the same [`StageExecutor`] wrapper, which records it, enforces the soft
//! time limit and applies the retry policy. Chains that end without the
//! executor getting a say (hard timeouts, panics) are closed by the
//! [`FailureSentinel`]; whatever both miss is closed by the [`Reconciler`].

mod artifact;
mod config;
mod coordinator;
mod dispatcher;
mod executor;
mod reconciler;
mod sentinel;
mod stage;
mod types;
mod workdir;

pub use artifact::{
    Artifact, Diarization, NormalizedAudio, ScoreSummary, SpeakerSegment, SpeechActivity,
    SpeechSegment, Transcript,
};
pub use config::{PipelineConfig, StageSettings, StageSettingsTable};
pub use coordinator::{ChainHandle, PipelineCoordinator, SubmitJobRequest};
pub use dispatcher::TaskDispatcher;
pub use executor::StageExecutor;
pub use reconciler::{Reconciler, ReconcilerConfig, SweepReport};
pub use sentinel::{FailureSentinel, SentinelReport};
pub use stage::{
    describe_limit, Stage, StageLimits, StagePolicies, StagePolicy, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_RETRY_DELAY, DIARIZATION_HARD_LIMIT, DIARIZATION_SOFT_LIMIT, SCORING_HARD_LIMIT,
    SCORING_RETRY_DELAY, SCORING_SOFT_LIMIT, TRANSCRIPTION_HARD_LIMIT, TRANSCRIPTION_SOFT_LIMIT,
};
pub use types::{
    ChainContext, CoordinatorError, DispatchError, ExecutorError, StageError, StageOutcome,
    StageTask,
};
pub use workdir::WorkDirs;
