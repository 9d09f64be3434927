//! Testing utilities and mock implementations for pipeline tests.
//!
//! The mocks stand in for the audio models and the LLM so that whole chains
//! can run against a real SQLite store without any external tooling.
//!
//! # Example
//!
//! ```rust,ignore
//! use callaudit_core::testing::{MockBehavior, MockLlmClient, MockStages};
//!
//! let stages = MockStages::new();
//! stages.set_behavior(Stage::Diarization, MockBehavior::FailTimes(1));
//!
//! let llm = MockLlmClient::new();
//! llm.push_response(r#"{"cmp_score": 90}"#);
//!
//! // Hand stages.collaborators() to a StageExecutor...
//! ```

mod mock_llm;
mod mock_stages;

pub use mock_llm::MockLlmClient;
pub use mock_stages::{MockBehavior, MockStages, RecordedInvocation};

/// Test fixtures and helper functions.
pub mod fixtures {
    use crate::job::{ScoringTemplate, Vertical};
    use crate::pipeline::SubmitJobRequest;

    /// Create an active scoring template with a minimal prompt.
    pub fn sample_template(id: i64, vertical: Vertical) -> ScoringTemplate {
        ScoringTemplate {
            id,
            name: format!("{} QA v1", vertical),
            vertical,
            system_prompt: "You are a call quality auditor. Reply with JSON only.".to_string(),
            user_prompt_template: "Score this call:\n\n{transcript}\n\nReturn a JSON object."
                .to_string(),
            version: 1,
            is_active: true,
        }
    }

    /// Create a submission for a recording uploaded as `input_ref`.
    pub fn submit_request(template_id: i64, input_ref: &str) -> SubmitJobRequest {
        SubmitJobRequest {
            user_id: 1,
            template_id,
            input_ref: input_ref.to_string(),
            original_filename: Some(
                input_ref
                    .rsplit('/')
                    .next()
                    .unwrap_or(input_ref)
                    .to_string(),
            ),
            batch_id: None,
        }
    }

    /// A model reply for a Collections call where the agent broke compliance.
    pub fn collections_violation_response() -> &'static str {
        r#"{
  "cmp_score": 40,
  "neg_score": 85,
  "ptp_score": 90,
  "amt_score": 70,
  "compliance_violation": true,
  "fatal_flaw_type": "threatened legal action",
  "summary": "Agent secured a promise but used threatening language."
}"#
    }

    /// A clean model reply for a Sales call. Its weighted score is 79.5.
    pub fn sales_response() -> &'static str {
        r#"{
  "cqs_score": 80,
  "ecs_score": 70,
  "phs_score": 90,
  "dis_score": 100,
  "ros_score": 60,
  "summary": "Well handled sale.",
  "sentiment_score": 0.4
}"#
    }
}
