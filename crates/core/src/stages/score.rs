//! LLM scoring stage.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::job::{EvaluationResult, JobStore};
use crate::llm::{CompletionRequest, LlmClient};
use crate::pipeline::{ScoreSummary, StageError, Transcript};
use crate::scoring::{normalize_score, parse_model_response, Recovery};

use super::{Scorer, StageContext, StageOutput, StageResult};

/// Appended to a transcript cut to the prompt budget.
pub const TRUNCATION_NOTICE: &str = "\n\n[Transcript truncated for length.]";

/// Placeholder in the template's user prompt.
const TRANSCRIPT_PLACEHOLDER: &str = "{transcript}";

/// `[scoring]` section: sampling parameters and prompt budget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoringConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Longest transcript, in characters, placed in the prompt.
    #[serde(default = "default_transcript_max_chars")]
    pub transcript_max_chars: usize,
}

fn default_temperature() -> f32 {
    0.1
}

fn default_top_p() -> f32 {
    0.9
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_transcript_max_chars() -> usize {
    12000
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
            transcript_max_chars: default_transcript_max_chars(),
        }
    }
}

/// Fill the template's user prompt with the transcript, cut to `max_chars`
/// characters.
pub fn build_prompt(user_prompt_template: &str, transcript: &str, max_chars: usize) -> String {
    let transcript = match transcript.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}{}", &transcript[..cut], TRUNCATION_NOTICE),
        None => transcript.to_string(),
    };
    user_prompt_template.replace(TRANSCRIPT_PLACEHOLDER, &transcript)
}

/// Scores a transcript with the template's prompts and persists the
/// evaluation.
pub struct LlmScorer {
    llm: Arc<dyn LlmClient>,
    job_store: Arc<dyn JobStore>,
    config: ScoringConfig,
}

impl LlmScorer {
    pub fn new(llm: Arc<dyn LlmClient>, job_store: Arc<dyn JobStore>, config: ScoringConfig) -> Self {
        Self {
            llm,
            job_store,
            config,
        }
    }
}

fn text_field(raw: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| raw.get(*k))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[async_trait]
impl Scorer for LlmScorer {
    async fn score(&self, ctx: &StageContext, transcript: &Transcript) -> StageResult<ScoreSummary> {
        let started = Instant::now();

        let template = self
            .job_store
            .get_template(ctx.template_id)?
            .ok_or_else(|| StageError::fatal(format!("Template {} not found", ctx.template_id)))?;

        let prompt = build_prompt(
            &template.user_prompt_template,
            &transcript.text,
            self.config.transcript_max_chars,
        );
        let request = CompletionRequest::new(prompt)
            .with_system(template.system_prompt.clone())
            .with_max_tokens(self.config.max_tokens)
            .with_temperature(self.config.temperature)
            .with_top_p(self.config.top_p);

        let response = self.llm.complete(request).await?;

        let (raw, recovery) = parse_model_response(&response.text);
        match recovery {
            Recovery::Direct | Recovery::Repaired => {}
            Recovery::Partial => warn!(
                "Job {}: scoring response was malformed, recovered only some fields",
                ctx.job_id
            ),
            Recovery::Failed => warn!(
                "Job {}: no JSON recovered from scoring response ({} chars)",
                ctx.job_id,
                response.text.len()
            ),
        }

        let score = normalize_score(template.vertical, &raw);
        let duration = started.elapsed().as_secs_f64();

        let evaluation = EvaluationResult {
            job_id: ctx.job_id,
            template_id: template.id,
            overall_score: score.overall_score,
            pillar_scores: score.pillar_scores.clone(),
            compliance_flags: raw.get("compliance_flags").cloned().unwrap_or_else(|| json!({})),
            fatal_flaw_detected: score.fatal_flaw,
            fatal_flaw_type: score.fatal_flaw_type.clone(),
            summary: text_field(&raw, &["summary", "agent_summary"]),
            recommendations: raw.get("recommendations").cloned().unwrap_or_else(|| json!([])),
            sentiment_score: raw.get("sentiment_score").and_then(|v| v.as_f64()),
            raw_output: raw.clone(),
            prompt_version: template.version,
            model_used: self.llm.model().to_string(),
            processing_duration_secs: duration,
            created_at: Utc::now(),
        };
        self.job_store.save_evaluation(&evaluation)?;

        info!(
            "Job {}: scored {:.1} with template {} v{}{}",
            ctx.job_id,
            score.overall_score,
            template.name,
            template.version,
            if score.fatal_flaw { " (fatal flaw)" } else { "" }
        );

        Ok(StageOutput::new(ScoreSummary {
            overall_score: score.overall_score,
            pillar_scores: score.pillar_scores,
            fatal_flaw: score.fatal_flaw,
        })
        .with_meta("overall_score", score.overall_score)
        .with_meta("fatal_flaw", score.fatal_flaw)
        .with_meta("response_recovery", recovery.as_str())
        .with_meta("input_tokens", response.usage.input_tokens)
        .with_meta("output_tokens", response.usage.output_tokens)
        .with_meta("processing_duration_seconds", duration))
    }
}
