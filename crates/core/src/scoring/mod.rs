//! Post-processing of the scoring model's output.
//!
//! [`parse_model_response`] salvages a JSON object from the raw response text
//! and [`normalize_score`] turns it into bounded pillar and overall scores.
//! Neither fails: a garbled response produces a low score, not a failed job.

mod normalize;
mod parse;

pub use normalize::{
    coerce_score, fatal_flaw_zeroes_score, is_truthy, normalize_score, pillars, NormalizedScore,
    Pillar,
};
pub use parse::{parse_model_response, Recovery};
