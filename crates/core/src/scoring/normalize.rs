//! Mapping a raw model evaluation to bounded pillar and overall scores.
//!
//! Everything here is pure and total: any JSON value yields a score in
//! `[0, 100]`.

use std::collections::BTreeMap;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::job::Vertical;

/// One weighted pillar of a vertical.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pillar {
    /// Short code used as the key of the pillar score.
    pub code: &'static str,
    pub weight: f64,
    /// Field names the model may use for this pillar, in lookup order.
    pub keys: &'static [&'static str],
}

const SALES: &[Pillar] = &[
    Pillar {
        code: "CQS",
        weight: 0.25,
        keys: &["cqs_score", "conversation_quality"],
    },
    Pillar {
        code: "ECS",
        weight: 0.25,
        keys: &["ecs_score", "execution_cadence"],
    },
    Pillar {
        code: "PHS",
        weight: 0.20,
        keys: &["phs_score", "pipeline_health"],
    },
    Pillar {
        code: "DIS",
        weight: 0.15,
        keys: &["dis_score", "deal_intelligence"],
    },
    Pillar {
        code: "ROS",
        weight: 0.15,
        keys: &["ros_score", "revenue_outcome"],
    },
];

const SUPPORT: &[Pillar] = &[
    Pillar {
        code: "FCR",
        weight: 0.30,
        keys: &["fcr_score", "first_contact_resolution"],
    },
    Pillar {
        code: "EMP",
        weight: 0.25,
        keys: &["emp_score", "empathy"],
    },
    Pillar {
        code: "EFF",
        weight: 0.20,
        keys: &["eff_score", "efficiency"],
    },
    Pillar {
        code: "SAT",
        weight: 0.15,
        keys: &["sat_score", "satisfaction"],
    },
    Pillar {
        code: "PRK",
        weight: 0.10,
        keys: &["prk_score", "product_knowledge"],
    },
];

const COLLECTIONS: &[Pillar] = &[
    Pillar {
        code: "CMP",
        weight: 0.40,
        keys: &["cmp_score", "compliance"],
    },
    Pillar {
        code: "NEG",
        weight: 0.25,
        keys: &["neg_score", "negotiation", "negotiation_skill"],
    },
    Pillar {
        code: "PTP",
        weight: 0.20,
        keys: &["ptp_score", "promise_to_pay", "promise_quality"],
    },
    Pillar {
        code: "AMT",
        weight: 0.15,
        keys: &["amt_score", "amount_recovered"],
    },
];

/// Pillars of a vertical. Weights sum to 1.
pub fn pillars(vertical: Vertical) -> &'static [Pillar] {
    match vertical {
        Vertical::Sales => SALES,
        Vertical::Support => SUPPORT,
        Vertical::Collections => COLLECTIONS,
    }
}

/// Whether a fatal flaw zeroes the overall score of this vertical.
pub fn fatal_flaw_zeroes_score(vertical: Vertical) -> bool {
    matches!(vertical, Vertical::Collections)
}

const POSITIVE: &[&str] = &["yes", "good", "passed", "true"];
const NEGATIVE: &[&str] = &["no", "bad", "failed", "false", "n/a"];

fn first_number(s: &str) -> Option<f64> {
    let re = Regex::new(r"\d+(?:\.\d+)?").ok()?;
    re.find(s).and_then(|m| m.as_str().parse().ok())
}

/// Coerce a model-supplied pillar value to a number.
///
/// Numbers pass through; booleans and yes/no words become 100 or 0; other
/// strings yield their first number. Objects use their `score`, `rating`
/// or `value` field, or else the share of positive verdicts among their
/// values. Anything else is 0.
pub fn coerce_score(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()).unwrap_or(0.0),
        Value::Bool(true) => 100.0,
        Value::Bool(false) => 0.0,
        Value::String(s) => {
            let clean = s.trim().to_lowercase();
            if POSITIVE.contains(&clean.as_str()) {
                100.0
            } else if NEGATIVE.contains(&clean.as_str()) {
                0.0
            } else {
                first_number(s).unwrap_or(0.0)
            }
        }
        Value::Object(map) => coerce_object(map),
        Value::Null | Value::Array(_) => 0.0,
    }
}

fn coerce_object(map: &Map<String, Value>) -> f64 {
    for key in ["score", "rating", "value"] {
        if let Some(inner) = map.get(key) {
            return coerce_score(inner);
        }
    }

    let (mut positive, mut negative) = (0usize, 0usize);
    for v in map.values() {
        match verdict(v) {
            Some(true) => positive += 1,
            Some(false) => negative += 1,
            None => {}
        }
    }
    if positive + negative == 0 {
        return 0.0;
    }
    positive as f64 / (positive + negative) as f64 * 100.0
}

/// A yes/no reading of a nested value, if it has one.
fn verdict(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "yes" | "good" | "passed" => Some(true),
            "no" | "bad" | "failed" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Truthiness of a flag field.
///
/// Numbers are true when non-zero, strings unless empty or a negative word,
/// and collections when non-empty.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
        Value::String(s) => {
            let clean = s.trim().to_lowercase();
            !clean.is_empty() && !NEGATIVE.contains(&clean.as_str()) && clean != "none"
        }
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn clamp(v: f64) -> f64 {
    v.clamp(0.0, 100.0)
}

/// Score of one evaluation after normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedScore {
    pub overall_score: f64,
    pub pillar_scores: BTreeMap<String, f64>,
    pub fatal_flaw: bool,
    pub fatal_flaw_type: Option<String>,
}

/// Normalize a raw evaluation for `vertical`.
///
/// Pillars are looked up by their field names (the first present wins),
/// coerced and weighted into the overall score, which is then clamped;
/// reported pillars are clamped on their own. A zero overall
/// falls back to the model's own `overall_score`. A truthy
/// `compliance_violation` or `fatal_flaw` marks a fatal flaw, which forces
/// the overall score of a compliance-sensitive vertical to 0.
pub fn normalize_score(vertical: Vertical, raw: &Value) -> NormalizedScore {
    let empty = Map::new();
    let fields = raw.as_object().unwrap_or(&empty);

    let mut pillar_scores = BTreeMap::new();
    let mut overall = 0.0;
    for pillar in pillars(vertical) {
        let score = pillar
            .keys
            .iter()
            .find_map(|k| fields.get(*k))
            .map(coerce_score)
            .unwrap_or(0.0);
        // Weighted as given; only the reported pillar is clamped
        overall += score * pillar.weight;
        pillar_scores.insert(pillar.code.to_string(), clamp(score));
    }

    if overall == 0.0 {
        if let Some(v) = fields.get("overall_score") {
            overall = coerce_score(v);
        }
    }
    let mut overall = clamp(overall);

    let fatal_flaw = ["compliance_violation", "fatal_flaw"]
        .iter()
        .any(|k| fields.get(*k).map(is_truthy).unwrap_or(false));
    let fatal_flaw_type = if fatal_flaw {
        fields
            .get("fatal_flaw_type")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    } else {
        None
    };

    if fatal_flaw && fatal_flaw_zeroes_score(vertical) {
        overall = 0.0;
    }

    NormalizedScore {
        overall_score: overall,
        pillar_scores,
        fatal_flaw,
        fatal_flaw_type,
    }
}
