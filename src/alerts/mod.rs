mod rules;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use rules::AlertEvaluator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Medium,
    High,
}

impl Severity {
    /// `High` once the observed value reaches one and a half times the threshold.
    pub fn for_ratio(value: f64, threshold: f64) -> Self {
        if threshold > 0.0 && value >= threshold * 1.5 {
            Severity::High
        } else {
            Severity::Medium
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub stream_id: String,
    pub rule: String,
    pub class_id: u32,
    pub class_name: String,
    pub track_id: Option<u64>,
    pub severity: Severity,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}
