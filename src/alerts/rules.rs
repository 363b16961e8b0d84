use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::analytics::class_name;
use crate::config::AlertRule;
use crate::tracking::CentroidTracker;

use super::{Alert, Severity};

struct RuleState {
    rule: AlertRule,
    tripped: bool,
    fired: HashSet<u64>,
}

// Count rules fire once per crossing and re-arm when the count drops back
// to the limit. Dwell rules fire once per track.
pub struct AlertEvaluator {
    stream_id: String,
    rules: Vec<RuleState>,
}

impl AlertEvaluator {
    pub fn new(stream_id: &str, rules: &[AlertRule]) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            rules: rules
                .iter()
                .cloned()
                .map(|rule| RuleState {
                    rule,
                    tripped: false,
                    fired: HashSet::new(),
                })
                .collect(),
        }
    }

    pub fn evaluate(&mut self, tracker: &CentroidTracker, now: DateTime<Utc>) -> Vec<Alert> {
        let mut alerts = Vec::new();

        for state in &mut self.rules {
            match state.rule {
                AlertRule::MaxCount { class_id, max } => {
                    let count = tracker
                        .tracks()
                        .filter(|t| t.class_id == class_id && tracker.is_confirmed(t))
                        .count();
                    if count <= max {
                        state.tripped = false;
                        continue;
                    }
                    if state.tripped {
                        continue;
                    }
                    state.tripped = true;

                    let name = class_name(class_id);
                    alerts.push(Alert {
                        stream_id: self.stream_id.clone(),
                        rule: "max_count".to_string(),
                        class_id,
                        class_name: name.clone(),
                        track_id: None,
                        severity: Severity::for_ratio(count as f64, max as f64),
                        value: count as f64,
                        threshold: max as f64,
                        message: format!("{count} {name} tracked, limit {max}"),
                        timestamp: now,
                    });
                }
                AlertRule::Dwell {
                    class_id,
                    min_frames,
                } => {
                    state.fired.retain(|id| tracker.track(*id).is_some());

                    for track in tracker.tracks() {
                        if track.class_id != class_id
                            || !tracker.is_confirmed(track)
                            || track.hits < min_frames
                            || state.fired.contains(&track.id)
                        {
                            continue;
                        }
                        state.fired.insert(track.id);

                        let name = class_name(class_id);
                        alerts.push(Alert {
                            stream_id: self.stream_id.clone(),
                            rule: "dwell".to_string(),
                            class_id,
                            class_name: name.clone(),
                            track_id: Some(track.id),
                            severity: Severity::for_ratio(track.hits as f64, min_frames as f64),
                            value: track.hits as f64,
                            threshold: min_frames as f64,
                            message: format!(
                                "{name} {} present for {} frames",
                                track.id, track.hits
                            ),
                            timestamp: now,
                        });
                    }
                }
            }
        }

        if !alerts.is_empty() {
            tracing::info!(stream = %self.stream_id, count = alerts.len(), "alerts raised");
        }
        alerts
    }
}
