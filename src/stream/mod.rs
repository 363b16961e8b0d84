mod manager;
mod processor;
mod registry;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::analytics::DetectorError;
use crate::camera::CaptureError;
use crate::config::ConfigError;
use crate::storage::StorageError;

pub use manager::StreamManager;
pub use processor::StreamProcessor;
pub use registry::{StatusHandle, StreamRegistry};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("connection error: {0}")]
    Connection(#[from] CaptureError),
    #[error("missed frame read")]
    TransientRead,
    #[error("detection error: {0}")]
    Detection(#[from] DetectorError),
    #[error("model unavailable: {0}")]
    Model(DetectorError),
    #[error("persistence error: {0}")]
    Persistence(#[from] StorageError),
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("stream {0} is already active")]
    AlreadyActive(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Connecting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Stopped | StreamState::Error)
    }

    pub fn can_transition_to(self, next: StreamState) -> bool {
        use StreamState::*;
        matches!(
            (self, next),
            (Connecting, Running)
                | (Connecting, Error)
                | (Connecting, Stopping)
                | (Running, Stopping)
                | (Running, Error)
                | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamState::Connecting => "connecting",
            StreamState::Running => "running",
            StreamState::Stopping => "stopping",
            StreamState::Stopped => "stopped",
            StreamState::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub fps: f64,
    pub processing_time_ms: f64,
    pub frames_read: u64,
    pub frames_processed: u64,
    pub daily_frames_saved: u32,
    pub reconnects: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamStatus {
    pub stream_id: String,
    pub state: StreamState,
    pub detections: BTreeMap<String, u64>,
    pub last_detection: Option<DateTime<Utc>>,
    pub metrics: PerformanceMetrics,
    pub active_tracks: usize,
    pub alerts: u64,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl StreamStatus {
    pub fn new(stream_id: &str, class_names: impl IntoIterator<Item = String>) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            state: StreamState::Connecting,
            detections: class_names.into_iter().map(|name| (name, 0)).collect(),
            last_detection: None,
            metrics: PerformanceMetrics::default(),
            active_tracks: 0,
            alerts: 0,
            error: None,
            started_at: Utc::now(),
        }
    }
}
