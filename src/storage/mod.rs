mod detection_store;
mod event;
mod event_log;
mod frames;

use std::path::PathBuf;

use thiserror::Error;

pub use detection_store::{DetectionStore, StoredAlert, StoredDetection};
pub use event::{DetectionEvent, EventSink, StreamSink};
pub use event_log::EventLog;
pub use frames::{DailyQuota, FrameWriter, FRAMES_DIR};

pub const EVENTS_DIR: &str = "events";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("opencv error: {0}")]
    OpenCv(#[from] opencv::Error),
    #[error("failed to encode {}", .0.display())]
    Encode(PathBuf),
}
