use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::alerts::Alert;
use crate::analytics::{class_name, BBox, Detection, Point};
use crate::stream::StatusHandle;
use crate::tracking::Track;

use super::{DetectionStore, EventLog, StorageError};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionEvent {
    pub stream_id: String,
    pub track_id: u64,
    pub class_id: u32,
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BBox,
    pub centroid: Point,
    pub timestamp: DateTime<Utc>,
    pub history: Vec<Point>,
    pub saved_frame: Option<PathBuf>,
}

impl DetectionEvent {
    pub fn from_track(
        stream_id: &str,
        track: &Track,
        detection: &Detection,
        saved_frame: Option<PathBuf>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            track_id: track.id,
            class_id: track.class_id,
            class_name: class_name(track.class_id),
            confidence: detection.confidence,
            bbox: detection.bbox,
            centroid: track.centroid,
            timestamp,
            history: track.history.to_vec(),
            saved_frame,
        }
    }
}

/// Failures are returned for logging and never retried.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: DetectionEvent) -> Result<(), StorageError>;

    fn publish_alert(&self, alert: Alert) -> Result<(), StorageError>;
}

// Records from a stream that was cleared while stopping only reach the log.
pub struct StreamSink {
    store: DetectionStore,
    log: Option<EventLog>,
    status: StatusHandle,
}

impl StreamSink {
    pub fn new(store: DetectionStore, log: Option<EventLog>, status: StatusHandle) -> Self {
        Self { store, log, status }
    }
}

impl EventSink for StreamSink {
    fn publish(&self, event: DetectionEvent) -> Result<(), StorageError> {
        let logged = match &self.log {
            Some(log) => log.append_detection(&event),
            None => Ok(()),
        };
        if self.status.is_attached() {
            self.store.insert(event);
        } else {
            tracing::debug!(stream = %event.stream_id, track = event.track_id, "detection for cleared stream not stored");
        }
        logged
    }

    fn publish_alert(&self, alert: Alert) -> Result<(), StorageError> {
        let logged = match &self.log {
            Some(log) => log.append_alert(&alert),
            None => Ok(()),
        };
        if self.status.is_attached() {
            self.store.insert_alert(alert);
        } else {
            tracing::debug!(stream = %alert.stream_id, rule = %alert.rule, "alert for cleared stream not stored");
        }
        logged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamRegistry;

    fn event(track_id: u64) -> DetectionEvent {
        DetectionEvent {
            stream_id: "cam".to_string(),
            track_id,
            class_id: 0,
            class_name: "person".to_string(),
            confidence: 0.8,
            bbox: BBox::new(0.0, 0.0, 10.0, 20.0),
            centroid: Point::new(5.0, 10.0),
            timestamp: Utc::now(),
            history: vec![Point::new(5.0, 10.0)],
            saved_frame: None,
        }
    }

    #[test]
    fn sink_stores_while_stream_is_registered() {
        let registry = StreamRegistry::new();
        let status = registry.create("cam", ["person".to_string()]).unwrap();
        let store = DetectionStore::new();
        let sink = StreamSink::new(store.clone(), None, status);

        sink.publish(event(1)).unwrap();
        assert_eq!(store.detections("cam").unwrap().len(), 1);
    }

    #[test]
    fn cleared_stream_leaves_no_records() {
        let registry = StreamRegistry::new();
        let status = registry.create("cam", ["person".to_string()]).unwrap();
        let store = DetectionStore::new();
        let sink = StreamSink::new(store.clone(), None, status);
        sink.publish(event(1)).unwrap();

        // Cleared while the worker is still stopping.
        registry.request_stop("cam");
        registry.remove("cam");
        store.clear("cam");

        sink.publish(event(2)).unwrap();
        assert!(store.detections("cam").is_none());

        // A new stream under the same id is not affected by the old sink.
        let fresh = registry.create("cam", ["person".to_string()]).unwrap();
        StreamSink::new(store.clone(), None, fresh).publish(event(3)).unwrap();
        sink.publish(event(4)).unwrap();
        let stored = store.detections("cam").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].event.track_id, 3);
    }
}
