use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use crate::alerts::Alert;

use super::DetectionEvent;

const DEFAULT_MAX_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Serialize)]
pub struct StoredDetection {
    pub id: u64,
    #[serde(flatten)]
    pub event: DetectionEvent,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredAlert {
    pub id: u64,
    #[serde(flatten)]
    pub alert: Alert,
}

#[derive(Default)]
struct StreamRecords {
    detections: VecDeque<StoredDetection>,
    alerts: VecDeque<StoredAlert>,
}

#[derive(Clone)]
pub struct DetectionStore {
    streams: Arc<RwLock<HashMap<String, StreamRecords>>>,
    next_id: Arc<AtomicU64>,
    max_entries: usize,
}

impl Default for DetectionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectionStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            max_entries: max_entries.max(1),
        }
    }

    pub fn insert(&self, event: DetectionEvent) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        let records = streams.entry(event.stream_id.clone()).or_default();
        records.detections.push_back(StoredDetection { id, event });
        while records.detections.len() > self.max_entries {
            records.detections.pop_front();
        }
        id
    }

    pub fn insert_alert(&self, alert: Alert) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        let records = streams.entry(alert.stream_id.clone()).or_default();
        records.alerts.push_back(StoredAlert { id, alert });
        while records.alerts.len() > self.max_entries {
            records.alerts.pop_front();
        }
        id
    }

    /// `None` when nothing was ever recorded for the stream.
    pub fn detections(&self, stream_id: &str) -> Option<Vec<StoredDetection>> {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        streams
            .get(stream_id)
            .map(|r| r.detections.iter().cloned().collect())
    }

    pub fn alerts(&self, stream_id: &str) -> Option<Vec<StoredAlert>> {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        streams
            .get(stream_id)
            .map(|r| r.alerts.iter().cloned().collect())
    }

    pub fn clear(&self, stream_id: &str) -> bool {
        self.streams
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(stream_id)
            .is_some()
    }
}
