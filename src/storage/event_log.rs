use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use crate::alerts::Alert;

use super::{DetectionEvent, StorageError};

pub const EVENTS_FILE: &str = "events.jsonl";

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LogRecord<'a> {
    Detection(&'a DetectionEvent),
    Alert(&'a Alert),
}

pub struct EventLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl EventLog {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(EVENTS_FILE),
            file: Mutex::new(None),
        }
    }

    pub fn append_detection(&self, event: &DetectionEvent) -> Result<(), StorageError> {
        self.append(&LogRecord::Detection(event))
    }

    pub fn append_alert(&self, alert: &Alert) -> Result<(), StorageError> {
        self.append(&LogRecord::Alert(alert))
    }

    fn append(&self, record: &LogRecord<'_>) -> Result<(), StorageError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if file.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            *file = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?,
            );
        }

        let result = match file.as_mut() {
            Some(f) => f.write_all(&line).and_then(|_| f.flush()),
            None => Ok(()),
        };
        if result.is_err() {
            // Reopen on the next append.
            *file = None;
        }
        result.map_err(StorageError::from)
    }
}
