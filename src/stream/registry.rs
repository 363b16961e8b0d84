use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::{StreamError, StreamState, StreamStatus};

type SharedStatus = Arc<RwLock<StreamStatus>>;

#[derive(Clone, Default)]
pub struct StreamRegistry {
    streams: Arc<RwLock<HashMap<String, SharedStatus>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stream in `Connecting`. An existing entry is replaced only
    /// once it has reached a terminal state.
    pub fn create(
        &self,
        stream_id: &str,
        class_names: impl IntoIterator<Item = String>,
    ) -> Result<StatusHandle, StreamError> {
        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = streams.get(stream_id) {
            let state = existing.read().unwrap_or_else(PoisonError::into_inner).state;
            if !state.is_terminal() {
                return Err(StreamError::AlreadyActive(stream_id.to_string()));
            }
        }

        let status = Arc::new(RwLock::new(StreamStatus::new(stream_id, class_names)));
        streams.insert(stream_id.to_string(), status.clone());

        Ok(StatusHandle {
            streams: self.streams.clone(),
            stream_id: stream_id.to_string(),
            status,
        })
    }

    pub fn list(&self) -> Vec<StreamStatus> {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<StreamStatus> = streams
            .values()
            .map(|s| s.read().unwrap_or_else(PoisonError::into_inner).clone())
            .collect();
        list.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        list
    }

    pub fn get(&self, stream_id: &str) -> Option<StreamStatus> {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        streams
            .get(stream_id)
            .map(|s| s.read().unwrap_or_else(PoisonError::into_inner).clone())
    }

    pub fn contains(&self, stream_id: &str) -> bool {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(stream_id)
    }

    /// Drops the entry; a worker still holding its handle exits at the next poll.
    pub fn remove(&self, stream_id: &str) -> Option<StreamStatus> {
        let removed = self
            .streams
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(stream_id)?;
        let status = removed.read().unwrap_or_else(PoisonError::into_inner).clone();
        Some(status)
    }

    pub fn request_stop(&self, stream_id: &str) -> bool {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        match streams.get(stream_id) {
            Some(status) => request_stop(stream_id, status),
            None => false,
        }
    }

    pub fn request_stop_all(&self) -> usize {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        streams
            .iter()
            .filter(|(id, status)| request_stop(id, status))
            .count()
    }
}

fn request_stop(stream_id: &str, status: &SharedStatus) -> bool {
    let mut status = status.write().unwrap_or_else(PoisonError::into_inner);
    if status.state == StreamState::Stopping {
        return true;
    }
    if !status.state.can_transition_to(StreamState::Stopping) {
        return false;
    }
    status.state = StreamState::Stopping;
    tracing::info!(stream = %stream_id, "stop requested");
    true
}

#[derive(Clone)]
pub struct StatusHandle {
    streams: Arc<RwLock<HashMap<String, SharedStatus>>>,
    stream_id: String,
    status: SharedStatus,
}

impl StatusHandle {
    pub fn state(&self) -> StreamState {
        self.status.read().unwrap_or_else(PoisonError::into_inner).state
    }

    /// Whether this handle's entry is still the one registered under its id.
    pub fn is_attached(&self) -> bool {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        streams
            .get(&self.stream_id)
            .is_some_and(|s| Arc::ptr_eq(s, &self.status))
    }

    pub fn stop_requested(&self) -> bool {
        self.state() == StreamState::Stopping || !self.is_attached()
    }

    pub fn transition(&self, next: StreamState) -> bool {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        let current = status.state;
        if !current.can_transition_to(next) {
            tracing::warn!(stream = %self.stream_id, from = %current, to = %next, "illegal state transition refused");
            return false;
        }
        status.state = next;
        tracing::debug!(stream = %self.stream_id, from = %current, to = %next, "state changed");
        true
    }

    pub fn fail(&self, reason: &str) -> bool {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        if !status.state.can_transition_to(StreamState::Error) {
            return false;
        }
        status.state = StreamState::Error;
        status.error = Some(reason.to_string());
        true
    }

    /// Runs `f` under the entry's write lock so readers never see a partial update.
    pub fn update<R>(&self, f: impl FnOnce(&mut StreamStatus) -> R) -> R {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut status)
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> StreamStatus {
        self.status.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
