use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::task::JoinHandle;

use crate::analytics::{class_name, ModelPool};
use crate::camera::SourceFactory;
use crate::config::StreamConfig;
use crate::storage::{
    DetectionStore, EventLog, StorageError, StoredAlert, StoredDetection, StreamSink, EVENTS_DIR,
    FRAMES_DIR,
};

use super::{StatusHandle, StreamError, StreamProcessor, StreamRegistry, StreamState, StreamStatus};

#[derive(Clone)]
pub struct StreamManager {
    registry: StreamRegistry,
    models: ModelPool,
    store: DetectionStore,
    sources: Arc<dyn SourceFactory>,
    shutdown: Arc<AtomicBool>,
    outputs: Arc<RwLock<HashMap<String, PathBuf>>>,
    workers: Arc<Mutex<HashMap<String, JoinHandle<StreamState>>>>,
    // Workers of earlier runs of a restarted id, still awaited by `join_all`.
    retired: Arc<Mutex<Vec<(String, JoinHandle<StreamState>)>>>,
}

impl StreamManager {
    pub fn new(models: ModelPool, sources: Arc<dyn SourceFactory>) -> Self {
        Self {
            registry: StreamRegistry::new(),
            models,
            store: DetectionStore::new(),
            sources,
            shutdown: Arc::new(AtomicBool::new(false)),
            outputs: Arc::new(RwLock::new(HashMap::new())),
            workers: Arc::new(Mutex::new(HashMap::new())),
            retired: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    pub fn store(&self) -> &DetectionStore {
        &self.store
    }

    /// Blocks while the model loads. Must be called from within a tokio runtime.
    pub fn start(&self, config: StreamConfig) -> Result<StatusHandle, StreamError> {
        config.validate()?;

        let class_names = config.classes.iter().map(|&c| class_name(c));
        let status = self.registry.create(&config.id, class_names)?;

        let model = match self.models.get(&config.model_name) {
            Ok(model) => model,
            Err(e) => {
                status.fail(&e.to_string());
                return Err(StreamError::Model(e));
            }
        };

        let output_dir = config.output_dir();
        if let Err(e) = create_output_dirs(&output_dir) {
            status.fail(&e.to_string());
            return Err(StreamError::Persistence(e));
        }
        self.outputs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(config.id.clone(), output_dir.clone());

        let sink = Arc::new(StreamSink::new(
            self.store.clone(),
            Some(EventLog::new(&output_dir.join(EVENTS_DIR))),
            status.clone(),
        ));
        let source = self.sources.create(&config);
        let stream_id = config.id.clone();

        tracing::info!(
            stream = %stream_id,
            url = %config.url,
            model = %config.model_name,
            output = %output_dir.display(),
            "starting stream"
        );

        let processor = StreamProcessor::new(
            config,
            status.clone(),
            source,
            model,
            sink,
            self.shutdown.clone(),
        );
        let handle = tokio::task::spawn_blocking(move || processor.run());

        let previous = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(stream_id.clone(), handle);
        if let Some(previous) = previous {
            let mut retired = self.retired.lock().unwrap_or_else(PoisonError::into_inner);
            retired.retain(|(_, h)| !h.is_finished());
            retired.push((stream_id, previous));
        }

        Ok(status)
    }

    pub fn status(&self, stream_id: &str) -> Option<StreamStatus> {
        self.registry.get(stream_id)
    }

    pub fn list(&self) -> Vec<StreamStatus> {
        self.registry.list()
    }

    pub fn detections(&self, stream_id: &str) -> Option<Vec<StoredDetection>> {
        self.store.detections(stream_id)
    }

    pub fn alerts(&self, stream_id: &str) -> Option<Vec<StoredAlert>> {
        self.store.alerts(stream_id)
    }

    pub fn stop(&self, stream_id: &str) -> bool {
        self.registry.request_stop(stream_id)
    }

    pub fn stop_all(&self) -> usize {
        self.registry.request_stop_all()
    }

    pub fn clear(&self, stream_id: &str) -> bool {
        self.registry.request_stop(stream_id);
        let removed = self.registry.remove(stream_id).is_some();
        let cleared = self.store.clear(stream_id);
        self.outputs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(stream_id);
        if removed || cleared {
            tracing::info!(stream = %stream_id, "stream cleared");
        }
        removed || cleared
    }

    pub fn frame_path(&self, stream_id: &str, filename: &str) -> Option<PathBuf> {
        if Path::new(filename).file_name() != Some(std::ffi::OsStr::new(filename)) {
            return None;
        }
        let outputs = self.outputs.read().unwrap_or_else(PoisonError::into_inner);
        let path = outputs.get(stream_id)?.join(FRAMES_DIR).join(filename);
        path.is_file().then_some(path)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub async fn join(&self, stream_id: &str) -> Option<StreamState> {
        let handle = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(stream_id)?;
        match handle.await {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::error!(stream = %stream_id, error = %e, "stream worker panicked");
                None
            }
        }
    }

    pub async fn join_all(&self) {
        let mut handles: Vec<(String, JoinHandle<StreamState>)> = self
            .retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        handles.extend(
            self.workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain(),
        );

        for (stream_id, handle) in handles {
            match handle.await {
                Ok(state) => tracing::debug!(stream = %stream_id, state = %state, "worker joined"),
                Err(e) => tracing::error!(stream = %stream_id, error = %e, "stream worker panicked"),
            }
        }
    }
}

fn create_output_dirs(output_dir: &Path) -> Result<(), StorageError> {
    std::fs::create_dir_all(output_dir.join(FRAMES_DIR))?;
    std::fs::create_dir_all(output_dir.join(EVENTS_DIR))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use opencv::core::{Mat, Scalar, CV_8UC3};

    use crate::analytics::{DetectParams, Detection, Detector, DetectorError, DetectorFactory};
    use crate::camera::{CaptureError, FrameSource};

    struct BlankSource;

    impl FrameSource for BlankSource {
        fn open(&mut self) -> Result<(), CaptureError> {
            Ok(())
        }

        fn read(&mut self) -> Result<Option<Mat>, CaptureError> {
            Ok(Some(Mat::new_rows_cols_with_default(
                48,
                64,
                CV_8UC3,
                Scalar::all(0.0),
            )?))
        }

        fn release(&mut self) {}
    }

    struct BlankSources;

    impl SourceFactory for BlankSources {
        fn create(&self, _config: &StreamConfig) -> Box<dyn FrameSource> {
            Box::new(BlankSource)
        }
    }

    struct NullDetector;

    impl Detector for NullDetector {
        fn detect(&mut self, _frame: &Mat, _params: &DetectParams) -> Result<Vec<Detection>, DetectorError> {
            Ok(Vec::new())
        }
    }

    struct Models;

    impl DetectorFactory for Models {
        fn load(&self, model_name: &str) -> Result<Box<dyn Detector>, DetectorError> {
            if model_name == "missing.onnx" {
                return Err(DetectorError::Load {
                    name: model_name.to_string(),
                    reason: "not found".to_string(),
                });
            }
            Ok(Box::new(NullDetector))
        }
    }

    fn manager() -> StreamManager {
        StreamManager::new(ModelPool::new(Arc::new(Models)), Arc::new(BlankSources))
    }

    fn config(id: &str) -> StreamConfig {
        let mut config = StreamConfig::new(id, "rtsp://camera.local/stream");
        config.output_dir = Some(
            std::env::temp_dir().join(format!("streamtrack-mgr-{}-{}", id, std::process::id())),
        );
        config
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_connecting() {
        let manager = manager();
        let mut config = config("bad");
        config.process_every_n_frames = 0;

        assert!(matches!(
            manager.start(config),
            Err(StreamError::Configuration(_))
        ));
        assert!(!manager.registry().contains("bad"));
    }

    #[tokio::test]
    async fn start_stop_reaches_stopped() {
        let manager = manager();
        let config = config("run");
        let output = config.output_dir();
        manager.start(config).unwrap();

        assert!(output.join(FRAMES_DIR).is_dir());
        assert!(output.join(EVENTS_DIR).is_dir());
        assert!(matches!(
            manager.start(self::config("run")),
            Err(StreamError::AlreadyActive(_))
        ));

        assert!(manager.stop("run"));
        assert_eq!(manager.join("run").await, Some(StreamState::Stopped));
        assert_eq!(manager.status("run").unwrap().state, StreamState::Stopped);

        // A finished stream can be started again under the same id.
        manager.start(self::config("run")).unwrap();
        manager.shutdown();
        manager.join_all().await;
        assert_eq!(manager.status("run").unwrap().state, StreamState::Stopped);

        let _ = std::fs::remove_dir_all(output);
    }

    #[tokio::test]
    async fn model_load_failure_marks_error() {
        let manager = manager();
        let mut config = config("nomodel");
        config.model_name = "missing.onnx".to_string();

        assert!(matches!(manager.start(config), Err(StreamError::Model(_))));
        let status = manager.status("nomodel").unwrap();
        assert_eq!(status.state, StreamState::Error);
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn clear_forgets_stream() {
        let manager = manager();
        let config = config("gone");
        let output = config.output_dir();
        manager.start(config).unwrap();

        assert!(manager.clear("gone"));
        assert!(manager.status("gone").is_none());
        assert_eq!(manager.join("gone").await, Some(StreamState::Stopped));
        assert!(!manager.clear("gone"));

        let _ = std::fs::remove_dir_all(output);
    }

    async fn wait_for(manager: &StreamManager, stream_id: &str, state: StreamState) {
        for _ in 0..500 {
            if manager.status(stream_id).map(|s| s.state) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{stream_id} never reached {state}");
    }

    #[tokio::test]
    async fn restart_keeps_previous_worker_joinable() {
        let manager = manager();
        let config = config("again");
        let output = config.output_dir();
        manager.start(config).unwrap();

        assert!(manager.stop("again"));
        wait_for(&manager, "again", StreamState::Stopped).await;
        manager.start(self::config("again")).unwrap();
        assert_eq!(manager.retired.lock().unwrap().len(), 1);

        manager.shutdown();
        manager.join_all().await;
        assert!(manager.retired.lock().unwrap().is_empty());
        assert!(manager.workers.lock().unwrap().is_empty());
        assert_eq!(manager.status("again").unwrap().state, StreamState::Stopped);

        let _ = std::fs::remove_dir_all(output);
    }

    #[test]
    fn frame_path_rejects_traversal() {
        let manager = manager();
        let dir = std::env::temp_dir().join(format!("streamtrack-dl-{}", std::process::id()));
        std::fs::create_dir_all(dir.join(FRAMES_DIR)).unwrap();
        std::fs::write(dir.join(FRAMES_DIR).join("person_cam_0_x.jpg"), b"jpeg").unwrap();
        manager
            .outputs
            .write()
            .unwrap()
            .insert("cam".to_string(), dir.clone());

        assert!(manager.frame_path("cam", "person_cam_0_x.jpg").is_some());
        assert!(manager.frame_path("cam", "../events/events.jsonl").is_none());
        assert!(manager.frame_path("cam", "missing.jpg").is_none());
        assert!(manager.frame_path("other", "person_cam_0_x.jpg").is_none());

        let _ = std::fs::remove_dir_all(dir);
    }
}
