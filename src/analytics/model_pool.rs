use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use opencv::core::Mat;

use super::detection::{DetectParams, Detection};
use super::detector::{Detector, DetectorError, DetectorFactory};

#[derive(Clone)]
pub struct SharedModel {
    name: Arc<str>,
    detector: Arc<Mutex<Box<dyn Detector>>>,
}

impl SharedModel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn detect(&self, frame: &Mat, params: &DetectParams) -> Result<Vec<Detection>, DetectorError> {
        let mut detector = self
            .detector
            .lock()
            .map_err(|_| DetectorError::Load {
                name: self.name.to_string(),
                reason: "model lock poisoned".to_string(),
            })?;
        detector.detect(frame, params)
    }
}

// Loads happen under the pool lock so each name loads once. Detection only
// takes the model's own mutex.
#[derive(Clone)]
pub struct ModelPool {
    factory: Arc<dyn DetectorFactory>,
    models: Arc<Mutex<HashMap<String, SharedModel>>>,
}

impl ModelPool {
    pub fn new(factory: Arc<dyn DetectorFactory>) -> Self {
        Self {
            factory,
            models: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn get(&self, model_name: &str) -> Result<SharedModel, DetectorError> {
        let mut models = self.models.lock().map_err(|_| DetectorError::Load {
            name: model_name.to_string(),
            reason: "model pool lock poisoned".to_string(),
        })?;

        if let Some(model) = models.get(model_name) {
            return Ok(model.clone());
        }

        let detector = self.factory.load(model_name).inspect_err(|e| {
            tracing::error!(model = %model_name, error = %e, "failed to load model");
        })?;

        let model = SharedModel {
            name: Arc::from(model_name),
            detector: Arc::new(Mutex::new(detector)),
        };
        models.insert(model_name.to_string(), model.clone());
        tracing::info!(model = %model_name, loaded = models.len(), "model added to pool");

        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    struct CountingFactory {
        loads: AtomicUsize,
    }

    struct NullDetector;

    impl Detector for NullDetector {
        fn detect(&mut self, _frame: &Mat, _params: &DetectParams) -> Result<Vec<Detection>, DetectorError> {
            Ok(Vec::new())
        }
    }

    impl DetectorFactory for CountingFactory {
        fn load(&self, model_name: &str) -> Result<Box<dyn Detector>, DetectorError> {
            if model_name == "broken.onnx" {
                return Err(DetectorError::Load {
                    name: model_name.to_string(),
                    reason: "corrupt".to_string(),
                });
            }
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(NullDetector))
        }
    }

    // Waits briefly for a second caller to be inside `detect` at the same time.
    struct Rendezvous {
        inside: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        wait: Duration,
    }

    impl Detector for Rendezvous {
        fn detect(&mut self, _frame: &Mat, _params: &DetectParams) -> Result<Vec<Detection>, DetectorError> {
            let now_inside = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now_inside, Ordering::SeqCst);

            let deadline = Instant::now() + self.wait;
            let mut met = now_inside > 1;
            while !met && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
                met = self.inside.load(Ordering::SeqCst) > 1;
            }
            self.peak.fetch_max(self.inside.load(Ordering::SeqCst), Ordering::SeqCst);
            self.inside.fetch_sub(1, Ordering::SeqCst);

            if met {
                Ok(Vec::new())
            } else {
                Err(DetectorError::UnsupportedOutput("alone".to_string()))
            }
        }
    }

    struct RendezvousFactory {
        inside: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        wait: Duration,
    }

    impl DetectorFactory for RendezvousFactory {
        fn load(&self, _model_name: &str) -> Result<Box<dyn Detector>, DetectorError> {
            Ok(Box::new(Rendezvous {
                inside: self.inside.clone(),
                peak: self.peak.clone(),
                wait: self.wait,
            }))
        }
    }

    fn rendezvous_pool(wait: Duration) -> (ModelPool, Arc<AtomicUsize>) {
        let peak = Arc::new(AtomicUsize::new(0));
        let pool = ModelPool::new(Arc::new(RendezvousFactory {
            inside: Arc::new(AtomicUsize::new(0)),
            peak: peak.clone(),
            wait,
        }));
        (pool, peak)
    }

    fn detect_on_threads(pool: &ModelPool, names: &[&str]) -> Vec<Result<Vec<Detection>, DetectorError>> {
        let handles: Vec<_> = names
            .iter()
            .map(|name| {
                let model = pool.get(name).unwrap();
                thread::spawn(move || model.detect(&Mat::default(), &params()))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    fn params() -> DetectParams {
        DetectParams {
            confidence_threshold: 0.5,
            classes: vec![0],
            image_size: 640,
        }
    }

    fn pool() -> (ModelPool, Arc<CountingFactory>) {
        let factory = Arc::new(CountingFactory {
            loads: AtomicUsize::new(0),
        });
        (ModelPool::new(factory.clone()), factory)
    }

    #[test]
    fn models_are_loaded_once_per_name() {
        let (pool, factory) = pool();

        let a = pool.get("yolov8n.onnx").unwrap();
        let b = pool.get("yolov8n.onnx").unwrap();
        let c = pool.get("yolov8s.onnx").unwrap();

        assert_eq!(factory.loads.load(Ordering::SeqCst), 2);
        assert!(Arc::ptr_eq(&a.detector, &b.detector));
        assert!(!Arc::ptr_eq(&a.detector, &c.detector));
        assert_eq!(pool.models.lock().unwrap().len(), 2);
    }

    #[test]
    fn concurrent_first_use_loads_once() {
        let (pool, factory) = pool();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || pool.get("shared.onnx").map(|m| m.name().to_string()))
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), "shared.onnx");
        }
        assert_eq!(factory.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_load_is_not_cached() {
        let (pool, _) = pool();
        assert!(pool.get("broken.onnx").is_err());
        assert!(pool.models.lock().unwrap().is_empty());
    }

    #[test]
    fn detect_goes_through_model_lock() {
        let (pool, _) = pool();
        let model = pool.get("yolov8n.onnx").unwrap();
        assert!(model.detect(&Mat::default(), &params()).unwrap().is_empty());
    }

    #[test]
    fn different_models_detect_concurrently() {
        let (pool, peak) = rendezvous_pool(Duration::from_secs(5));
        let results = detect_on_threads(&pool, &["yolov8n.onnx", "yolov8s.onnx"]);

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn same_model_detects_one_at_a_time() {
        let (pool, peak) = rendezvous_pool(Duration::from_millis(50));
        let results = detect_on_threads(&pool, &["yolov8n.onnx", "yolov8n.onnx", "yolov8n.onnx"]);

        assert!(results.iter().all(|r| r.is_err()));
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
