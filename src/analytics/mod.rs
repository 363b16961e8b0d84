mod detection;
mod detector;
mod model_pool;
mod object;

pub use detection::{class_name, is_known_class, BBox, DetectParams, Detection, Point};
pub use detector::{Detector, DetectorError, DetectorFactory};
pub use model_pool::{ModelPool, SharedModel};
pub use object::OnnxDetectorFactory;
