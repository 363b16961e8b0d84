use std::path::{Path, PathBuf};

use ndarray::{Array4, ArrayViewD};
use opencv::core::{Mat, Scalar, Size, BORDER_CONSTANT};
use opencv::imgproc;
use opencv::prelude::*;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::TensorRef;

use super::detection::{non_max_suppression, BBox, DetectParams, Detection};
use super::detector::{Detector, DetectorError, DetectorFactory};

const NMS_IOU_THRESHOLD: f32 = 0.45;
const YOLOV8_OUTPUT: &str = "output0";
const LETTERBOX_FILL: f64 = 114.0;

#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    orig_w: f32,
    orig_h: f32,
    input_size: f32,
}

impl Letterbox {
    /// Maps a model-space `(cx, cy, w, h)` box back to frame pixels, clamped.
    fn unmap(&self, cx: f32, cy: f32, w: f32, h: f32) -> BBox {
        let x1 = ((cx - w / 2.0) - self.pad_x) / self.scale;
        let y1 = ((cy - h / 2.0) - self.pad_y) / self.scale;
        let x2 = ((cx + w / 2.0) - self.pad_x) / self.scale;
        let y2 = ((cy + h / 2.0) - self.pad_y) / self.scale;

        BBox::new(
            x1.clamp(0.0, self.orig_w),
            y1.clamp(0.0, self.orig_h),
            x2.clamp(0.0, self.orig_w),
            y2.clamp(0.0, self.orig_h),
        )
    }
}

/// Accepts YOLOv8 `[1, 4 + classes, anchors]` output or DETR `logits` / `pred_boxes`.
pub struct ObjectDetector {
    session: Session,
}

impl ObjectDetector {
    pub fn new(model_path: &str, intra_threads: usize) -> Result<Self, DetectorError> {
        let session = Session::builder()
            .map_err(load_error(model_path))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(load_error(model_path))?
            .with_intra_threads(intra_threads)
            .map_err(load_error(model_path))?;

        let session = if model_path.starts_with("http://") || model_path.starts_with("https://") {
            session.commit_from_url(model_path)
        } else {
            session.commit_from_file(model_path)
        }
        .map_err(load_error(model_path))?;

        tracing::info!(model = %model_path, "model loaded");

        Ok(Self { session })
    }

    fn preprocess(
        &self,
        frame: &Mat,
        input_size: u32,
    ) -> Result<(Array4<f32>, Letterbox), DetectorError> {
        let rows = frame.rows() as f32;
        let cols = frame.cols() as f32;
        let size = input_size as i32;
        let input = input_size as f32;

        let scale = (input / cols).min(input / rows);
        let new_w = ((cols * scale).round() as i32).clamp(1, size);
        let new_h = ((rows * scale).round() as i32).clamp(1, size);

        let mut resized = Mat::default();
        imgproc::resize(
            frame,
            &mut resized,
            Size::new(new_w, new_h),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;

        let pad_x = (size - new_w) / 2;
        let pad_y = (size - new_h) / 2;

        let mut padded = Mat::default();
        opencv::core::copy_make_border(
            &resized,
            &mut padded,
            pad_y,
            size - new_h - pad_y,
            pad_x,
            size - new_w - pad_x,
            BORDER_CONSTANT,
            Scalar::new(LETTERBOX_FILL, LETTERBOX_FILL, LETTERBOX_FILL, 0.0),
        )?;

        let mut rgb = Mat::default();
        imgproc::cvt_color(&padded, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;

        let data = rgb.data_bytes()?;
        let side = input_size as usize;
        if data.len() < side * side * 3 {
            return Err(DetectorError::UnsupportedOutput(
                "frame data smaller than model input".to_string(),
            ));
        }

        let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
        for y in 0..side {
            for x in 0..side {
                let idx = (y * side + x) * 3;
                tensor[[0, 0, y, x]] = data[idx] as f32 / 255.0;
                tensor[[0, 1, y, x]] = data[idx + 1] as f32 / 255.0;
                tensor[[0, 2, y, x]] = data[idx + 2] as f32 / 255.0;
            }
        }

        let letterbox = Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
            orig_w: cols,
            orig_h: rows,
            input_size: input,
        };

        Ok((tensor, letterbox))
    }
}

impl Detector for ObjectDetector {
    fn detect(
        &mut self,
        frame: &Mat,
        params: &DetectParams,
    ) -> Result<Vec<Detection>, DetectorError> {
        if frame.rows() == 0 || frame.cols() == 0 {
            return Ok(Vec::new());
        }

        let (input_tensor, letterbox) = self.preprocess(frame, params.image_size)?;

        let tensor_ref = TensorRef::from_array_view(input_tensor.view())?.into_dyn();
        let outputs = self.session.run(ort::inputs![tensor_ref])?;

        if let (Some(logits_val), Some(boxes_val)) =
            (outputs.get("logits"), outputs.get("pred_boxes"))
        {
            let logits = logits_val.try_extract_array::<f32>()?.to_owned();
            let boxes = boxes_val.try_extract_array::<f32>()?.to_owned();
            drop(outputs);
            return decode_detr(&logits.view(), &boxes.view(), params, &letterbox);
        }

        let Some(output) = outputs.get(YOLOV8_OUTPUT) else {
            return Err(DetectorError::UnsupportedOutput(format!(
                "expected '{}' or 'logits' + 'pred_boxes' outputs",
                YOLOV8_OUTPUT
            )));
        };
        let predictions = output.try_extract_array::<f32>()?.to_owned();
        drop(outputs);
        decode_yolov8(&predictions.view(), params, &letterbox)
    }
}

fn load_error<E: std::fmt::Display>(model_path: &str) -> impl Fn(E) -> DetectorError + '_ {
    move |e| DetectorError::Load {
        name: model_path.to_string(),
        reason: e.to_string(),
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// `[1, 4 + C, N]` with `(cx, cy, w, h)` in input pixels and per-class scores.
fn decode_yolov8(
    predictions: &ArrayViewD<f32>,
    params: &DetectParams,
    letterbox: &Letterbox,
) -> Result<Vec<Detection>, DetectorError> {
    let shape = predictions.shape();
    if shape.len() != 3 || shape[1] <= 4 {
        return Err(DetectorError::UnsupportedOutput(format!(
            "expected [1, 4 + classes, anchors], got {:?}",
            shape
        )));
    }

    let num_classes = shape[1] - 4;
    let num_anchors = shape[2];
    let mut detections = Vec::new();

    for anchor in 0..num_anchors {
        let mut best_class = 0usize;
        let mut best_score = 0.0f32;
        for class in 0..num_classes {
            let score = predictions[[0, 4 + class, anchor]];
            if score > best_score {
                best_score = score;
                best_class = class;
            }
        }

        let class_id = best_class as u32;
        if best_score < params.confidence_threshold || !params.accepts(class_id) {
            continue;
        }

        let bbox = letterbox.unmap(
            predictions[[0, 0, anchor]],
            predictions[[0, 1, anchor]],
            predictions[[0, 2, anchor]],
            predictions[[0, 3, anchor]],
        );
        detections.push(Detection::new(class_id, best_score, bbox));
    }

    non_max_suppression(&mut detections, NMS_IOU_THRESHOLD);
    Ok(detections)
}

/// `logits [1, Q, C]` and `pred_boxes [1, Q, 4]` normalized `(cx, cy, w, h)`.
fn decode_detr(
    logits: &ArrayViewD<f32>,
    boxes: &ArrayViewD<f32>,
    params: &DetectParams,
    letterbox: &Letterbox,
) -> Result<Vec<Detection>, DetectorError> {
    let logits_shape = logits.shape();
    let boxes_shape = boxes.shape();
    if logits_shape.len() < 2 || boxes_shape.len() < 2 {
        return Ok(Vec::new());
    }

    let (num_queries, num_classes) = if logits_shape.len() == 3 {
        (logits_shape[1], logits_shape[2])
    } else {
        (logits_shape[0], logits_shape[1])
    };

    let logits_flat = logits
        .as_slice()
        .ok_or_else(|| DetectorError::UnsupportedOutput("non-contiguous logits".to_string()))?;
    let boxes_flat = boxes
        .as_slice()
        .ok_or_else(|| DetectorError::UnsupportedOutput("non-contiguous boxes".to_string()))?;
    if boxes_flat.len() < num_queries * 4 {
        return Err(DetectorError::UnsupportedOutput(
            "pred_boxes shorter than logits".to_string(),
        ));
    }

    let input = letterbox.input_size;
    let mut detections = Vec::new();

    for i in 0..num_queries {
        let mut best_class = 0usize;
        let mut best_score = 0.0f32;
        for j in 0..num_classes {
            let score = sigmoid(logits_flat[i * num_classes + j]);
            if score > best_score {
                best_score = score;
                best_class = j;
            }
        }

        let class_id = best_class as u32;
        if best_score < params.confidence_threshold || !params.accepts(class_id) {
            continue;
        }

        let bbox = letterbox.unmap(
            boxes_flat[i * 4] * input,
            boxes_flat[i * 4 + 1] * input,
            boxes_flat[i * 4 + 2] * input,
            boxes_flat[i * 4 + 3] * input,
        );
        detections.push(Detection::new(class_id, best_score, bbox));
    }

    Ok(detections)
}

/// Loads `.onnx` models from a directory, by absolute path, or by URL.
pub struct OnnxDetectorFactory {
    models_dir: PathBuf,
    intra_threads: usize,
}

impl OnnxDetectorFactory {
    pub fn new(models_dir: PathBuf, intra_threads: usize) -> Self {
        Self {
            models_dir,
            intra_threads,
        }
    }

    fn resolve(&self, model_name: &str) -> Result<String, DetectorError> {
        if model_name.starts_with("http://") || model_name.starts_with("https://") {
            return Ok(model_name.to_string());
        }

        let candidate = Path::new(model_name);
        let path = if candidate.is_absolute() || candidate.exists() {
            candidate.to_path_buf()
        } else {
            self.models_dir.join(candidate)
        };

        if !path.exists() {
            return Err(DetectorError::Load {
                name: model_name.to_string(),
                reason: format!("model file {} not found", path.display()),
            });
        }

        Ok(path.to_string_lossy().into_owned())
    }
}

impl DetectorFactory for OnnxDetectorFactory {
    fn load(&self, model_name: &str) -> Result<Box<dyn Detector>, DetectorError> {
        let path = self.resolve(model_name)?;
        let detector = ObjectDetector::new(&path, self.intra_threads)?;
        Ok(Box::new(detector))
    }
}
