use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::{Array4, ArrayViewD};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::TensorRef;

use crate::geometry::BBox;

use super::detector::{BoxError, DetectError, Detector};

const YOLO_INPUT_SIZE: u32 = 640;

/// COCO "car".
const VEHICLE_CLASS_ID: usize = 2;
const VEHICLE_CONFIDENCE: f32 = 0.5;
const PLATE_CONFIDENCE: f32 = 0.25;

/// YOLO26 detector (`logits` + `pred_boxes` outputs) on ONNX Runtime.
pub struct YoloDetector {
    session: Session,
    confidence_threshold: f32,
    /// Empty means every class.
    allowed_classes: Vec<usize>,
}

impl YoloDetector {
    fn new(
        model_path: &str,
        confidence_threshold: f32,
        allowed_classes: Vec<usize>,
    ) -> Result<Self, DetectError> {
        let session = Self::load(model_path).map_err(|reason| DetectError::Model {
            path: model_path.to_string(),
            reason,
        })?;

        tracing::info!(model = %model_path, "detector model loaded");

        Ok(Self {
            session,
            confidence_threshold,
            allowed_classes,
        })
    }

    /// Cars only, confidence above 0.5.
    pub fn vehicles(model_path: &str) -> Result<Self, DetectError> {
        Self::new(model_path, VEHICLE_CONFIDENCE, vec![VEHICLE_CLASS_ID])
    }

    /// Single-class plate localizer.
    pub fn plates(model_path: &str) -> Result<Self, DetectError> {
        Self::new(model_path, PLATE_CONFIDENCE, Vec::new())
    }

    fn load(model_path: &str) -> Result<Session, BoxError> {
        let builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?;

        let session = if model_path.starts_with("http://") || model_path.starts_with("https://") {
            builder.commit_from_url(model_path)?
        } else {
            builder.commit_from_file(model_path)?
        };
        Ok(session)
    }

    fn infer(&mut self, frame: &RgbImage) -> Result<Vec<BBox>, BoxError> {
        let (cols, rows) = frame.dimensions();
        if rows == 0 || cols == 0 {
            return Ok(Vec::new());
        }

        let (input_tensor, scale, pad_x, pad_y) = Self::preprocess(frame)?;

        let tensor_ref = TensorRef::from_array_view(input_tensor.view())?.into_dyn();
        let outputs = self.session.run(ort::inputs![tensor_ref])?;

        let (Some(logits_val), Some(boxes_val)) =
            (outputs.get("logits"), outputs.get("pred_boxes"))
        else {
            return Err(
                "Unsupported model format: expected YOLO26 with 'logits' and 'pred_boxes' outputs"
                    .into(),
            );
        };

        let logits = logits_val.try_extract_array::<f32>()?;
        let boxes = boxes_val.try_extract_array::<f32>()?;
        let logits_owned = logits.to_owned();
        let boxes_owned = boxes.to_owned();
        drop(outputs);

        Self::postprocess_yolo26(
            &logits_owned.view(),
            &boxes_owned.view(),
            self.confidence_threshold,
            &self.allowed_classes,
            scale,
            pad_x,
            pad_y,
            cols as f32,
            rows as f32,
        )
    }

    /// Letterboxes the frame into the square model input and normalizes it
    /// into an NCHW tensor.
    fn preprocess(frame: &RgbImage) -> Result<(Array4<f32>, f32, f32, f32), BoxError> {
        let (cols, rows) = frame.dimensions();
        let input_size = YOLO_INPUT_SIZE as f32;

        let scale = (input_size / cols as f32).min(input_size / rows as f32);
        let new_w = ((cols as f32 * scale).round() as u32).clamp(1, YOLO_INPUT_SIZE);
        let new_h = ((rows as f32 * scale).round() as u32).clamp(1, YOLO_INPUT_SIZE);

        let resized = imageops::resize(frame, new_w, new_h, FilterType::Triangle);

        let pad_x = (YOLO_INPUT_SIZE - new_w) / 2;
        let pad_y = (YOLO_INPUT_SIZE - new_h) / 2;

        let mut padded = RgbImage::from_pixel(YOLO_INPUT_SIZE, YOLO_INPUT_SIZE, Rgb([114, 114, 114]));
        imageops::replace(&mut padded, &resized, pad_x as i64, pad_y as i64);

        let data = padded.as_raw();
        let total_size = (YOLO_INPUT_SIZE * YOLO_INPUT_SIZE * 3) as usize;
        if data.len() < total_size {
            return Err("Frame data too small".into());
        }

        let mut tensor =
            Array4::<f32>::zeros((1, 3, YOLO_INPUT_SIZE as usize, YOLO_INPUT_SIZE as usize));
        for y in 0..YOLO_INPUT_SIZE as usize {
            for x in 0..YOLO_INPUT_SIZE as usize {
                let idx = (y * YOLO_INPUT_SIZE as usize + x) * 3;
                tensor[[0, 0, y, x]] = data[idx] as f32 / 255.0;
                tensor[[0, 1, y, x]] = data[idx + 1] as f32 / 255.0;
                tensor[[0, 2, y, x]] = data[idx + 2] as f32 / 255.0;
            }
        }

        Ok((tensor, scale, pad_x as f32, pad_y as f32))
    }

    #[allow(clippy::too_many_arguments)]
    fn postprocess_yolo26(
        logits: &ArrayViewD<f32>,
        boxes: &ArrayViewD<f32>,
        confidence_threshold: f32,
        allowed_classes: &[usize],
        scale: f32,
        pad_x: f32,
        pad_y: f32,
        orig_w: f32,
        orig_h: f32,
    ) -> Result<Vec<BBox>, BoxError> {
        let logits_shape = logits.shape();
        let boxes_shape = boxes.shape();

        // logits [1, N, classes], boxes [1, N, 4]
        if logits_shape.len() < 2 || boxes_shape.len() < 2 {
            return Ok(Vec::new());
        }

        let num_detections = if logits_shape.len() == 3 {
            logits_shape[1]
        } else {
            logits_shape[0]
        };
        let num_classes = if logits_shape.len() == 3 {
            logits_shape[2]
        } else {
            logits_shape[1]
        };

        let logits_flat = logits.as_slice().ok_or("Cannot get logits slice")?;
        let boxes_flat = boxes.as_slice().ok_or("Cannot get boxes slice")?;
        if boxes_flat.len() < num_detections * 4 {
            return Err("pred_boxes shorter than logits".into());
        }

        let input_size = YOLO_INPUT_SIZE as f32;
        let mut detections = Vec::new();

        for i in 0..num_detections {
            let mut max_score = 0.0f32;
            let mut max_class = 0usize;

            for j in 0..num_classes {
                let logit = logits_flat[i * num_classes + j];
                let score = 1.0 / (1.0 + (-logit).exp());
                if score > max_score {
                    max_score = score;
                    max_class = j;
                }
            }

            if max_score < confidence_threshold {
                continue;
            }

            if !allowed_classes.is_empty() && !allowed_classes.contains(&max_class) {
                continue;
            }

            // (cx, cy, w, h) normalized to the letterboxed input
            let cx = boxes_flat[i * 4] * input_size;
            let cy = boxes_flat[i * 4 + 1] * input_size;
            let w = boxes_flat[i * 4 + 2] * input_size;
            let h = boxes_flat[i * 4 + 3] * input_size;

            let x = ((cx - w / 2.0) - pad_x) / scale;
            let y = ((cy - h / 2.0) - pad_y) / scale;
            let det_w = w / scale;
            let det_h = h / scale;

            let x = x.max(0.0).min(orig_w);
            let y = y.max(0.0).min(orig_h);
            let det_w = det_w.min(orig_w - x);
            let det_h = det_h.min(orig_h - y);

            detections.push(BBox::new(x, y, det_w, det_h));
        }

        Ok(detections)
    }
}

impl Detector for YoloDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BBox>, DetectError> {
        self.infer(image).map_err(DetectError::Inference)
    }
}
