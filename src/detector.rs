use log::{debug, info};
use ndarray::{Array2, Array4, ArrayView2, Axis};
use opencv::{
    core::{self, Mat, Point, Rect, Scalar},
    imgproc,
    prelude::*,
};
use ort::{session::Session, value::TensorRef};
use std::path::Path;
use thiserror::Error;

use crate::config::{AppConfig, MAX_INPUT_SIZE};

/// Number of leading values per prediction that describe the box (cx, cy, w, h).
const CXYWH_OFFSET: usize = 4;

#[rustfmt::skip]
pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat", "traffic light",
    "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog", "horse", "sheep", "cow", "elephant",
    "bear", "zebra", "giraffe", "backpack", "umbrella", "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard",
    "sports ball", "kite", "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange", "broccoli",
    "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant", "bed", "dining table", "toilet",
    "tv", "laptop", "mouse", "remote", "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator",
    "book", "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush"
];

// BGR
const PALETTE: [(f64, f64, f64); 12] = [
    (0.0, 0.0, 255.0),
    (0.0, 255.0, 0.0),
    (255.0, 0.0, 0.0),
    (0.0, 255.0, 255.0),
    (255.0, 0.0, 255.0),
    (255.0, 255.0, 0.0),
    (0.0, 128.0, 255.0),
    (128.0, 0.0, 255.0),
    (0.0, 255.0, 128.0),
    (255.0, 128.0, 0.0),
    (255.0, 255.0, 255.0),
    (255.0, 0.0, 128.0),
];

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("Failed to load model: {0}")]
    ModelLoad(String),
    #[error("Inference error: {0}")]
    Inference(String),
    #[error("Unsupported model input size {0}")]
    InputSize(u32),
    #[error("Unexpected model output shape {0:?}")]
    OutputShape(Vec<i64>),
    #[error("Image processing error: {0}")]
    OpenCV(#[from] opencv::Error),
}

/// One object found in a frame, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub class_id: usize,
    pub confidence: f32,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Detection {
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn intersection_area(&self, other: &Detection) -> f32 {
        let l = self.x.max(other.x);
        let r = (self.x + self.width).min(other.x + other.width);
        let t = self.y.max(other.y);
        let b = (self.y + self.height).min(other.y + other.height);
        (r - l).max(0.) * (b - t).max(0.)
    }

    pub fn iou(&self, other: &Detection) -> f32 {
        let union = self.area() + other.area() - self.intersection_area(other);
        if union <= 0. {
            return 0.;
        }
        self.intersection_area(other) / union
    }

    pub fn label(&self) -> &'static str {
        COCO_CLASSES.get(self.class_id).copied().unwrap_or("unknown")
    }
}

/// Something that marks detected objects on a frame.
///
/// `annotate` draws onto `frame` in place, keeping its dimensions, and returns
/// what it found.
pub trait Detector {
    fn annotate(&mut self, frame: &mut Mat) -> Result<Vec<Detection>, DetectorError>;
}

/// Decodes a YOLOv8 head of shape `(4 + classes, anchors)` into detections.
///
/// Candidates whose best class score is below `conf_threshold` are dropped.
/// `scale` maps model input coordinates back to the frame and boxes are
/// clamped to `bounds` (frame width, height).
pub fn decode_predictions(
    preds: ArrayView2<f32>,
    conf_threshold: f32,
    scale: (f32, f32),
    bounds: (f32, f32),
) -> Vec<Detection> {
    let mut detections = Vec::new();
    if preds.nrows() <= CXYWH_OFFSET {
        return detections;
    }

    for pred in preds.axis_iter(Axis(1)) {
        let Some((class_id, confidence)) = pred
            .iter()
            .skip(CXYWH_OFFSET)
            .copied()
            .enumerate()
            .reduce(|max, x| if x.1 > max.1 { x } else { max })
        else {
            continue;
        };
        if confidence < conf_threshold {
            continue;
        }

        let cx = pred[0] * scale.0;
        let cy = pred[1] * scale.1;
        let w = pred[2] * scale.0;
        let h = pred[3] * scale.1;
        let x0 = (cx - w / 2.).clamp(0., bounds.0);
        let y0 = (cy - h / 2.).clamp(0., bounds.1);
        let x1 = (cx + w / 2.).clamp(0., bounds.0);
        let y1 = (cy + h / 2.).clamp(0., bounds.1);

        detections.push(Detection {
            class_id,
            confidence,
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
        });
    }
    detections
}

/// Class-wise non-maximum suppression. Leaves the survivors sorted by
/// descending confidence.
pub fn non_max_suppression(detections: &mut Vec<Detection>, iou_threshold: f32) {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept = 0;
    for index in 0..detections.len() {
        let candidate = detections[index];
        let suppressed = detections[..kept]
            .iter()
            .any(|k| k.class_id == candidate.class_id && k.iou(&candidate) > iou_threshold);
        if !suppressed {
            detections.swap(kept, index);
            kept += 1;
        }
    }
    detections.truncate(kept);
}

/// Draws a box and a `label: score` tag for each detection.
pub fn draw_detections(frame: &mut Mat, detections: &[Detection]) -> opencv::Result<()> {
    for det in detections {
        let (b, g, r) = PALETTE[det.class_id % PALETTE.len()];
        let color = Scalar::new(b, g, r, 0.0);
        let rect = Rect::new(
            det.x.round() as i32,
            det.y.round() as i32,
            det.width.round() as i32,
            det.height.round() as i32,
        );
        imgproc::rectangle(frame, rect, color, 2, imgproc::LINE_8, 0)?;

        let text = format!("{}: {:.2}", det.label(), det.confidence);
        let mut baseline = 0;
        let text_size = imgproc::get_text_size(
            &text,
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.5,
            1,
            &mut baseline,
        )?;
        // Put the tag above the box, or inside it when the box touches the top edge.
        let label_y = if rect.y - text_size.height - baseline >= 0 {
            rect.y - baseline
        } else {
            rect.y + text_size.height
        };
        imgproc::rectangle(
            frame,
            Rect::new(
                rect.x,
                label_y - text_size.height,
                text_size.width,
                text_size.height + baseline,
            ),
            color,
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )?;
        imgproc::put_text(
            frame,
            &text,
            Point::new(rect.x, label_y),
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.5,
            Scalar::new(0.0, 0.0, 0.0, 0.0),
            1,
            imgproc::LINE_AA,
            false,
        )?;
    }
    Ok(())
}

/// YOLOv8 detector running on ONNX Runtime.
pub struct YoloV8 {
    session: Session,
    input_size: u32,
    conf_threshold: f32,
    iou_threshold: f32,
}

impl YoloV8 {
    pub fn new(
        model_path: &Path,
        input_size: u32,
        conf_threshold: f32,
        iou_threshold: f32,
    ) -> Result<Self, DetectorError> {
        if input_size == 0 || input_size > MAX_INPUT_SIZE {
            return Err(DetectorError::InputSize(input_size));
        }
        info!("Loading YOLOv8 model from {}", model_path.display());
        if !model_path.is_file() {
            return Err(DetectorError::ModelLoad(format!(
                "model file not found: {}",
                model_path.display()
            )));
        }

        let session = Session::builder()
            .map_err(|e| DetectorError::ModelLoad(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| DetectorError::ModelLoad(e.to_string()))?;

        info!("YOLOv8 model loaded successfully");
        Ok(Self {
            session,
            input_size,
            conf_threshold,
            iou_threshold,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, DetectorError> {
        Self::new(
            &config.model_path,
            config.input_size,
            config.conf_threshold,
            config.iou_threshold,
        )
    }

    /// BGR frame -> normalized RGB NCHW tensor of the model's input size.
    fn preprocess(&self, frame: &Mat) -> Result<Array4<f32>, DetectorError> {
        let side = i32::try_from(self.input_size)
            .map_err(|_| DetectorError::InputSize(self.input_size))?;
        let resized = crate::frame::resize_square(frame, side)?;
        let mut rgb = Mat::default();
        imgproc::cvt_color(
            &resized,
            &mut rgb,
            imgproc::COLOR_BGR2RGB,
            0,
            core::AlgorithmHint::ALGO_HINT_DEFAULT,
        )?;

        let side = side as usize;
        let data = rgb.data_bytes()?;
        let mut input = Array4::<f32>::zeros((1, 3, side, side));
        for (i, px) in data.chunks_exact(3).enumerate() {
            let (y, x) = (i / side, i % side);
            input[[0, 0, y, x]] = f32::from(px[0]) / 255.0;
            input[[0, 1, y, x]] = f32::from(px[1]) / 255.0;
            input[[0, 2, y, x]] = f32::from(px[2]) / 255.0;
        }
        Ok(input)
    }

    /// Runs the session and returns the first output as `(4 + classes, anchors)`.
    fn infer(&mut self, input: &Array4<f32>) -> Result<Array2<f32>, DetectorError> {
        let input_tensor = TensorRef::from_array_view(input.view())
            .map_err(|e| DetectorError::Inference(e.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![input_tensor])
            .map_err(|e| DetectorError::Inference(e.to_string()))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::Inference(format!("Failed to extract tensor: {e}")))?;
        let dims: &[i64] = shape.as_ref();
        if dims.len() != 3 || dims[0] != 1 {
            return Err(DetectorError::OutputShape(dims.to_vec()));
        }

        Array2::from_shape_vec((dims[1] as usize, dims[2] as usize), data.to_vec())
            .map_err(|e| DetectorError::Inference(e.to_string()))
    }

    pub fn detect(&mut self, frame: &Mat) -> Result<Vec<Detection>, DetectorError> {
        let size = frame.size()?;
        let input = self.preprocess(frame)?;
        let preds = self.infer(&input)?;

        let side = self.input_size as f32;
        let scale = (size.width as f32 / side, size.height as f32 / side);
        let bounds = (size.width as f32, size.height as f32);
        let mut detections = decode_predictions(preds.view(), self.conf_threshold, scale, bounds);
        non_max_suppression(&mut detections, self.iou_threshold);

        debug!("Detected {} objects", detections.len());
        Ok(detections)
    }
}

impl Detector for YoloV8 {
    fn annotate(&mut self, frame: &mut Mat) -> Result<Vec<Detection>, DetectorError> {
        let detections = self.detect(frame)?;
        draw_detections(frame, &detections)?;
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::solid_frame;
    use ndarray::Array2;

    fn det(class_id: usize, confidence: f32, x: f32, y: f32, w: f32, h: f32) -> Detection {
        Detection {
            class_id,
            confidence,
            x,
            y,
            width: w,
            height: h,
        }
    }

    /// Builds a `(4 + classes, anchors)` head from per-anchor rows.
    fn head(classes: usize, anchors: &[([f32; 4], Vec<f32>)]) -> Array2<f32> {
        let mut preds = Array2::<f32>::zeros((CXYWH_OFFSET + classes, anchors.len()));
        for (a, (bbox, scores)) in anchors.iter().enumerate() {
            for (i, v) in bbox.iter().enumerate() {
                preds[[i, a]] = *v;
            }
            for (c, s) in scores.iter().enumerate() {
                preds[[CXYWH_OFFSET + c, a]] = *s;
            }
        }
        preds
    }

    #[test]
    fn test_iou_of_identical_and_disjoint_boxes() {
        let a = det(0, 0.9, 10., 10., 20., 20.);
        let b = det(0, 0.8, 100., 100., 20., 20.);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_of_degenerate_boxes_is_zero() {
        let a = det(0, 0.9, 10., 10., 0., 0.);
        assert_eq!(a.iou(&a), 0.0);
    }

    #[test]
    fn test_decode_filters_by_confidence() {
        let preds = head(
            3,
            &[
                ([50., 50., 20., 20.], vec![0.1, 0.7, 0.2]),
                ([80., 80., 10., 10.], vec![0.3, 0.2, 0.1]),
            ],
        );
        let out = decode_predictions(preds.view(), 0.6, (1., 1.), (640., 640.));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class_id, 1);
        assert!((out[0].confidence - 0.7).abs() < 1e-6);
        assert_eq!((out[0].x, out[0].y, out[0].width, out[0].height), (40., 40., 20., 20.));
    }

    #[test]
    fn test_decode_scales_and_clamps_to_frame() {
        let preds = head(1, &[([5., 5., 20., 20.], vec![0.9])]);
        let out = decode_predictions(preds.view(), 0.5, (2., 2.), (100., 100.));
        assert_eq!(out.len(), 1);
        // cx=10, w=40 -> [-10, 30] clamped to [0, 30]
        assert_eq!((out[0].x, out[0].y), (0., 0.));
        assert_eq!((out[0].width, out[0].height), (30., 30.));
    }

    #[test]
    fn test_decode_ignores_head_without_classes() {
        let preds = Array2::<f32>::zeros((4, 10));
        assert!(decode_predictions(preds.view(), 0.0, (1., 1.), (10., 10.)).is_empty());
    }

    #[test]
    fn test_nms_suppresses_same_class_overlap() {
        let mut dets = vec![
            det(0, 0.7, 12., 12., 50., 50.),
            det(0, 0.9, 10., 10., 50., 50.),
            det(0, 0.8, 300., 300., 40., 40.),
        ];
        non_max_suppression(&mut dets, 0.5);
        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].confidence, 0.9);
        assert_eq!(dets[1].confidence, 0.8);
    }

    #[test]
    fn test_nms_keeps_overlapping_boxes_of_other_classes() {
        let mut dets = vec![
            det(0, 0.9, 10., 10., 50., 50.),
            det(2, 0.8, 10., 10., 50., 50.),
        ];
        non_max_suppression(&mut dets, 0.5);
        assert_eq!(dets.len(), 2);
    }

    #[test]
    fn test_label_falls_back_for_unknown_class() {
        assert_eq!(det(0, 1., 0., 0., 1., 1.).label(), "person");
        assert_eq!(det(500, 1., 0., 0., 1., 1.).label(), "unknown");
    }

    #[test]
    fn test_draw_detections_marks_frame_in_place() {
        let mut frame = solid_frame(64, 64, (0.0, 0.0, 0.0));
        let dets = [det(0, 0.9, 8., 20., 30., 30.)];
        draw_detections(&mut frame, &dets).unwrap();

        let size = frame.size().unwrap();
        assert_eq!((size.width, size.height), (64, 64));
        assert!(frame.data_bytes().unwrap().iter().any(|&b| b != 0));
    }

    #[test]
    fn test_oversized_input_is_rejected_before_loading() {
        for input_size in [0, MAX_INPUT_SIZE + 32, 4_294_967_264] {
            let result = YoloV8::new(Path::new("yolov8s.onnx"), input_size, 0.6, 0.5);
            assert!(
                matches!(result, Err(DetectorError::InputSize(size)) if size == input_size),
                "input size {} should be rejected",
                input_size
            );
        }
    }

    #[test]
    fn test_missing_model_is_load_error() {
        let result = YoloV8::new(Path::new("definitely_missing_model.onnx"), 640, 0.6, 0.5);
        match result {
            Err(DetectorError::ModelLoad(msg)) => assert!(msg.contains("not found")),
            _ => panic!("Expected a model load error for a missing file."),
        }
    }
}
