//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes an RGB image into the 640x640 network input, decodes the
//! anchor-free score/bbox heads at strides 8/16/32 and suppresses overlaps.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Detections at or below this score are discarded.
pub const MIN_DETECTION_CONFIDENCE: f32 = 0.5;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download the SCRFD pack from insightface and place it in the model dir")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("unknown model variant '{0}' (expected 'fast' or 'accurate')")]
    UnknownVariant(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Capability to find faces in an image.
///
/// Implementations return boxes in pixel coordinates, sorted by descending
/// confidence, with nothing at or below [`MIN_DETECTION_CONFIDENCE`].
pub trait FaceDetector: Send {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;

    /// Tag identifying the detector and version stored alongside each signature.
    fn algorithm(&self) -> &str;
}

impl<T: FaceDetector + ?Sized> FaceDetector for Box<T> {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        (**self).detect(image)
    }

    fn algorithm(&self) -> &str {
        (**self).algorithm()
    }
}

/// Which SCRFD model to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelVariant {
    /// det_500m: lightweight, the default.
    #[default]
    Fast,
    /// det_10g: slower, more robust to pose and scale.
    Accurate,
}

impl ModelVariant {
    pub fn file_name(self) -> &'static str {
        match self {
            ModelVariant::Fast => "det_500m.onnx",
            ModelVariant::Accurate => "det_10g.onnx",
        }
    }

    fn model_name(self) -> &'static str {
        match self {
            ModelVariant::Fast => "det_500m",
            ModelVariant::Accurate => "det_10g",
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelVariant::Fast => f.write_str("fast"),
            ModelVariant::Accurate => f.write_str("accurate"),
        }
    }
}

impl FromStr for ModelVariant {
    type Err = DetectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(ModelVariant::Fast),
            "accurate" => Ok(ModelVariant::Accurate),
            other => Err(DetectorError::UnknownVariant(other.to_string())),
        }
    }
}

/// Scale and padding applied when fitting an image into the network input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> (Self, u32, u32) {
        let scale = (SCRFD_INPUT_SIZE as f32 / width as f32)
            .min(SCRFD_INPUT_SIZE as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
        let letterbox = Letterbox {
            scale,
            pad_x: (SCRFD_INPUT_SIZE - new_w) / 2,
            pad_y: (SCRFD_INPUT_SIZE - new_h) / 2,
        };
        (letterbox, new_w, new_h)
    }

    /// Map a point in network input space back to the source image.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputs = (usize, usize);

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    stride_outputs: [StrideOutputs; 3],
    algorithm: String,
}

impl ScrfdDetector {
    /// Load the SCRFD model for `variant` from `model_dir`.
    pub fn load(model_dir: &Path, variant: ModelVariant) -> Result<Self, DetectorError> {
        let model_path = model_dir.join(variant.file_name());
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(
                model_path.to_string_lossy().into_owned(),
            ));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(&model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires score and bbox outputs for 3 strides, got {} outputs",
                output_names.len()
            )));
        }

        let stride_outputs = map_outputs(&output_names);
        tracing::info!(
            path = %model_path.display(),
            %variant,
            outputs = ?output_names,
            ?stride_outputs,
            "loaded SCRFD model"
        );

        Ok(Self {
            session,
            stride_outputs,
            algorithm: format!("scrfd-{}/bbox-v1", variant.model_name()),
        })
    }

    fn preprocess(image: &RgbImage) -> (Array4<f32>, Letterbox) {
        let (letterbox, new_w, new_h) = Letterbox::fit(image.width(), image.height());
        let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

        let size = SCRFD_INPUT_SIZE as usize;
        // Zero is the normalized value of SCRFD_MEAN, so padding needs no fill.
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let tx = (x + letterbox.pad_x) as usize;
            let ty = (y + letterbox.pad_y) as usize;
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }

        (tensor, letterbox)
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = Self::preprocess(image);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_outputs[pos];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            candidates.extend(decode_stride(scores, bboxes, stride, &letterbox));
        }

        let faces = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = faces.len(), "SCRFD detection complete");
        Ok(faces)
    }

    fn algorithm(&self) -> &str {
        &self.algorithm
    }
}

/// Resolve which outputs hold each stride's scores and boxes.
///
/// Exports either name their heads ("score_8", "bbox_16", ...) or use opaque
/// numeric names in the standard order: scores 8/16/32, then bboxes 8/16/32.
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |head: &str, stride: usize| {
        let target = format!("{head}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let mut mapped = [(0usize, 0usize); 3];
    for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride)) {
            (Some(score), Some(bbox)) => mapped[slot] = (score, bbox),
            _ => return [(0, 3), (1, 4), (2, 5)],
        }
    }
    mapped
}

/// Decode the detections above the confidence floor for one stride.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    letterbox: &Letterbox,
) -> Vec<BoundingBox> {
    let grid_w = SCRFD_INPUT_SIZE as usize / stride;
    let s = stride as f32;

    scores
        .iter()
        .enumerate()
        .filter(|(_, score)| **score > MIN_DETECTION_CONFIDENCE)
        .filter_map(|(idx, &score)| {
            let offsets = bboxes.get(idx * 4..idx * 4 + 4)?;
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid_w) as f32 * s;
            let cy = (cell / grid_w) as f32 * s;

            let (x1, y1) = letterbox.unmap(cx - offsets[0] * s, cy - offsets[1] * s);
            let (x2, y2) = letterbox.unmap(cx + offsets[2] * s, cy + offsets[3] * s);

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression. Output is sorted by descending confidence.
fn nms(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in boxes {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
