//! SCRFD face detector via ONNX Runtime.
//!
//! Runs an SCRFD model (anchor-free, three strides) over a letterboxed copy of
//! the frame and maps detections back to frame coordinates after NMS.

use crate::frame::GrayFrame;
use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INPUT_SIZE: usize = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_IOU_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; place the SCRFD export in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame buffer does not match {width}x{height}")]
    InvalidFrame { width: u32, height: u32 },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Speed/accuracy trade-off of the detector, selected by model file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectorVariant {
    /// SCRFD 500M: small and fast, the variant the service runs.
    #[default]
    Fast,
    /// SCRFD 10G: slower, better on small or occluded faces.
    Accurate,
}

impl DetectorVariant {
    pub fn model_file(&self) -> &'static str {
        match self {
            DetectorVariant::Fast => "det_500m.onnx",
            DetectorVariant::Accurate => "det_10g.onnx",
        }
    }
}

/// Letterbox geometry used to undo the resize on decoded coordinates.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, target: usize) -> (Self, u32, u32) {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, target as u32);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, target as u32);
        let pad_x = ((target as u32 - new_w) / 2) as f32;
        let pad_y = ((target as u32 - new_h) / 2) as f32;
        (Self { scale, pad_x, pad_y }, new_w, new_h)
    }

    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// (score, bbox, kps) output positions for one stride.
type StrideOutputs = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    variant: DetectorVariant,
    outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path, variant: DetectorVariant) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(crate::SESSION_INTRA_THREADS)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps per stride), model has {}",
                names.len()
            )));
        }

        let outputs = output_layout(&names);
        tracing::info!(
            path = %model_path.display(),
            ?variant,
            outputs = ?names,
            "loaded SCRFD model"
        );

        Ok(Self { session, variant, outputs })
    }

    pub fn variant(&self) -> DetectorVariant {
        self.variant
    }

    /// Detect faces, strongest first.
    pub fn detect(&mut self, frame: &GrayFrame) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = preprocess(frame)?;

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.outputs[slot];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(score_idx, "scores")?;
            let boxes = extract(bbox_idx, "boxes")?;
            let kps = extract(kps_idx, "landmarks")?;

            candidates.extend(decode_stride(scores, boxes, kps, stride, &letterbox));
        }

        let faces = nms(candidates, NMS_IOU_THRESHOLD);
        tracing::debug!(faces = faces.len(), "SCRFD detections after NMS");
        Ok(faces)
    }
}

/// Letterbox the frame into a 640×640 NCHW tensor, gray replicated to 3 channels.
fn preprocess(frame: &GrayFrame) -> Result<(Array4<f32>, Letterbox), DetectorError> {
    let view = frame.view().ok_or(DetectorError::InvalidFrame {
        width: frame.width,
        height: frame.height,
    })?;
    let (letterbox, new_w, new_h) = Letterbox::fit(frame.width, frame.height, INPUT_SIZE);
    let resized = imageops::resize(&view, new_w, new_h, FilterType::Triangle);

    // Padding is filled with the mean so it normalizes to zero.
    let mut tensor = Array4::<f32>::zeros((1, 3, INPUT_SIZE, INPUT_SIZE));
    let (x0, y0) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    for y in 0..INPUT_SIZE {
        for x in 0..INPUT_SIZE {
            let inside = x >= x0 && y >= y0 && x < x0 + new_w as usize && y < y0 + new_h as usize;
            let pixel = if inside {
                resized.get_pixel((x - x0) as u32, (y - y0) as u32)[0] as f32
            } else {
                PIXEL_MEAN
            };
            let v = (pixel - PIXEL_MEAN) / PIXEL_STD;
            for c in 0..3 {
                tensor[[0, c, y, x]] = v;
            }
        }
    }

    Ok((tensor, letterbox))
}

/// Map output names to stride slots.
///
/// Exports either name tensors `score_8`, `bbox_16`, `kps_32`, ... or use
/// numeric names in the conventional order: scores, then boxes, then
/// landmarks, each for strides 8/16/32.
fn output_layout(names: &[String]) -> [StrideOutputs; 3] {
    let position = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let named: Option<Vec<StrideOutputs>> = STRIDES
        .iter()
        .map(|&s| Some((position("score", s)?, position("bbox", s)?, position("kps", s)?)))
        .collect();

    match named {
        Some(found) => [found[0], found[1], found[2]],
        None => {
            tracing::debug!(?names, "SCRFD outputs unnamed, using positional layout");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Decode the anchors of one stride that clear the score threshold.
fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
) -> Vec<BoundingBox> {
    let grid_w = INPUT_SIZE / stride;
    let grid_h = INPUT_SIZE / stride;
    let step = stride as f32;

    (0..grid_w * grid_h * ANCHORS_PER_CELL)
        .filter_map(|idx| {
            let score = *scores.get(idx)?;
            if score <= SCORE_THRESHOLD {
                return None;
            }
            let cell = idx / ANCHORS_PER_CELL;
            let cx = (cell % grid_w) as f32 * step;
            let cy = (cell / grid_w) as f32 * step;

            let d = boxes.get(idx * 4..idx * 4 + 4)?;
            let (x1, y1) = letterbox.unmap(cx - d[0] * step, cy - d[1] * step);
            let (x2, y2) = letterbox.unmap(cx + d[2] * step, cy + d[3] * step);

            let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
                std::array::from_fn(|i| letterbox.unmap(cx + k[i * 2] * step, cy + k[i * 2 + 1] * step))
            });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; output is sorted by confidence.
fn nms(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
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
    if union > 0.0 { inter / union } else { 0.0 }
}
