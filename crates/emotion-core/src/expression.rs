//! Facial expression classifier via ONNX Runtime.
//!
//! Crops each detected face from the grayscale frame, resamples it to the
//! classifier input and turns the seven outputs into normalized scores.

use crate::frame::GrayFrame;
use crate::types::{BoundingBox, EmotionLabel, ExpressionScores};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

pub const EXPRESSION_MODEL_FILE: &str = "face_expression.onnx";

const INPUT_SIZE: u32 = 64;
/// Extra context around the detector box, as a fraction of its longer side.
const CROP_MARGIN: f32 = 0.1;
const PROBABILITY_TOLERANCE: f32 = 1e-3;

#[derive(Error, Debug)]
pub enum ExpressionError {
    #[error("model file not found: {0}; place the expression model in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face box lies outside the {width}x{height} frame")]
    EmptyCrop { width: u32, height: u32 },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Seven-way facial expression classifier.
pub struct ExpressionClassifier {
    session: Session,
}

impl ExpressionClassifier {
    /// Load the expression ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, ExpressionError> {
        if !model_path.exists() {
            return Err(ExpressionError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(crate::SESSION_INTRA_THREADS)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded expression model"
        );

        Ok(Self { session })
    }

    /// Score the expression of one detected face.
    pub fn classify(
        &mut self,
        frame: &GrayFrame,
        face: &BoundingBox,
    ) -> Result<ExpressionScores, ExpressionError> {
        let crop = crop_face(frame, face).ok_or(ExpressionError::EmptyCrop {
            width: frame.width,
            height: frame.height,
        })?;
        let input = to_tensor(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExpressionError::InferenceFailed(format!("expression output: {e}")))?;

        if raw.len() != EmotionLabel::ALL.len() {
            return Err(ExpressionError::InferenceFailed(format!(
                "expected {} expression scores, got {}",
                EmotionLabel::ALL.len(),
                raw.len()
            )));
        }

        let probabilities = normalize(raw);
        ExpressionScores::from_slice(&probabilities)
            .ok_or_else(|| ExpressionError::InferenceFailed("score length mismatch".into()))
    }
}

/// Square crop around the face box, clamped to the frame, resized to the
/// classifier input. `None` when nothing of the box overlaps the frame.
fn crop_face(frame: &GrayFrame, face: &BoundingBox) -> Option<GrayImage> {
    let view = frame.view()?;
    let side = face.width.max(face.height) * (1.0 + 2.0 * CROP_MARGIN);
    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0;

    let x0 = (cx - side / 2.0).floor().max(0.0) as u32;
    let y0 = (cy - side / 2.0).floor().max(0.0) as u32;
    let x1 = ((cx + side / 2.0).ceil().max(0.0) as u32).min(frame.width);
    let y1 = ((cy + side / 2.0).ceil().max(0.0) as u32).min(frame.height);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    let region = imageops::crop_imm(&view, x0, y0, x1 - x0, y1 - y0);
    Some(imageops::resize(&*region, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle))
}

/// 1×1×64×64 tensor with pixels scaled to [0, 1].
fn to_tensor(crop: &GrayImage) -> Array4<f32> {
    let size = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 1, size, size));
    for (x, y, pixel) in crop.enumerate_pixels() {
        tensor[[0, 0, y as usize, x as usize]] = pixel[0] as f32 / 255.0;
    }
    tensor
}

/// Pass probabilities through untouched, softmax anything else (logits).
fn normalize(raw: &[f32]) -> Vec<f32> {
    let in_range = raw.iter().all(|v| (0.0..=1.0).contains(v));
    let sum: f32 = raw.iter().sum();
    if in_range && (sum - 1.0).abs() <= PROBABILITY_TOLERANCE {
        return raw.to_vec();
    }

    let max = raw.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = raw.iter().map(|v| (v - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}
