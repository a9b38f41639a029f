//! Face detection followed by per-face expression classification.

use crate::detector::{DetectorError, DetectorVariant, FaceDetector};
use crate::expression::{ExpressionClassifier, ExpressionError, EXPRESSION_MODEL_FILE};
use crate::frame::GrayFrame;
use crate::types::DetectedFace;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("expression error: {0}")]
    Expression(#[from] ExpressionError),
}

/// Anything that turns a frame into faces with expression scores.
///
/// Implementations own their inference sessions and need exclusive access
/// while running, hence `&mut self`.
pub trait ExpressionModel: Send {
    fn analyze(&mut self, frame: &GrayFrame) -> Result<Vec<DetectedFace>, PipelineError>;
}

/// On-disk model files the pipeline loads from.
#[derive(Debug, Clone)]
pub struct ModelArtifacts {
    pub detector: PathBuf,
    pub expression: PathBuf,
    pub variant: DetectorVariant,
}

impl ModelArtifacts {
    pub fn in_dir(model_dir: &Path, variant: DetectorVariant) -> Self {
        Self {
            detector: model_dir.join(variant.model_file()),
            expression: model_dir.join(EXPRESSION_MODEL_FILE),
            variant,
        }
    }

    /// Artifacts that are not present on disk.
    pub fn missing(&self) -> Vec<&Path> {
        [self.detector.as_path(), self.expression.as_path()]
            .into_iter()
            .filter(|p| !p.is_file())
            .collect()
    }
}

/// SCRFD detection plus expression classification of every detected face.
pub struct FacePipeline {
    detector: FaceDetector,
    classifier: ExpressionClassifier,
}

impl FacePipeline {
    /// Load both models; fails if either is missing or cannot be parsed.
    pub fn load(artifacts: &ModelArtifacts) -> Result<Self, PipelineError> {
        let detector = FaceDetector::load(&artifacts.detector, artifacts.variant)?;
        let classifier = ExpressionClassifier::load(&artifacts.expression)?;
        Ok(Self { detector, classifier })
    }

    pub fn variant(&self) -> DetectorVariant {
        self.detector.variant()
    }
}

impl ExpressionModel for FacePipeline {
    fn analyze(&mut self, frame: &GrayFrame) -> Result<Vec<DetectedFace>, PipelineError> {
        let boxes = self.detector.detect(frame)?;

        let mut faces = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            let expressions = self.classifier.classify(frame, &bbox)?;
            faces.push(DetectedFace { bbox, expressions });
        }
        Ok(faces)
    }
}
