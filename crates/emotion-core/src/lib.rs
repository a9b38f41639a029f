//! emotion-core: face detection and expression recognition engine.
//!
//! Uses SCRFD for face detection and a seven-class expression classifier,
//! both running via ONNX Runtime for CPU inference.

pub mod detector;
pub mod expression;
pub mod frame;
pub mod pipeline;
pub mod reduce;
pub mod types;

use std::path::PathBuf;

pub use detector::DetectorVariant;
pub use frame::GrayFrame;
pub use pipeline::{ExpressionModel, FacePipeline, ModelArtifacts, PipelineError};
pub use reduce::summarize;
pub use types::{BoundingBox, DetectedFace, EmotionLabel, EmotionResult, ExpressionScores};

/// ONNX Runtime intra-op threads per session. Parallelism comes from running
/// one pipeline per engine worker, one worker per core.
pub const SESSION_INTRA_THREADS: usize = 1;

/// Model directory used when none is configured, relative to the working directory.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}
