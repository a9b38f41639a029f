//! Reduction of per-face expression scores to a single response.

use crate::types::{DetectedFace, EmotionResult};

/// Summarize detections into an [`EmotionResult`].
///
/// Only the first face contributes the emotion; the rest are counted.
/// Confidence is the dominant score as a rounded percentage.
pub fn summarize(faces: &[DetectedFace]) -> EmotionResult {
    let Some(first) = faces.first() else {
        return EmotionResult::no_faces();
    };

    let (emotion, score) = first.expressions.dominant();

    EmotionResult {
        faces_found: faces.len(),
        emotion: Some(emotion),
        confidence_percent: Some(to_percent(score)),
    }
}

fn to_percent(score: f32) -> u8 {
    (score * 100.0).round().clamp(0.0, 100.0) as u8
}
