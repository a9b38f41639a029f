use serde::{Deserialize, Serialize};
use std::fmt;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// One of the seven expression classes the classifier emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmotionLabel {
    Neutral,
    Happy,
    Sad,
    Angry,
    Fearful,
    Disgusted,
    Surprised,
}

impl EmotionLabel {
    /// Declared label order. Classifier outputs follow it and argmax ties
    /// resolve to the earliest entry.
    pub const ALL: [EmotionLabel; 7] = [
        EmotionLabel::Neutral,
        EmotionLabel::Happy,
        EmotionLabel::Sad,
        EmotionLabel::Angry,
        EmotionLabel::Fearful,
        EmotionLabel::Disgusted,
        EmotionLabel::Surprised,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmotionLabel::Neutral => "neutral",
            EmotionLabel::Happy => "happy",
            EmotionLabel::Sad => "sad",
            EmotionLabel::Angry => "angry",
            EmotionLabel::Fearful => "fearful",
            EmotionLabel::Disgusted => "disgusted",
            EmotionLabel::Surprised => "surprised",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for EmotionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-label expression scores for one face, stored in [`EmotionLabel::ALL`] order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExpressionScores {
    values: [f32; 7],
}

impl ExpressionScores {
    /// Build from scores listed in declared label order.
    ///
    /// Values are clamped into [0, 1]; NaN and infinities become 0.
    pub fn new(values: [f32; 7]) -> Self {
        Self {
            values: values.map(|v| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 }),
        }
    }

    /// Build from a slice; `None` unless it holds exactly seven values.
    pub fn from_slice(values: &[f32]) -> Option<Self> {
        let values: [f32; 7] = values.try_into().ok()?;
        Some(Self::new(values))
    }

    /// All-zero scores except one label set to 1.0.
    pub fn one_hot(label: EmotionLabel) -> Self {
        let mut values = [0.0; 7];
        values[label.index()] = 1.0;
        Self { values }
    }

    pub fn get(&self, label: EmotionLabel) -> f32 {
        self.values[label.index()]
    }

    /// Iterate `(label, score)` pairs in declared label order.
    pub fn iter(&self) -> impl Iterator<Item = (EmotionLabel, f32)> + '_ {
        EmotionLabel::ALL.iter().copied().zip(self.values.iter().copied())
    }

    /// Label with the strictly highest score; ties go to the earlier label.
    pub fn dominant(&self) -> (EmotionLabel, f32) {
        let mut best = (EmotionLabel::ALL[0], self.values[0]);
        for (label, score) in self.iter().skip(1) {
            if score > best.1 {
                best = (label, score);
            }
        }
        best
    }
}

/// A face found by the detector together with its expression scores.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub expressions: ExpressionScores,
}

/// Response body of the photo endpoint.
///
/// Field names are part of the public HTTP contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmotionResult {
    #[serde(rename = "facesEncontradas")]
    pub faces_found: usize,
    #[serde(rename = "emocao", skip_serializing_if = "Option::is_none")]
    pub emotion: Option<EmotionLabel>,
    #[serde(rename = "confianca", skip_serializing_if = "Option::is_none")]
    pub confidence_percent: Option<u8>,
}

impl EmotionResult {
    pub fn no_faces() -> Self {
        Self {
            faces_found: 0,
            emotion: None,
            confidence_percent: None,
        }
    }
}
