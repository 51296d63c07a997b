use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dimensionality of the dlib ResNet face descriptor the embedder emits.
pub const DEFAULT_EMBEDDING_DIM: usize = 128;

/// A vector that cannot take part in distance math.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding is empty")]
    Empty,
    #[error("wrong embedding dimension: expected {expected}, got {actual}")]
    WrongDimension { expected: usize, actual: usize },
    #[error("embedding has a non-finite value at index {index}")]
    NonFinite { index: usize },
}

/// Bounding box for a detected face, in source-frame pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector score, when the embedder reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Face embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Check the vector is usable: non-empty, all values finite, and
    /// `expected_dim` long when a dimension is given.
    pub fn validate(&self, expected_dim: Option<usize>) -> Result<(), EmbeddingError> {
        if self.values.is_empty() {
            return Err(EmbeddingError::Empty);
        }
        if let Some(expected) = expected_dim {
            if self.values.len() != expected {
                return Err(EmbeddingError::WrongDimension {
                    expected,
                    actual: self.values.len(),
                });
            }
        }
        match self.values.iter().position(|v| !v.is_finite()) {
            Some(index) => Err(EmbeddingError::NonFinite { index }),
            None => Ok(()),
        }
    }

    /// Euclidean (L2) distance. Lower = more similar.
    ///
    /// Callers must have validated both sides to the same dimension;
    /// extra trailing values on the longer side are ignored.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// One face as reported by the external embedder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
    pub embedding: Embedding,
}

/// A stored reference embedding, as handed out by the gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub identity_id: String,
    pub embedding: Embedding,
    pub created_at: DateTime<Utc>,
}

/// One row of a matching snapshot: an identity and one of its samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub identity_id: String,
    pub embedding: Embedding,
}

/// Why a query did not resolve to an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoMatchReason {
    /// Nothing is registered; there was nothing to compare against.
    EmptyGallery,
    /// The nearest candidate is farther than the tolerance.
    AboveTolerance,
}

impl NoMatchReason {
    pub fn message(&self) -> &'static str {
        match self {
            NoMatchReason::EmptyGallery => "empty gallery",
            NoMatchReason::AboveTolerance => "no matching face within tolerance",
        }
    }
}

/// Result of matching a query embedding against a gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Matched identity; `None` when nothing is within tolerance.
    pub identity_id: Option<String>,
    /// Distance to the nearest candidate (`INFINITY` for an empty gallery).
    pub distance: f32,
    /// Confidence in [0, 100], derived from `distance`.
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<NoMatchReason>,
}

impl MatchResult {
    pub fn empty_gallery() -> Self {
        Self {
            identity_id: None,
            distance: f32::INFINITY,
            confidence: 0.0,
            reason: Some(NoMatchReason::EmptyGallery),
        }
    }

    pub fn is_match(&self) -> bool {
        self.identity_id.is_some()
    }

    pub fn message(&self) -> &'static str {
        match self.reason {
            Some(reason) => reason.message(),
            None => "match",
        }
    }
}

/// Outcome of a 1:1 comparison against a claimed identity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Verification {
    pub is_match: bool,
    pub distance: f32,
    pub confidence: f32,
}

/// Map a distance to a confidence percentage: `(1 - d) * 100` clamped to [0, 100].
pub fn confidence_from_distance(distance: f32) -> f32 {
    ((1.0 - distance) * 100.0).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Embedding::new(vec![0.3, -0.2, 0.9]);
        assert_eq!(a.euclidean_distance(&a.clone()), 0.0);
    }

    #[test]
    fn test_euclidean_distance_known() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_validate_rejects_wrong_dimension() {
        let e = Embedding::new(vec![1.0; 4]);
        assert_eq!(
            e.validate(Some(128)),
            Err(EmbeddingError::WrongDimension { expected: 128, actual: 4 })
        );
        assert!(e.validate(None).is_ok());
    }

    #[test]
    fn test_validate_rejects_non_finite() {
        let nan = Embedding::new(vec![0.1, f32::NAN, 0.2]);
        assert_eq!(nan.validate(None), Err(EmbeddingError::NonFinite { index: 1 }));

        let inf = Embedding::new(vec![f32::INFINITY]);
        assert_eq!(inf.validate(None), Err(EmbeddingError::NonFinite { index: 0 }));
    }

    #[test]
    fn test_validate_rejects_empty() {
        assert_eq!(Embedding::new(vec![]).validate(None), Err(EmbeddingError::Empty));
    }

    #[test]
    fn test_confidence_clamped() {
        assert_eq!(confidence_from_distance(0.0), 100.0);
        assert!((confidence_from_distance(0.4) - 60.0).abs() < 1e-4);
        assert_eq!(confidence_from_distance(1.7), 0.0);
        assert_eq!(confidence_from_distance(f32::INFINITY), 0.0);
    }

    #[test]
    fn test_embedding_serializes_as_bare_array() {
        let e = Embedding::new(vec![1.0, 2.5]);
        assert_eq!(serde_json::to_string(&e).unwrap(), "[1.0,2.5]");
    }
}
