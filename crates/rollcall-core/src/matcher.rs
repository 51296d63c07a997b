//! Nearest-neighbor matching of query embeddings against a gallery snapshot.

use crate::types::{
    confidence_from_distance, Candidate, Embedding, EmbeddingError, MatchResult, NoMatchReason,
    Verification,
};
use thiserror::Error;

/// Distance threshold used by the dlib face descriptor.
pub const DEFAULT_TOLERANCE: f32 = 0.6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("bad query embedding: {0}")]
    BadEmbedding(#[from] EmbeddingError),
    #[error("bad gallery embedding for {identity_id}: {source}")]
    BadCandidate {
        identity_id: String,
        source: EmbeddingError,
    },
}

/// Strategy for comparing a query embedding against a gallery of enrolled faces.
pub trait Matcher {
    /// Best candidate for `query`, or a no-match result carrying the reason.
    fn find_best_match(
        &self,
        query: &Embedding,
        candidates: &[Candidate],
    ) -> Result<MatchResult, MatchError>;

    /// Compare `query` against exactly one stored vector.
    fn verify(&self, query: &Embedding, stored: &Embedding) -> Result<Verification, MatchError>;

    /// Match every face of a frame independently. Two faces may resolve to
    /// the same identity; that is reported as-is.
    fn match_multi(
        &self,
        queries: &[Embedding],
        candidates: &[Candidate],
    ) -> Result<Vec<MatchResult>, MatchError> {
        queries
            .iter()
            .map(|q| self.find_best_match(q, candidates))
            .collect()
    }
}

/// Euclidean nearest-neighbor matcher with a fixed acceptance tolerance.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    tolerance: f32,
}

impl EuclideanMatcher {
    pub fn new(tolerance: f32) -> Self {
        Self { tolerance }
    }

    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE)
    }
}

impl Matcher for EuclideanMatcher {
    fn find_best_match(
        &self,
        query: &Embedding,
        candidates: &[Candidate],
    ) -> Result<MatchResult, MatchError> {
        query.validate(None)?;

        if candidates.is_empty() {
            return Ok(MatchResult::empty_gallery());
        }

        // The gallery's dimension is set by its first row; a query that
        // disagrees with it is the caller's error, not the gallery's.
        let dim = candidates[0].embedding.len();
        query.validate(Some(dim))?;

        let mut best_distance = f32::INFINITY;
        let mut best_idx = 0usize;

        // Full scan; strict `<` keeps the first-seen candidate on ties.
        for (i, candidate) in candidates.iter().enumerate() {
            candidate
                .embedding
                .validate(Some(dim))
                .map_err(|source| MatchError::BadCandidate {
                    identity_id: candidate.identity_id.clone(),
                    source,
                })?;

            let distance = query.euclidean_distance(&candidate.embedding);
            if distance < best_distance || i == 0 {
                best_distance = distance;
                best_idx = i;
            }
        }

        let confidence = confidence_from_distance(best_distance);

        if best_distance <= self.tolerance {
            Ok(MatchResult {
                identity_id: Some(candidates[best_idx].identity_id.clone()),
                distance: best_distance,
                confidence,
                reason: None,
            })
        } else {
            Ok(MatchResult {
                identity_id: None,
                distance: best_distance,
                confidence,
                reason: Some(NoMatchReason::AboveTolerance),
            })
        }
    }

    fn verify(&self, query: &Embedding, stored: &Embedding) -> Result<Verification, MatchError> {
        stored.validate(None)?;
        query.validate(Some(stored.len()))?;

        let distance = query.euclidean_distance(stored);
        Ok(Verification {
            is_match: distance <= self.tolerance,
            distance,
            confidence: confidence_from_distance(distance),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DEFAULT_EMBEDDING_DIM;

    fn unit(dim: usize, hot: usize) -> Embedding {
        let mut values = vec![0.0; dim];
        values[hot] = 1.0;
        Embedding::new(values)
    }

    fn candidate(id: &str, embedding: Embedding) -> Candidate {
        Candidate {
            identity_id: id.into(),
            embedding,
        }
    }

    #[test]
    fn test_identical_vector_matches_with_full_confidence() {
        let v = unit(DEFAULT_EMBEDDING_DIM, 0);
        let gallery = vec![candidate("S1", v.clone())];

        let result = EuclideanMatcher::default().find_best_match(&v, &gallery).unwrap();
        assert_eq!(result.identity_id.as_deref(), Some("S1"));
        assert_eq!(result.distance, 0.0);
        assert_eq!(result.confidence, 100.0);
        assert!(result.reason.is_none());
    }

    #[test]
    fn test_far_vector_is_rejected_with_confidence_reported() {
        let gallery = vec![candidate("S1", unit(DEFAULT_EMBEDDING_DIM, 0))];
        let zeros = Embedding::new(vec![0.0; DEFAULT_EMBEDDING_DIM]);

        let result = EuclideanMatcher::new(0.6).find_best_match(&zeros, &gallery).unwrap();
        assert!(!result.is_match());
        assert!((result.distance - 1.0).abs() < 1e-6);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.reason, Some(NoMatchReason::AboveTolerance));
    }

    #[test]
    fn test_close_but_rejected_keeps_confidence() {
        let gallery = vec![candidate("S1", Embedding::new(vec![0.0, 0.0]))];
        let query = Embedding::new(vec![0.7, 0.0]);

        let result = EuclideanMatcher::new(0.6).find_best_match(&query, &gallery).unwrap();
        assert!(!result.is_match());
        assert!((result.confidence - 30.0).abs() < 1e-3);
    }

    #[test]
    fn test_empty_gallery() {
        let result = EuclideanMatcher::default()
            .find_best_match(&Embedding::new(vec![1.0, 0.0]), &[])
            .unwrap();
        assert!(!result.is_match());
        assert_eq!(result.distance, f32::INFINITY);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.message(), "empty gallery");
    }

    #[test]
    fn test_global_minimum_is_selected() {
        // Best match is the last entry; every candidate must be visited.
        let query = Embedding::new(vec![1.0, 0.0, 0.0]);
        let gallery = vec![
            candidate("decoy1", Embedding::new(vec![0.5, 0.2, 0.0])),
            candidate("decoy2", Embedding::new(vec![0.8, 0.3, 0.0])),
            candidate("match", Embedding::new(vec![0.95, 0.05, 0.0])),
        ];

        let result = EuclideanMatcher::new(0.6).find_best_match(&query, &gallery).unwrap();
        assert_eq!(result.identity_id.as_deref(), Some("match"));
        for c in &gallery {
            assert!(result.distance <= query.euclidean_distance(&c.embedding));
        }
    }

    #[test]
    fn test_tie_goes_to_first_seen() {
        let query = Embedding::new(vec![0.0, 0.0]);
        let gallery = vec![
            candidate("first", Embedding::new(vec![0.1, 0.0])),
            candidate("second", Embedding::new(vec![0.0, 0.1])),
        ];

        let result = EuclideanMatcher::default().find_best_match(&query, &gallery).unwrap();
        assert_eq!(result.identity_id.as_deref(), Some("first"));
    }

    #[test]
    fn test_nan_query_rejected_before_distance_math() {
        let gallery = vec![candidate("S1", Embedding::new(vec![0.0, 0.0]))];
        let query = Embedding::new(vec![f32::NAN, 0.0]);

        let err = EuclideanMatcher::default().find_best_match(&query, &gallery).unwrap_err();
        assert_eq!(err, MatchError::BadEmbedding(EmbeddingError::NonFinite { index: 0 }));
    }

    #[test]
    fn test_wrong_size_query_is_a_bad_embedding() {
        let gallery = vec![candidate("S1", unit(DEFAULT_EMBEDDING_DIM, 0))];
        let query = unit(DEFAULT_EMBEDDING_DIM - 1, 0);

        let err = EuclideanMatcher::default().find_best_match(&query, &gallery).unwrap_err();
        assert_eq!(
            err,
            MatchError::BadEmbedding(EmbeddingError::WrongDimension {
                expected: DEFAULT_EMBEDDING_DIM,
                actual: DEFAULT_EMBEDDING_DIM - 1,
            })
        );
    }

    #[test]
    fn test_inconsistent_gallery_row_is_a_bad_candidate() {
        let gallery = vec![
            candidate("S1", Embedding::new(vec![0.0; 3])),
            candidate("S2", Embedding::new(vec![0.0; 2])),
        ];
        let query = Embedding::new(vec![0.0; 3]);

        let err = EuclideanMatcher::default().find_best_match(&query, &gallery).unwrap_err();
        assert!(matches!(
            err,
            MatchError::BadCandidate { ref identity_id, .. } if identity_id == "S2"
        ));
    }

    #[test]
    fn test_verify() {
        let matcher = EuclideanMatcher::new(0.5);
        let stored = Embedding::new(vec![0.0, 0.0]);

        let same = matcher.verify(&Embedding::new(vec![0.3, 0.0]), &stored).unwrap();
        assert!(same.is_match);
        assert!((same.confidence - 70.0).abs() < 1e-3);

        let other = matcher.verify(&Embedding::new(vec![0.0, 0.9]), &stored).unwrap();
        assert!(!other.is_match);
        assert!((other.distance - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_match_multi_no_cross_suppression() {
        let gallery = vec![
            candidate("A", Embedding::new(vec![1.0, 0.0])),
            candidate("B", Embedding::new(vec![0.0, 1.0])),
        ];
        let faces = vec![
            Embedding::new(vec![0.98, 0.0]),
            Embedding::new(vec![1.0, 0.02]),
            Embedding::new(vec![-3.0, -3.0]),
        ];

        let results = EuclideanMatcher::default().match_multi(&faces, &gallery).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].identity_id.as_deref(), Some("A"));
        assert_eq!(results[1].identity_id.as_deref(), Some("A"));
        assert!(!results[2].is_match());
    }
}
