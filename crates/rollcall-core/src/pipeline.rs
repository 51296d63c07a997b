//! Batch recognition over a frame sequence (uploaded video, recorded feed).
//!
//! Every `stride`-th frame (1-based) is run through the embedder and each
//! face is matched independently. Results are folded into a [`BatchTally`]
//! one frame at a time; the tally is the only state carried between frames.

use crate::embedder::{Embedder, EmbedderError};
use crate::gallery::EmbeddingGallery;
use crate::matcher::Matcher;
use crate::types::{Candidate, DetectedFace};
use serde::Serialize;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use thiserror::Error;

/// Sampling stride used for uploaded videos.
pub const DEFAULT_BATCH_STRIDE: usize = 15;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("frame stride must be at least 1")]
    InvalidStride,
}

/// Per-identity row of a batch summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentitySummary {
    pub identity_id: String,
    pub count: usize,
    pub avg_confidence: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Sightings {
    count: usize,
    confidence_sum: f64,
}

/// Accumulated batch state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchTally {
    /// Frames pulled from the source, sampled or not.
    pub frames_seen: usize,
    /// Sampled frames whose faces were matched.
    pub frames_scanned: usize,
    /// Sampled frames the source or embedder failed on.
    pub failed_frames: usize,
    /// Faces that matched no identity.
    pub unknown_faces: usize,
    /// Faces whose embedding the matcher refused.
    pub rejected_faces: usize,
    #[serde(skip)]
    per_identity: BTreeMap<String, Sightings>,
}

impl BatchTally {
    /// One row per identity seen, with the mean of its match confidences.
    pub fn summarize(&self) -> Vec<IdentitySummary> {
        self.per_identity
            .iter()
            .map(|(id, s)| IdentitySummary {
                identity_id: id.clone(),
                count: s.count,
                avg_confidence: (s.confidence_sum / s.count as f64) as f32,
            })
            .collect()
    }

    fn skip(mut self) -> Self {
        self.frames_seen += 1;
        self
    }

    fn fail(mut self) -> Self {
        self.frames_seen += 1;
        self.failed_frames += 1;
        self
    }

    fn scan(
        mut self,
        faces: &[DetectedFace],
        matcher: &impl Matcher,
        candidates: &[Candidate],
    ) -> Self {
        self.frames_seen += 1;
        self.frames_scanned += 1;

        for face in faces {
            match matcher.find_best_match(&face.embedding, candidates) {
                Ok(result) => match result.identity_id {
                    Some(id) => {
                        let s = self.per_identity.entry(id).or_default();
                        s.count += 1;
                        s.confidence_sum += f64::from(result.confidence);
                    }
                    None => self.unknown_faces += 1,
                },
                Err(e) => {
                    tracing::warn!(frame = self.frames_seen, error = %e, "face rejected");
                    self.rejected_faces += 1;
                }
            }
        }
        self
    }
}

/// Samples a frame sequence at a fixed stride and aggregates matches.
#[derive(Debug, Clone, Copy)]
pub struct BatchRecognitionPipeline {
    stride: NonZeroUsize,
}

impl BatchRecognitionPipeline {
    pub fn new(stride: usize) -> Result<Self, PipelineError> {
        NonZeroUsize::new(stride)
            .map(|stride| Self { stride })
            .ok_or(PipelineError::InvalidStride)
    }

    pub fn stride(&self) -> usize {
        self.stride.get()
    }

    /// Process frames against the gallery's current snapshot.
    ///
    /// The snapshot is taken once, so concurrent registrations do not
    /// change the candidate set mid-batch.
    pub fn process<E, I>(
        &self,
        frames: I,
        embedder: &mut E,
        matcher: &impl Matcher,
        gallery: &EmbeddingGallery,
    ) -> BatchTally
    where
        E: Embedder,
        I: IntoIterator<Item = Result<E::Frame, EmbedderError>>,
    {
        let candidates = gallery.snapshot();
        if candidates.is_empty() {
            tracing::warn!("gallery is empty; every face will be unknown");
        }
        self.process_candidates(frames, embedder, matcher, &candidates)
    }

    /// Same as [`process`](Self::process) with an explicit candidate set.
    pub fn process_candidates<E, I>(
        &self,
        frames: I,
        embedder: &mut E,
        matcher: &impl Matcher,
        candidates: &[Candidate],
    ) -> BatchTally
    where
        E: Embedder,
        I: IntoIterator<Item = Result<E::Frame, EmbedderError>>,
    {
        let stride = self.stride.get();

        let tally = frames
            .into_iter()
            .enumerate()
            .fold(BatchTally::default(), |tally, (i, frame)| {
                let index = i + 1;
                if index % stride != 0 {
                    return tally.skip();
                }
                match frame.and_then(|f| embedder.extract(&f)) {
                    Ok(faces) => {
                        tracing::debug!(frame = index, faces = faces.len(), "frame scanned");
                        tally.scan(&faces, matcher, candidates)
                    }
                    Err(e) => {
                        tracing::warn!(frame = index, error = %e, "frame skipped");
                        tally.fail()
                    }
                }
            });

        tracing::info!(
            frames_seen = tally.frames_seen,
            frames_scanned = tally.frames_scanned,
            identities = tally.per_identity.len(),
            unknown_faces = tally.unknown_faces,
            "batch complete"
        );
        tally
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::EuclideanMatcher;
    use crate::types::Embedding;

    /// Test embedder: each frame is its list of face vectors; records
    /// which frame numbers were actually extracted.
    #[derive(Default)]
    struct Recording {
        extracted: Vec<u32>,
    }

    impl Embedder for Recording {
        type Frame = (u32, Vec<Vec<f32>>);

        fn extract(&mut self, frame: &Self::Frame) -> Result<Vec<DetectedFace>, EmbedderError> {
            self.extracted.push(frame.0);
            Ok(frame
                .1
                .iter()
                .map(|v| DetectedFace {
                    bbox: None,
                    embedding: Embedding::new(v.clone()),
                })
                .collect())
        }
    }

    fn candidates() -> Vec<Candidate> {
        vec![
            Candidate {
                identity_id: "A".into(),
                embedding: Embedding::new(vec![1.0, 0.0]),
            },
            Candidate {
                identity_id: "B".into(),
                embedding: Embedding::new(vec![0.0, 1.0]),
            },
        ]
    }

    #[test]
    fn test_zero_stride_rejected() {
        assert_eq!(BatchRecognitionPipeline::new(0).unwrap_err(), PipelineError::InvalidStride);
    }

    #[test]
    fn test_stride_selects_multiples_only() {
        let frames = (1..=45u32).map(|n| Ok((n, vec![])));
        let mut embedder = Recording::default();

        let tally = BatchRecognitionPipeline::new(15).unwrap().process_candidates(
            frames,
            &mut embedder,
            &EuclideanMatcher::default(),
            &candidates(),
        );

        assert_eq!(embedder.extracted, vec![15, 30, 45]);
        assert_eq!(tally.frames_scanned, 3);
        assert_eq!(tally.frames_seen, 45);
    }

    #[test]
    fn test_stride_ignores_trailing_partial_window() {
        let frames = (1..=44u32).map(|n| Ok((n, vec![])));
        let mut embedder = Recording::default();

        BatchRecognitionPipeline::new(15).unwrap().process_candidates(
            frames,
            &mut embedder,
            &EuclideanMatcher::default(),
            &candidates(),
        );
        assert_eq!(embedder.extracted, vec![15, 30]);
    }

    #[test]
    fn test_summary_counts_and_averages() {
        let frames = vec![
            Ok((1, vec![vec![1.0, 0.0], vec![0.0, 0.9]])),
            Ok((2, vec![vec![0.8, 0.0]])),
            Ok((3, vec![vec![5.0, 5.0]])),
        ];
        let mut embedder = Recording::default();

        let tally = BatchRecognitionPipeline::new(1).unwrap().process_candidates(
            frames,
            &mut embedder,
            &EuclideanMatcher::new(0.6),
            &candidates(),
        );

        let summary = tally.summarize();
        assert_eq!(summary.len(), 2);

        let a = summary.iter().find(|s| s.identity_id == "A").unwrap();
        assert_eq!(a.count, 2);
        // confidences 100 and 80
        assert!((a.avg_confidence - 90.0).abs() < 1e-3);

        let b = summary.iter().find(|s| s.identity_id == "B").unwrap();
        assert_eq!(b.count, 1);
        assert!((b.avg_confidence - 90.0).abs() < 1e-3);

        assert_eq!(tally.unknown_faces, 1);
    }

    #[test]
    fn test_failed_and_rejected_are_counted_not_fatal() {
        let frames = vec![
            Ok((1, vec![vec![1.0, 0.0]])),
            Err(EmbedderError::ExtractionFailed("decoder".into())),
            Ok((3, vec![vec![f32::NAN, 0.0], vec![1.0, 0.0]])),
        ];
        let mut embedder = Recording::default();

        let tally = BatchRecognitionPipeline::new(1).unwrap().process_candidates(
            frames,
            &mut embedder,
            &EuclideanMatcher::default(),
            &candidates(),
        );

        assert_eq!(tally.failed_frames, 1);
        assert_eq!(tally.rejected_faces, 1);
        assert_eq!(tally.frames_scanned, 2);
        assert_eq!(tally.summarize()[0].count, 2);
    }

    #[test]
    fn test_empty_gallery_puts_every_face_in_unknown() {
        let frames = vec![Ok((1, vec![vec![1.0, 0.0], vec![0.0, 1.0]]))];
        let mut embedder = Recording::default();

        let tally = BatchRecognitionPipeline::new(1).unwrap().process_candidates(
            frames,
            &mut embedder,
            &EuclideanMatcher::default(),
            &[],
        );
        assert!(tally.summarize().is_empty());
        assert_eq!(tally.unknown_faces, 2);
    }
}
