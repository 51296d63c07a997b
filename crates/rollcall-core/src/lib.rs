//! rollcall-core: identity gallery, face matching, and recognition pipelines.
//!
//! Embedding extraction is an external collaborator (see [`embedder`]);
//! this crate works on the fixed-length vectors it produces.

pub mod config;
pub mod debounce;
pub mod embedder;
pub mod gallery;
pub mod matcher;
pub mod pipeline;
pub mod types;

pub use config::Config;
pub use debounce::DebounceTracker;
pub use embedder::{Embedder, EmbedderError, FeedFrame, FeedReader, PrecomputedEmbedder};
pub use gallery::{EmbeddingGallery, GalleryError, IdentityProfile, Registration};
pub use matcher::{EuclideanMatcher, MatchError, Matcher};
pub use pipeline::{BatchRecognitionPipeline, BatchTally, IdentitySummary};
pub use types::{
    BoundingBox, Candidate, DetectedFace, Embedding, EmbeddingError, MatchResult, NoMatchReason,
    Verification,
};
