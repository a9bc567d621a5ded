//! faceguard-core: Recognition pipeline and access-log model.
//!
//! Face detection and encoding is an external capability behind the
//! [`FaceAnalyzer`] trait; this crate matches its embeddings against the
//! enrolled gallery and turns matches into access-log entries.

pub mod access;
pub mod quality;
pub mod recognition;
pub mod types;

pub use access::{AccessLogEntry, AccessLogSink, AccessOutcome, CollaboratorError, GallerySource};
pub use quality::{FaceQuality, QualityLabel};
pub use recognition::{AnalyzerError, FaceAnalyzer, RecognitionError, RecognitionPipeline};
pub use types::{
    BoundingBox, CosineMatcher, Embedding, EuclideanMatcher, FaceMatch, GalleryEntry, ImageRef,
    MatchOutcome, Matcher,
};
