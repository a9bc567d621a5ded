//! Recognition pipeline: external face analysis plus gallery matching.
//!
//! The analyzer (detection + encoding) is opaque; this module decides who
//! each detected face is and enforces the enrollment rules.

use crate::access::{CollaboratorError, GallerySource};
use crate::quality::FaceQuality;
use crate::types::{BoundingBox, Embedding, EuclideanMatcher, FaceMatch, GalleryEntry, ImageRef, Matcher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

pub const MIN_TOLERANCE: f32 = 0.1;
pub const MAX_TOLERANCE: f32 = 1.0;
pub const DEFAULT_TOLERANCE: f32 = 0.6;
pub const DEFAULT_MAX_FACES: usize = 10;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("analysis failed: {0}")]
    Failed(String),
    #[error("unsupported image: {0}")]
    UnsupportedImage(String),
}

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("analyzer error: {0}")]
    Analyzer(#[from] AnalyzerError),
    #[error("tolerance {0} outside [{MIN_TOLERANCE}, {MAX_TOLERANCE}]")]
    InvalidTolerance(f32),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("{0} faces detected; enrollment needs exactly one")]
    MultipleFaces(usize),
    #[error("face is already enrolled as {name}")]
    AlreadyEnrolled { name: String },
    #[error("analyzer returned an empty embedding")]
    EmptyEmbedding,
}

/// External face detection + encoding capability.
pub trait FaceAnalyzer: Send + Sync {
    /// Locate every face in `image` and encode each one.
    fn detect_and_encode(&self, image: &ImageRef<'_>) -> Result<Vec<(BoundingBox, Embedding)>, AnalyzerError>;
}

/// Matches analyzer output against the enrolled gallery.
pub struct RecognitionPipeline {
    analyzer: Arc<dyn FaceAnalyzer>,
    matcher: Box<dyn Matcher>,
    /// `f32` bits; adjustable while the pipeline is shared.
    tolerance: AtomicU32,
    max_faces: usize,
    gallery: RwLock<Vec<GalleryEntry>>,
}

impl RecognitionPipeline {
    pub fn new(analyzer: Arc<dyn FaceAnalyzer>, tolerance: f32) -> Result<Self, RecognitionError> {
        validate_tolerance(tolerance)?;
        Ok(Self {
            analyzer,
            matcher: Box::new(EuclideanMatcher),
            tolerance: AtomicU32::new(tolerance.to_bits()),
            max_faces: DEFAULT_MAX_FACES,
            gallery: RwLock::new(Vec::new()),
        })
    }

    pub fn with_matcher(mut self, matcher: impl Matcher + 'static) -> Self {
        self.matcher = Box::new(matcher);
        self
    }

    pub fn with_max_faces(mut self, max_faces: usize) -> Self {
        self.max_faces = max_faces.max(1);
        self
    }

    pub fn tolerance(&self) -> f32 {
        f32::from_bits(self.tolerance.load(Ordering::Acquire))
    }

    /// Change the match tolerance; out-of-range values leave it untouched.
    pub fn set_tolerance(&self, tolerance: f32) -> Result<(), RecognitionError> {
        validate_tolerance(tolerance)?;
        let previous = f32::from_bits(self.tolerance.swap(tolerance.to_bits(), Ordering::AcqRel));
        tracing::info!(previous, tolerance, "tolerance updated");
        Ok(())
    }

    pub fn set_gallery(&self, entries: Vec<GalleryEntry>) {
        tracing::info!(enrolled = entries.len(), "gallery loaded");
        *self.gallery.write().unwrap_or_else(PoisonError::into_inner) = entries;
    }

    /// Replace the gallery with the collaborator's current contents.
    pub fn reload_gallery(&self, source: &dyn GallerySource) -> Result<usize, CollaboratorError> {
        let entries = source.load_gallery()?;
        let count = entries.len();
        self.set_gallery(entries);
        Ok(count)
    }

    pub fn gallery_len(&self) -> usize {
        self.gallery.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Identify every face in `image` (at most `max_faces`).
    pub fn recognize(&self, image: &ImageRef<'_>) -> Result<Vec<FaceMatch>, RecognitionError> {
        let faces = self.analyzer.detect_and_encode(image)?;
        if faces.len() > self.max_faces {
            tracing::debug!(detected = faces.len(), max = self.max_faces, "face count capped");
        }

        let tolerance = self.tolerance();
        let gallery = self.gallery.read().unwrap_or_else(PoisonError::into_inner);
        let matches: Vec<FaceMatch> = faces
            .into_iter()
            .take(self.max_faces)
            .map(|(location, embedding)| {
                let outcome = self.matcher.compare(&embedding, &gallery, tolerance);
                match outcome.best_index.map(|i| &gallery[i]) {
                    Some(entry) => FaceMatch {
                        user_id: Some(entry.user_id),
                        name: Some(entry.name.clone()),
                        distance: outcome.distance,
                        confidence: ((1.0 - outcome.distance) * 100.0).max(0.0),
                        location,
                    },
                    None => FaceMatch {
                        user_id: None,
                        name: None,
                        distance: outcome.distance,
                        confidence: 0.0,
                        location,
                    },
                }
            })
            .collect();

        tracing::debug!(
            faces = matches.len(),
            known = matches.iter().filter(|m| m.is_known()).count(),
            "recognition pass complete"
        );
        Ok(matches)
    }

    /// Embedding for a new enrollment.
    ///
    /// Requires exactly one face that does not already match an enrolled user.
    pub fn enrollment_embedding(&self, image: &ImageRef<'_>) -> Result<Embedding, RecognitionError> {
        let mut faces = self.analyzer.detect_and_encode(image)?;
        match faces.len() {
            0 => return Err(RecognitionError::NoFaceDetected),
            1 => {}
            n => return Err(RecognitionError::MultipleFaces(n)),
        }
        let (_, embedding) = faces.remove(0);
        if embedding.values.is_empty() {
            return Err(RecognitionError::EmptyEmbedding);
        }

        let gallery = self.gallery.read().unwrap_or_else(PoisonError::into_inner);
        let outcome = self.matcher.compare(&embedding, &gallery, self.tolerance());
        if let Some(idx) = outcome.best_index {
            return Err(RecognitionError::AlreadyEnrolled {
                name: gallery[idx].name.clone(),
            });
        }
        Ok(embedding)
    }

    /// Score how usable `image` is for recognition (0-100).
    pub fn face_quality(&self, image: &ImageRef<'_>) -> Result<FaceQuality, RecognitionError> {
        let faces = self.analyzer.detect_and_encode(image)?;
        let boxes: Vec<BoundingBox> = faces.into_iter().map(|(location, _)| location).collect();
        Ok(FaceQuality::assess(image, &boxes))
    }
}

pub fn validate_tolerance(tolerance: f32) -> Result<(), RecognitionError> {
    if (MIN_TOLERANCE..=MAX_TOLERANCE).contains(&tolerance) {
        Ok(())
    } else {
        Err(RecognitionError::InvalidTolerance(tolerance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::QualityLabel;
    use std::sync::Mutex;

    /// Returns a fixed set of faces for every image.
    struct ScriptedAnalyzer {
        faces: Mutex<Result<Vec<Vec<f32>>, String>>,
    }

    impl ScriptedAnalyzer {
        fn returning(faces: Vec<Vec<f32>>) -> Arc<Self> {
            Arc::new(Self {
                faces: Mutex::new(Ok(faces)),
            })
        }
    }

    impl FaceAnalyzer for ScriptedAnalyzer {
        fn detect_and_encode(&self, _image: &ImageRef<'_>) -> Result<Vec<(BoundingBox, Embedding)>, AnalyzerError> {
            let faces = self.faces.lock().unwrap().clone().map_err(AnalyzerError::Failed)?;
            Ok(faces
                .into_iter()
                .enumerate()
                .map(|(i, v)| (bbox(i as f32 * 50.0), Embedding::new(v)))
                .collect())
        }
    }

    fn bbox(x: f32) -> BoundingBox {
        BoundingBox {
            x,
            y: 0.0,
            width: 40.0,
            height: 40.0,
            confidence: 0.9,
            landmarks: None,
        }
    }

    fn image() -> ImageRef<'static> {
        ImageRef {
            data: &[0u8; 16],
            width: 4,
            height: 4,
            channels: 1,
        }
    }

    fn gallery() -> Vec<GalleryEntry> {
        vec![
            GalleryEntry {
                user_id: 1,
                name: "Ana".into(),
                embedding: Embedding::new(vec![1.0, 0.0]),
            },
            GalleryEntry {
                user_id: 2,
                name: "Luis".into(),
                embedding: Embedding::new(vec![0.0, 1.0]),
            },
        ]
    }

    #[test]
    fn test_tolerance_bounds() {
        let analyzer = ScriptedAnalyzer::returning(vec![]);
        assert!(RecognitionPipeline::new(analyzer.clone(), 0.05).is_err());
        assert!(RecognitionPipeline::new(analyzer.clone(), 1.5).is_err());
        assert!(RecognitionPipeline::new(analyzer.clone(), 0.1).is_ok());
        assert!(RecognitionPipeline::new(analyzer, 1.0).is_ok());
    }

    #[test]
    fn test_set_tolerance_validates() {
        let analyzer = ScriptedAnalyzer::returning(vec![vec![0.5, 0.0]]);
        let pipeline = RecognitionPipeline::new(analyzer, 0.6).unwrap();
        pipeline.set_gallery(gallery());
        assert!(pipeline.recognize(&image()).unwrap()[0].is_known());

        pipeline.set_tolerance(0.3).unwrap();
        assert_eq!(pipeline.tolerance(), 0.3);
        assert!(!pipeline.recognize(&image()).unwrap()[0].is_known());

        assert!(matches!(pipeline.set_tolerance(0.05), Err(RecognitionError::InvalidTolerance(_))));
        assert!(matches!(pipeline.set_tolerance(1.2), Err(RecognitionError::InvalidTolerance(_))));
        assert!(pipeline.set_tolerance(f32::NAN).is_err());
        assert_eq!(pipeline.tolerance(), 0.3);
    }

    #[test]
    fn test_empty_embedding_is_never_granted() {
        let analyzer = ScriptedAnalyzer::returning(vec![vec![], vec![1.0, 0.0, 0.0]]);
        let pipeline = RecognitionPipeline::new(analyzer, 1.0).unwrap();
        pipeline.set_gallery(gallery());

        let matches = pipeline.recognize(&image()).unwrap();
        assert!(matches.iter().all(|m| !m.is_known()));
        assert!(matches.iter().all(|m| m.confidence == 0.0));

        let empty = RecognitionPipeline::new(ScriptedAnalyzer::returning(vec![vec![]]), 0.6).unwrap();
        assert!(matches!(empty.enrollment_embedding(&image()), Err(RecognitionError::EmptyEmbedding)));
    }

    #[test]
    fn test_face_quality_uses_detected_faces() {
        let none = RecognitionPipeline::new(ScriptedAnalyzer::returning(vec![]), 0.6).unwrap();
        assert_eq!(none.face_quality(&image()).unwrap().label, QualityLabel::NoFace);

        let two = RecognitionPipeline::new(ScriptedAnalyzer::returning(vec![vec![1.0], vec![2.0]]), 0.6).unwrap();
        let quality = two.face_quality(&image()).unwrap();
        assert_eq!(quality.label, QualityLabel::MultipleFaces);
        assert_eq!(quality.score, 30.0);
    }

    #[test]
    fn test_recognize_known_and_unknown() {
        let analyzer = ScriptedAnalyzer::returning(vec![vec![0.9, 0.0], vec![5.0, 5.0]]);
        let pipeline = RecognitionPipeline::new(analyzer, 0.6).unwrap();
        pipeline.set_gallery(gallery());

        let matches = pipeline.recognize(&image()).unwrap();
        assert_eq!(matches.len(), 2);

        assert_eq!(matches[0].user_id, Some(1));
        assert_eq!(matches[0].name.as_deref(), Some("Ana"));
        assert!((matches[0].confidence - 90.0).abs() < 1e-3);

        assert!(!matches[1].is_known());
        assert_eq!(matches[1].confidence, 0.0);
        assert_eq!(matches[1].location.x, 50.0);
    }

    #[test]
    fn test_recognize_empty_gallery_marks_unknown() {
        let analyzer = ScriptedAnalyzer::returning(vec![vec![1.0, 0.0]]);
        let pipeline = RecognitionPipeline::new(analyzer, 0.6).unwrap();
        let matches = pipeline.recognize(&image()).unwrap();
        assert_eq!(matches.len(), 1);
        assert!(!matches[0].is_known());
    }

    #[test]
    fn test_recognize_caps_face_count() {
        let analyzer = ScriptedAnalyzer::returning(vec![vec![1.0, 0.0]; 5]);
        let pipeline = RecognitionPipeline::new(analyzer, 0.6).unwrap().with_max_faces(2);
        assert_eq!(pipeline.recognize(&image()).unwrap().len(), 2);
    }

    #[test]
    fn test_recognize_propagates_analyzer_failure() {
        let analyzer = Arc::new(ScriptedAnalyzer {
            faces: Mutex::new(Err("model crashed".into())),
        });
        let pipeline = RecognitionPipeline::new(analyzer, 0.6).unwrap();
        assert!(matches!(
            pipeline.recognize(&image()),
            Err(RecognitionError::Analyzer(AnalyzerError::Failed(_)))
        ));
    }

    #[test]
    fn test_enrollment_rules() {
        let none = RecognitionPipeline::new(ScriptedAnalyzer::returning(vec![]), 0.6).unwrap();
        assert!(matches!(none.enrollment_embedding(&image()), Err(RecognitionError::NoFaceDetected)));

        let two = RecognitionPipeline::new(ScriptedAnalyzer::returning(vec![vec![1.0], vec![2.0]]), 0.6).unwrap();
        assert!(matches!(two.enrollment_embedding(&image()), Err(RecognitionError::MultipleFaces(2))));

        let dup = RecognitionPipeline::new(ScriptedAnalyzer::returning(vec![vec![0.0, 0.95]]), 0.6).unwrap();
        dup.set_gallery(gallery());
        match dup.enrollment_embedding(&image()) {
            Err(RecognitionError::AlreadyEnrolled { name }) => assert_eq!(name, "Luis"),
            other => panic!("expected AlreadyEnrolled, got {other:?}"),
        }

        let fresh = RecognitionPipeline::new(ScriptedAnalyzer::returning(vec![vec![-3.0, -3.0]]), 0.6).unwrap();
        fresh.set_gallery(gallery());
        assert_eq!(fresh.enrollment_embedding(&image()).unwrap().values, vec![-3.0, -3.0]);
    }

    struct FixedGallery;

    impl GallerySource for FixedGallery {
        fn load_gallery(&self) -> Result<Vec<GalleryEntry>, CollaboratorError> {
            Ok(gallery())
        }
    }

    #[test]
    fn test_reload_gallery() {
        let pipeline = RecognitionPipeline::new(ScriptedAnalyzer::returning(vec![]), 0.6).unwrap();
        assert_eq!(pipeline.gallery_len(), 0);
        assert_eq!(pipeline.reload_gallery(&FixedGallery).unwrap(), 2);
        assert_eq!(pipeline.gallery_len(), 2);
    }
}
