use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Borrowed view of an 8-bit image handed to the analyzer.
#[derive(Debug, Clone, Copy)]
pub struct ImageRef<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    /// 1 for grayscale, 3 for interleaved RGB.
    pub channels: u8,
}

/// Face embedding vector (128-dimensional for dlib-style encoders).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding, if known.
    pub model_version: Option<String>,
}

const BLOB_MAGIC: &[u8; 4] = b"FGE1";

#[derive(Error, Debug, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding blob too short: {0} bytes")]
    Truncated(usize),
    #[error("embedding blob has unknown header")]
    BadMagic,
    #[error("embedding model version is not UTF-8")]
    BadVersion,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Always processes all dimensions; zero vectors score 0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Both vectors are non-empty and share a dimension.
    pub fn is_comparable(&self, other: &Embedding) -> bool {
        !self.values.is_empty() && self.values.len() == other.values.len()
    }

    /// `f32::INFINITY` unless the two embeddings are comparable.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        if !self.is_comparable(other) {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Serialize to the blob stored per user.
    ///
    /// Layout: `FGE1`, u16 version length, version bytes, u32 dimension,
    /// then little-endian f32 values.
    pub fn to_bytes(&self) -> Vec<u8> {
        let version = self.model_version.as_deref().unwrap_or("").as_bytes();
        let mut out = Vec::with_capacity(10 + version.len() + self.values.len() * 4);
        out.extend_from_slice(BLOB_MAGIC);
        out.extend_from_slice(&(version.len() as u16).to_le_bytes());
        out.extend_from_slice(version);
        out.extend_from_slice(&(self.values.len() as u32).to_le_bytes());
        for v in &self.values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EmbeddingError> {
        let truncated = || EmbeddingError::Truncated(bytes.len());
        if bytes.len() < 6 {
            return Err(truncated());
        }
        if &bytes[..4] != BLOB_MAGIC {
            return Err(EmbeddingError::BadMagic);
        }
        let version_len = u16::from_le_bytes([bytes[4], bytes[5]]) as usize;
        let rest = &bytes[6..];
        let version = rest.get(..version_len).ok_or_else(truncated)?;
        let rest = &rest[version_len..];
        let dim_bytes: [u8; 4] = rest.get(..4).ok_or_else(truncated)?.try_into().map_err(|_| truncated())?;
        let dim = u32::from_le_bytes(dim_bytes) as usize;
        let payload = rest.get(4..4 + dim * 4).ok_or_else(truncated)?;

        let values = payload
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let model_version = if version.is_empty() {
            None
        } else {
            Some(String::from_utf8(version.to_vec()).map_err(|_| EmbeddingError::BadVersion)?)
        };

        Ok(Self {
            values,
            model_version,
        })
    }
}

/// An enrolled user as seen by the matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub user_id: i64,
    pub name: String,
    pub embedding: Embedding,
}

/// Result of comparing one query against the gallery.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchOutcome {
    /// Index of the accepted gallery entry, `None` when nothing is within tolerance.
    pub best_index: Option<usize>,
    /// Distance to the closest entry (`f32::INFINITY` for an empty gallery).
    pub distance: f32,
}

/// Strategy for comparing a query embedding against the enrolled gallery.
///
/// `tolerance` is a distance: lower is stricter.
pub trait Matcher: Send + Sync {
    fn distance(&self, query: &Embedding, candidate: &Embedding) -> f32;

    /// Closest gallery entry and whether it is within `tolerance`.
    ///
    /// Always visits every entry so timing does not reveal the match position.
    /// Entries whose dimension differs from the query (or an empty query)
    /// are at infinite distance and never match.
    fn compare(&self, query: &Embedding, gallery: &[GalleryEntry], tolerance: f32) -> MatchOutcome {
        let mut best_distance = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in gallery.iter().enumerate() {
            let d = if query.is_comparable(&entry.embedding) {
                self.distance(query, &entry.embedding)
            } else {
                f32::INFINITY
            };
            if d < best_distance {
                best_distance = d;
                best_idx = Some(i);
            }
        }

        MatchOutcome {
            best_index: best_idx.filter(|_| best_distance <= tolerance),
            distance: best_distance,
        }
    }
}

/// Euclidean distance matcher (dlib / `face_recognition` convention, 0.6 default tolerance).
#[derive(Debug, Default, Clone, Copy)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn distance(&self, query: &Embedding, candidate: &Embedding) -> f32 {
        query.euclidean_distance(candidate)
    }
}

/// Cosine distance matcher: `1 - cosine similarity`, in [0, 2].
#[derive(Debug, Default, Clone, Copy)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn distance(&self, query: &Embedding, candidate: &Embedding) -> f32 {
        1.0 - query.similarity(candidate)
    }
}

/// One recognized (or unrecognized) face in a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceMatch {
    pub user_id: Option<i64>,
    pub name: Option<String>,
    pub distance: f32,
    /// `(1 - distance) * 100`, floored at 0; 0 for unknown faces.
    pub confidence: f32,
    pub location: BoundingBox,
}

impl FaceMatch {
    pub fn is_known(&self) -> bool {
        self.user_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64, name: &str, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry {
            user_id: id,
            name: name.into(),
            embedding: Embedding::new(values),
        }
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&a.clone()) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_matcher_visits_whole_gallery() {
        // Best match is the last entry.
        let query = Embedding::new(vec![1.0, 0.0, 0.0]);
        let gallery = vec![
            entry(1, "decoy1", vec![0.0, 1.0, 0.0]),
            entry(2, "decoy2", vec![0.0, 0.0, 1.0]),
            entry(3, "match", vec![0.9, 0.0, 0.0]),
        ];

        let outcome = EuclideanMatcher.compare(&query, &gallery, 0.6);
        assert_eq!(outcome.best_index, Some(2));
        assert!((outcome.distance - 0.1).abs() < 1e-5);
    }

    #[test]
    fn test_euclidean_matcher_outside_tolerance() {
        let query = Embedding::new(vec![1.0, 0.0]);
        let gallery = vec![entry(1, "other", vec![0.0, 1.0])];
        let outcome = EuclideanMatcher.compare(&query, &gallery, 0.6);
        assert_eq!(outcome.best_index, None);
        assert!((outcome.distance - 2f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_matcher_empty_gallery() {
        let query = Embedding::new(vec![1.0, 0.0]);
        let outcome = CosineMatcher.compare(&query, &[], 0.5);
        assert_eq!(outcome.best_index, None);
        assert!(outcome.distance.is_infinite());
    }

    #[test]
    fn test_mismatched_embeddings_never_match() {
        let gallery = vec![entry(1, "first", vec![0.3; 128]), entry(2, "second", vec![0.1; 128])];
        let empty = Embedding::new(Vec::new());
        let short = Embedding::new(vec![0.3, 0.3]);

        for query in [&empty, &short] {
            let euclid = EuclideanMatcher.compare(query, &gallery, 0.6);
            assert_eq!(euclid.best_index, None);
            assert!(euclid.distance.is_infinite());

            let cosine = CosineMatcher.compare(query, &gallery, 1.0);
            assert_eq!(cosine.best_index, None);
            assert!(cosine.distance.is_infinite());
        }
        assert!(short.euclidean_distance(&gallery[0].embedding).is_infinite());
    }

    #[test]
    fn test_cosine_matcher_distance() {
        let query = Embedding::new(vec![1.0, 0.0]);
        let gallery = vec![entry(1, "a", vec![-1.0, 0.0]), entry(2, "b", vec![2.0, 0.0])];
        let outcome = CosineMatcher.compare(&query, &gallery, 0.3);
        assert_eq!(outcome.best_index, Some(1));
        assert!(outcome.distance.abs() < 1e-6);
    }

    #[test]
    fn test_embedding_blob_round_trip() {
        let original = Embedding {
            values: vec![0.25, -1.5, 3.0e-3, f32::MAX],
            model_version: Some("dlib_resnet_v1".into()),
        };
        let restored = Embedding::from_bytes(&original.to_bytes()).unwrap();
        assert_eq!(restored, original);

        let anonymous = Embedding::new(vec![1.0; 128]);
        assert_eq!(Embedding::from_bytes(&anonymous.to_bytes()).unwrap(), anonymous);
    }

    #[test]
    fn test_embedding_blob_rejects_garbage() {
        assert_eq!(Embedding::from_bytes(b"FG"), Err(EmbeddingError::Truncated(2)));
        assert_eq!(Embedding::from_bytes(b"XXXX\0\0\0\0\0\0"), Err(EmbeddingError::BadMagic));

        let mut blob = Embedding::new(vec![1.0, 2.0]).to_bytes();
        blob.truncate(blob.len() - 1);
        assert!(matches!(Embedding::from_bytes(&blob), Err(EmbeddingError::Truncated(_))));
    }
}
