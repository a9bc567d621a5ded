//! Image quality scoring for a single detected face.
//!
//! Four measures over the face region, each scaled to 0-100 and averaged:
//! face size, sharpness (Laplacian variance), brightness and contrast.

use crate::types::{BoundingBox, ImageRef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Side length (pixels) at which a face scores full marks for size.
pub const MIN_FACE_SIZE: f32 = 100.0;
/// Laplacian variance that scores full marks for sharpness.
pub const SHARPNESS_TARGET: f64 = 500.0;
/// Mean brightness range that scores full marks.
pub const BRIGHTNESS_RANGE: (f64, f64) = (50.0, 200.0);
/// Standard deviation that scores full marks for contrast.
pub const CONTRAST_TARGET: f64 = 50.0;
/// Score reported when more than one face is visible.
pub const MULTIPLE_FACES_SCORE: f32 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLabel {
    NoFace,
    MultipleFaces,
    InvalidRegion,
    Excellent,
    Good,
    Acceptable,
    Low,
    VeryLow,
}

impl QualityLabel {
    fn from_score(score: f32) -> Self {
        match score {
            s if s >= 80.0 => QualityLabel::Excellent,
            s if s >= 60.0 => QualityLabel::Good,
            s if s >= 40.0 => QualityLabel::Acceptable,
            s if s >= 20.0 => QualityLabel::Low,
            _ => QualityLabel::VeryLow,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QualityLabel::NoFace => "no face detected",
            QualityLabel::MultipleFaces => "multiple faces detected",
            QualityLabel::InvalidRegion => "invalid face region",
            QualityLabel::Excellent => "excellent",
            QualityLabel::Good => "good",
            QualityLabel::Acceptable => "acceptable",
            QualityLabel::Low => "low",
            QualityLabel::VeryLow => "very low",
        }
    }
}

impl fmt::Display for QualityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceQuality {
    /// 0-100.
    pub score: f32,
    pub label: QualityLabel,
}

impl FaceQuality {
    fn fixed(score: f32, label: QualityLabel) -> Self {
        Self { score, label }
    }

    /// Score `image` given the faces detected in it.
    ///
    /// No face scores 0 and several faces score [`MULTIPLE_FACES_SCORE`];
    /// only a single face is measured.
    pub fn assess(image: &ImageRef<'_>, faces: &[BoundingBox]) -> Self {
        let face = match faces {
            [] => return Self::fixed(0.0, QualityLabel::NoFace),
            [face] => face,
            _ => return Self::fixed(MULTIPLE_FACES_SCORE, QualityLabel::MultipleFaces),
        };
        let Some(region) = Region::crop(image, face) else {
            return Self::fixed(0.0, QualityLabel::InvalidRegion);
        };

        let size = (face.width.min(face.height) / MIN_FACE_SIZE * 100.0).clamp(0.0, 100.0) as f64;
        let sharpness = (region.laplacian_variance() / SHARPNESS_TARGET * 100.0).min(100.0);
        let (mean, std_dev) = region.mean_and_std_dev();
        let brightness = brightness_score(mean);
        let contrast = (std_dev / CONTRAST_TARGET * 100.0).min(100.0);

        let score = ((size + sharpness + brightness + contrast) / 4.0) as f32;
        tracing::debug!(score, size, sharpness, brightness, contrast, "face quality");
        Self::fixed(score, QualityLabel::from_score(score))
    }
}

fn brightness_score(mean: f64) -> f64 {
    let (low, high) = BRIGHTNESS_RANGE;
    if mean < low {
        mean / low * 100.0
    } else if mean > high {
        (255.0 - mean) / (255.0 - high) * 100.0
    } else {
        100.0
    }
}

/// Grayscale copy of the face box, clipped to the image.
struct Region {
    luma: Vec<u8>,
    width: usize,
    height: usize,
}

impl Region {
    fn crop(image: &ImageRef<'_>, face: &BoundingBox) -> Option<Self> {
        let channels = match image.channels {
            1 => 1usize,
            3 => 3,
            _ => return None,
        };
        let (img_w, img_h) = (image.width as usize, image.height as usize);
        if image.data.len() < img_w * img_h * channels {
            return None;
        }

        let left = face.x.max(0.0) as usize;
        let top = face.y.max(0.0) as usize;
        let right = ((face.x + face.width).max(0.0) as usize).min(img_w);
        let bottom = ((face.y + face.height).max(0.0) as usize).min(img_h);
        if left >= right || top >= bottom {
            return None;
        }

        let (width, height) = (right - left, bottom - top);
        let mut luma = Vec::with_capacity(width * height);
        for y in top..bottom {
            for x in left..right {
                let i = (y * img_w + x) * channels;
                luma.push(if channels == 1 {
                    image.data[i]
                } else {
                    let (r, g, b) = (image.data[i] as u32, image.data[i + 1] as u32, image.data[i + 2] as u32);
                    ((r * 299 + g * 587 + b * 114) / 1000) as u8
                });
            }
        }
        Some(Self { luma, width, height })
    }

    fn mean_and_std_dev(&self) -> (f64, f64) {
        let n = self.luma.len() as f64;
        let mean = self.luma.iter().map(|&p| p as f64).sum::<f64>() / n;
        let var = self.luma.iter().map(|&p| (p as f64 - mean).powi(2)).sum::<f64>() / n;
        (mean, var.sqrt())
    }

    /// Variance of the 4-neighbour Laplacian over interior pixels.
    fn laplacian_variance(&self) -> f64 {
        if self.width < 3 || self.height < 3 {
            return 0.0;
        }
        let w = self.width;
        let px = |x: usize, y: usize| self.luma[y * w + x] as f64;
        let mut values = Vec::with_capacity((w - 2) * (self.height - 2));
        for y in 1..self.height - 1 {
            for x in 1..w - 1 {
                values.push(px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1) - 4.0 * px(x, y));
            }
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, side: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: side,
            height: side,
            confidence: 0.9,
            landmarks: None,
        }
    }

    fn gray(data: &[u8], side: u32) -> ImageRef<'_> {
        ImageRef {
            data,
            width: side,
            height: side,
            channels: 1,
        }
    }

    #[test]
    fn test_face_count_short_circuits() {
        let data = vec![128u8; 16];
        let image = gray(&data, 4);
        assert_eq!(FaceQuality::assess(&image, &[]), FaceQuality::fixed(0.0, QualityLabel::NoFace));

        let two = [face(0.0, 0.0, 2.0), face(2.0, 2.0, 2.0)];
        let quality = FaceQuality::assess(&image, &two);
        assert_eq!(quality.score, 30.0);
        assert_eq!(quality.label, QualityLabel::MultipleFaces);
    }

    #[test]
    fn test_face_outside_image_is_invalid() {
        let data = vec![128u8; 16];
        let quality = FaceQuality::assess(&gray(&data, 4), &[face(10.0, 10.0, 5.0)]);
        assert_eq!(quality.label, QualityLabel::InvalidRegion);
        assert_eq!(quality.score, 0.0);
    }

    #[test]
    fn test_flat_face_scores_size_and_brightness_only() {
        // 100px mid-grey face: full size and brightness, no sharpness or contrast.
        let data = vec![128u8; 120 * 120];
        let quality = FaceQuality::assess(&gray(&data, 120), &[face(10.0, 10.0, 100.0)]);
        assert!((quality.score - 50.0).abs() < 1e-3);
        assert_eq!(quality.label, QualityLabel::Acceptable);
    }

    #[test]
    fn test_checkerboard_face_is_excellent() {
        let side = 120u32;
        let data: Vec<u8> = (0..side * side)
            .map(|i| if (i % side + i / side) % 2 == 0 { 20 } else { 230 })
            .collect();
        let quality = FaceQuality::assess(&gray(&data, side), &[face(0.0, 0.0, 110.0)]);
        // Mean 125, std 105, huge Laplacian variance.
        assert!((quality.score - 100.0).abs() < 1e-3);
        assert_eq!(quality.label, QualityLabel::Excellent);
        assert_eq!(quality.label.to_string(), "excellent");
    }

    #[test]
    fn test_dark_small_face_is_very_low() {
        // 25px face at brightness 10: size 25, brightness 20, flat.
        let data = vec![10u8; 40 * 40];
        let quality = FaceQuality::assess(&gray(&data, 40), &[face(5.0, 5.0, 25.0)]);
        assert!((quality.score - 11.25).abs() < 1e-3);
        assert_eq!(quality.label, QualityLabel::VeryLow);
    }

    #[test]
    fn test_bright_rgb_face() {
        // White RGB face: brightness falls off above 200.
        let data = vec![255u8; 100 * 100 * 3];
        let image = ImageRef {
            data: &data,
            width: 100,
            height: 100,
            channels: 3,
        };
        let quality = FaceQuality::assess(&image, &[face(0.0, 0.0, 100.0)]);
        assert!((quality.score - 25.0).abs() < 1e-3);
        assert_eq!(quality.label, QualityLabel::Low);
    }
}
