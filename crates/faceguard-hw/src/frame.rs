//! Frame type, YUYV unpacking and frame quality measures.

use serde::Serialize;
use std::time::{Duration, Instant};

/// Pixel layout of a [`Frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PixelFormat {
    /// 8-bit single channel.
    Gray8,
    /// 8-bit interleaved R, G, B.
    Rgb8,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb8 => 3,
        }
    }
}

/// A captured camera frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Pixel data, `width * height * channels` bytes, row-major.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub captured_at: Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data,
            width,
            height,
            format,
            captured_at: Instant::now(),
            sequence: 0,
        }
    }

    /// True for zero-size frames or frames whose buffer is shorter than
    /// the dimensions require.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.data.len() < self.expected_len()
    }

    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.channels()
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    /// Average pixel brightness (0.0–255.0), using Rec.601 luma for RGB.
    pub fn avg_brightness(&self) -> f32 {
        if self.is_empty() {
            return 0.0;
        }
        let luma = self.luma();
        luma.iter().map(|&b| b as f32).sum::<f32>() / luma.len() as f32
    }

    /// Focus measure: variance of the 4-neighbour Laplacian over the luma plane.
    ///
    /// Higher is sharper. Frames smaller than 3x3 score 0.
    pub fn sharpness(&self) -> f64 {
        let w = self.width as usize;
        let h = self.height as usize;
        if self.is_empty() || w < 3 || h < 3 {
            return 0.0;
        }
        let luma = self.luma();
        let mut sum = 0.0f64;
        let mut sum_sq = 0.0f64;
        let mut n = 0usize;
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let c = luma[y * w + x] as f64;
                let lap = luma[(y - 1) * w + x] as f64
                    + luma[(y + 1) * w + x] as f64
                    + luma[y * w + x - 1] as f64
                    + luma[y * w + x + 1] as f64
                    - 4.0 * c;
                sum += lap;
                sum_sq += lap * lap;
                n += 1;
            }
        }
        let mean = sum / n as f64;
        sum_sq / n as f64 - mean * mean
    }

    /// Single-channel view of the frame (copied for RGB input).
    pub fn luma(&self) -> Vec<u8> {
        let pixels = self.width as usize * self.height as usize;
        match self.format {
            PixelFormat::Gray8 => self.data[..pixels.min(self.data.len())].to_vec(),
            PixelFormat::Rgb8 => self
                .data
                .chunks_exact(3)
                .take(pixels)
                .map(|px| {
                    let y = 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
                    y.round().clamp(0.0, 255.0) as u8
                })
                .collect(),
        }
    }
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Convert packed YUYV (4:2:2) to interleaved RGB using BT.601 limited range.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for quad in yuyv[..expected].chunks_exact(4) {
        let u = quad[1] as f32 - 128.0;
        let v = quad[3] as f32 - 128.0;
        for y in [quad[0], quad[2]] {
            let c = 1.164 * (y as f32 - 16.0);
            rgb.push((c + 1.596 * v).round().clamp(0.0, 255.0) as u8);
            rgb.push((c - 0.392 * u - 0.813 * v).round().clamp(0.0, 255.0) as u8);
            rgb.push((c + 2.017 * u).round().clamp(0.0, 255.0) as u8);
        }
    }
    Ok(rgb)
}

/// Mirror a frame left-to-right in place.
pub fn flip_horizontal(frame: &mut Frame) {
    if frame.is_empty() {
        return;
    }
    let w = frame.width as usize;
    let ch = frame.format.channels();
    let stride = w * ch;
    for row in frame.data.chunks_exact_mut(stride).take(frame.height as usize) {
        for x in 0..w / 2 {
            let left = x * ch;
            let right = (w - 1 - x) * ch;
            for c in 0..ch {
                row.swap(left + c, right + c);
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid YUYV length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
