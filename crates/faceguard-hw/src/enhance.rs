//! Frame post-processing: mirror flip and CLAHE on the lightness channel.

use crate::frame::{self, Frame, PixelFormat};

/// Stateless frame enhancer applied to every live frame.
///
/// RGB frames are equalized on the L* channel of CIE L*a*b* so hue is
/// preserved; grayscale frames are equalized directly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameEnhancer {
    /// Histogram clip limit as a multiple of the mean bin height (OpenCV semantics).
    pub clip_limit: f32,
    /// Tile grid (columns, rows).
    pub tile_grid: (u32, u32),
    /// Mirror left-to-right before equalizing.
    pub mirror: bool,
}

impl Default for FrameEnhancer {
    fn default() -> Self {
        Self {
            clip_limit: 2.0,
            tile_grid: (8, 8),
            mirror: true,
        }
    }
}

impl FrameEnhancer {
    pub fn new(clip_limit: f32, tile_grid: (u32, u32)) -> Self {
        Self {
            clip_limit,
            tile_grid,
            ..Self::default()
        }
    }

    /// Return an enhanced copy of `input`. Empty frames come back unchanged.
    pub fn enhance(&self, input: &Frame) -> Frame {
        let mut out = input.clone();
        if input.is_empty() {
            return out;
        }
        if self.mirror {
            frame::flip_horizontal(&mut out);
        }
        match out.format {
            PixelFormat::Gray8 => {
                clahe_enhance(&mut out.data, out.width, out.height, self.tile_grid, self.clip_limit);
            }
            PixelFormat::Rgb8 => self.equalize_lightness(&mut out),
        }
        out
    }

    fn equalize_lightness(&self, frame: &mut Frame) {
        let pixels = frame.width as usize * frame.height as usize;
        let mut lightness = Vec::with_capacity(pixels);
        let mut chroma = Vec::with_capacity(pixels);

        for px in frame.data.chunks_exact(3).take(pixels) {
            let [l, a, b] = rgb_to_lab([px[0], px[1], px[2]]);
            lightness.push((l * 255.0 / 100.0).round().clamp(0.0, 255.0) as u8);
            chroma.push((a, b));
        }

        clahe_enhance(&mut lightness, frame.width, frame.height, self.tile_grid, self.clip_limit);

        for ((px, &l8), &(a, b)) in frame
            .data
            .chunks_exact_mut(3)
            .zip(lightness.iter())
            .zip(chroma.iter())
        {
            let rgb = lab_to_rgb([l8 as f32 * 100.0 / 255.0, a, b]);
            px.copy_from_slice(&rgb);
        }
    }
}

/// Apply Contrast-Limited Adaptive Histogram Equalization in place.
///
/// The plane is split into a `grid.0 x grid.1` tile grid (reduced when the
/// image is smaller than the grid). Each tile gets a clipped histogram and
/// a CDF lookup table; pixels are mapped by bilinear interpolation between
/// the four nearest tile tables. A non-positive `clip_limit` disables clipping.
pub fn clahe_enhance(plane: &mut [u8], width: u32, height: u32, grid: (u32, u32), clip_limit: f32) {
    let w = width as usize;
    let h = height as usize;
    if w == 0 || h == 0 || plane.len() < w * h {
        return;
    }

    let tx = (grid.0 as usize).clamp(1, w);
    let ty = (grid.1 as usize).clamp(1, h);
    let x_bounds: Vec<usize> = (0..=tx).map(|i| i * w / tx).collect();
    let y_bounds: Vec<usize> = (0..=ty).map(|i| i * h / ty).collect();

    let mut luts: Vec<[u8; 256]> = Vec::with_capacity(tx * ty);
    for row in 0..ty {
        for col in 0..tx {
            let (x0, x1) = (x_bounds[col], x_bounds[col + 1]);
            let (y0, y1) = (y_bounds[row], y_bounds[row + 1]);
            let tile_pixels = (x1 - x0) * (y1 - y0);

            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for &p in &plane[y * w + x0..y * w + x1] {
                    hist[p as usize] += 1;
                }
            }

            if clip_limit > 0.0 {
                let clip = ((clip_limit * tile_pixels as f32 / 256.0) as u32).max(1);
                let mut excess = 0u32;
                for bin in hist.iter_mut() {
                    if *bin > clip {
                        excess += *bin - clip;
                        *bin = clip;
                    }
                }
                let redist = excess / 256;
                let leftover = (excess % 256) as usize;
                for (i, bin) in hist.iter_mut().enumerate() {
                    *bin += redist;
                    if i < leftover {
                        *bin += 1;
                    }
                }
            }

            let scale = 255.0 / tile_pixels as f32;
            let mut lut = [0u8; 256];
            let mut acc = 0u32;
            for (value, &count) in lut.iter_mut().zip(hist.iter()) {
                acc += count;
                *value = (acc as f32 * scale).round().clamp(0.0, 255.0) as u8;
            }
            luts.push(lut);
        }
    }

    let tile_w = w as f32 / tx as f32;
    let tile_h = h as f32 / ty as f32;

    for y in 0..h {
        let fy = ((y as f32 + 0.5) / tile_h - 0.5).clamp(0.0, (ty - 1) as f32);
        let r0 = fy as usize;
        let r1 = (r0 + 1).min(ty - 1);
        let dy = fy - r0 as f32;

        for x in 0..w {
            let fx = ((x as f32 + 0.5) / tile_w - 0.5).clamp(0.0, (tx - 1) as f32);
            let c0 = fx as usize;
            let c1 = (c0 + 1).min(tx - 1);
            let dx = fx - c0 as f32;

            let pixel = plane[y * w + x] as usize;
            let tl = luts[r0 * tx + c0][pixel] as f32;
            let tr = luts[r0 * tx + c1][pixel] as f32;
            let bl = luts[r1 * tx + c0][pixel] as f32;
            let br = luts[r1 * tx + c1][pixel] as f32;

            let top = tl * (1.0 - dx) + tr * dx;
            let bot = bl * (1.0 - dx) + br * dx;
            plane[y * w + x] = (top * (1.0 - dy) + bot * dy).round().clamp(0.0, 255.0) as u8;
        }
    }
}

// D65 reference white.
const WHITE_X: f32 = 0.950_47;
const WHITE_Z: f32 = 1.088_83;
const EPSILON: f32 = 6.0 / 29.0;

fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.040_45 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(c: f32) -> f32 {
    if c <= 0.003_130_8 {
        12.92 * c
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

fn lab_f(t: f32) -> f32 {
    if t > EPSILON * EPSILON * EPSILON {
        t.cbrt()
    } else {
        t / (3.0 * EPSILON * EPSILON) + 4.0 / 29.0
    }
}

fn lab_f_inv(t: f32) -> f32 {
    if t > EPSILON {
        t * t * t
    } else {
        3.0 * EPSILON * EPSILON * (t - 4.0 / 29.0)
    }
}

/// sRGB (8-bit) to CIE L*a*b* with L in 0–100.
pub fn rgb_to_lab(rgb: [u8; 3]) -> [f32; 3] {
    let r = srgb_to_linear(rgb[0] as f32 / 255.0);
    let g = srgb_to_linear(rgb[1] as f32 / 255.0);
    let b = srgb_to_linear(rgb[2] as f32 / 255.0);

    let x = (0.412_456_4 * r + 0.357_576_1 * g + 0.180_437_5 * b) / WHITE_X;
    let y = 0.212_672_9 * r + 0.715_152_2 * g + 0.072_175 * b;
    let z = (0.019_333_9 * r + 0.119_192 * g + 0.950_304_1 * b) / WHITE_Z;

    let (fx, fy, fz) = (lab_f(x), lab_f(y), lab_f(z));
    [116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz)]
}

/// CIE L*a*b* back to 8-bit sRGB, clamping out-of-gamut values.
pub fn lab_to_rgb(lab: [f32; 3]) -> [u8; 3] {
    let fy = (lab[0] + 16.0) / 116.0;
    let fx = fy + lab[1] / 500.0;
    let fz = fy - lab[2] / 200.0;

    let x = lab_f_inv(fx) * WHITE_X;
    let y = lab_f_inv(fy);
    let z = lab_f_inv(fz) * WHITE_Z;

    let r = 3.240_454_2 * x - 1.537_138_5 * y - 0.498_531_4 * z;
    let g = -0.969_266 * x + 1.876_010_8 * y + 0.041_556 * z;
    let b = 0.055_643_4 * x - 0.204_025_9 * y + 1.057_225_2 * z;

    [r, g, b].map(|c| (linear_to_srgb(c.clamp(0.0, 1.0)) * 255.0).round().clamp(0.0, 255.0) as u8)
}
