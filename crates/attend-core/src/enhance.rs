//! Illumination normalization: CLAHE on the CIE L* channel.
//!
//! The face crop is converted to L*a*b*, only the lightness plane is
//! equalized, and the chroma planes are carried through untouched.

use image::RgbImage;

/// Default CLAHE grid (tiles per side).
pub const CLAHE_TILES: u32 = 8;
/// Default CLAHE clip limit, in multiples of the mean bin height.
pub const CLAHE_CLIP_LIMIT: f32 = 2.0;

// D65 reference white.
const WHITE_X: f32 = 0.950_47;
const WHITE_Z: f32 = 1.088_83;
const LAB_DELTA: f32 = 6.0 / 29.0;

/// Apply CLAHE to the lightness channel of an RGB image in-place.
pub fn equalize_lightness(image: &mut RgbImage, tiles: u32, clip_limit: f32) {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return;
    }

    let mut lab: Vec<[f32; 3]> = image.pixels().map(|p| rgb_to_lab([p[0], p[1], p[2]])).collect();

    // L* in [0, 100] -> 8-bit plane, the same scaling OpenCV uses for Lab.
    let mut lightness: Vec<u8> = lab
        .iter()
        .map(|v| (v[0] * 255.0 / 100.0).round().clamp(0.0, 255.0) as u8)
        .collect();

    clahe_enhance(&mut lightness, width, height, tiles, clip_limit);

    for (v, &l) in lab.iter_mut().zip(lightness.iter()) {
        v[0] = l as f32 * 100.0 / 255.0;
    }

    for (pixel, v) in image.pixels_mut().zip(lab.iter()) {
        pixel.0 = lab_to_rgb(*v);
    }
}

/// Contrast-Limited Adaptive Histogram Equalization over an 8-bit plane.
///
/// Builds a clipped histogram CDF per tile and interpolates bilinearly
/// between the four nearest tile centers. `clip_limit` follows OpenCV: each
/// bin is capped at `clip_limit * tile_pixels / 256` and the excess is spread
/// evenly across all bins.
pub fn clahe_enhance(plane: &mut [u8], width: u32, height: u32, tiles: u32, clip_limit: f32) {
    let w = width as usize;
    let h = height as usize;
    let t = tiles.max(1) as usize;
    if w == 0 || h == 0 || plane.len() < w * h {
        return;
    }

    let tile_w = w / t;
    let tile_h = h / t;
    if tile_w == 0 || tile_h == 0 {
        return;
    }
    let tile_pixels = tile_w * tile_h;
    let clip = ((clip_limit * tile_pixels as f32 / 256.0) as u32).max(1);

    let mut luts: Vec<[f32; 256]> = Vec::with_capacity(t * t);
    for row in 0..t {
        for col in 0..t {
            let mut hist = [0u32; 256];
            for y in row * tile_h..(row + 1) * tile_h {
                for x in col * tile_w..(col + 1) * tile_w {
                    hist[plane[y * w + x] as usize] += 1;
                }
            }
            luts.push(clipped_cdf(&mut hist, clip, tile_pixels));
        }
    }

    for y in 0..h {
        let fy = ((y as f32 + 0.5) / tile_h as f32 - 0.5).clamp(0.0, (t - 1) as f32);
        let r0 = fy as usize;
        let r1 = (r0 + 1).min(t - 1);
        let dy = fy - r0 as f32;

        for x in 0..w {
            let fx = ((x as f32 + 0.5) / tile_w as f32 - 0.5).clamp(0.0, (t - 1) as f32);
            let c0 = fx as usize;
            let c1 = (c0 + 1).min(t - 1);
            let dx = fx - c0 as f32;

            let v = plane[y * w + x] as usize;
            let top = luts[r0 * t + c0][v] * (1.0 - dx) + luts[r0 * t + c1][v] * dx;
            let bot = luts[r1 * t + c0][v] * (1.0 - dx) + luts[r1 * t + c1][v] * dx;

            plane[y * w + x] = (top * (1.0 - dy) + bot * dy).round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Clip a histogram, redistribute the excess, and return its 0–255 CDF.
fn clipped_cdf(hist: &mut [u32; 256], clip: u32, total: usize) -> [f32; 256] {
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
        *bin += redist + u32::from(i < leftover);
    }

    let scale = 255.0 / total as f32;
    let mut cdf = [0f32; 256];
    let mut acc = 0u32;
    for (i, &count) in hist.iter().enumerate() {
        acc += count;
        cdf[i] = (acc as f32 * scale).clamp(0.0, 255.0);
    }
    cdf
}

fn srgb_to_linear(c: u8) -> f32 {
    let c = c as f32 / 255.0;
    if c <= 0.04045 { c / 12.92 } else { ((c + 0.055) / 1.055).powf(2.4) }
}

fn linear_to_srgb(c: f32) -> u8 {
    let c = c.clamp(0.0, 1.0);
    let v = if c <= 0.003_130_8 { 12.92 * c } else { 1.055 * c.powf(1.0 / 2.4) - 0.055 };
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}

fn lab_f(t: f32) -> f32 {
    if t > LAB_DELTA.powi(3) {
        t.cbrt()
    } else {
        t / (3.0 * LAB_DELTA * LAB_DELTA) + 4.0 / 29.0
    }
}

fn lab_f_inv(t: f32) -> f32 {
    if t > LAB_DELTA {
        t.powi(3)
    } else {
        3.0 * LAB_DELTA * LAB_DELTA * (t - 4.0 / 29.0)
    }
}

/// sRGB (8-bit) to CIE L*a*b* under D65.
pub fn rgb_to_lab(rgb: [u8; 3]) -> [f32; 3] {
    let [r, g, b] = rgb.map(srgb_to_linear);

    let x = 0.412_456_4 * r + 0.357_576_1 * g + 0.180_437_5 * b;
    let y = 0.212_672_9 * r + 0.715_152_2 * g + 0.072_175_0 * b;
    let z = 0.019_333_9 * r + 0.119_192_0 * g + 0.950_304_1 * b;

    let fx = lab_f(x / WHITE_X);
    let fy = lab_f(y);
    let fz = lab_f(z / WHITE_Z);

    [116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz)]
}

/// CIE L*a*b* (D65) back to 8-bit sRGB, clamping out-of-gamut values.
pub fn lab_to_rgb(lab: [f32; 3]) -> [u8; 3] {
    let fy = (lab[0] + 16.0) / 116.0;
    let fx = fy + lab[1] / 500.0;
    let fz = fy - lab[2] / 200.0;

    let x = WHITE_X * lab_f_inv(fx);
    let y = lab_f_inv(fy);
    let z = WHITE_Z * lab_f_inv(fz);

    let r = 3.240_454_2 * x - 1.537_138_5 * y - 0.498_531_4 * z;
    let g = -0.969_266_0 * x + 1.876_010_8 * y + 0.041_556_0 * z;
    let b = 0.055_643_4 * x - 0.204_025_9 * y + 1.057_225_2 * z;

    [linear_to_srgb(r), linear_to_srgb(g), linear_to_srgb(b)]
}
