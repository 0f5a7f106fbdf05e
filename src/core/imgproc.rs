//! Small image-domain operators on row-major `f32` planes and boolean masks.

use image::RgbImage;
use rayon::prelude::*;

/// Sobel derivative kernels (3×3).
const SOBEL_KERNEL_X: [[f32; 3]; 3] = [[-1.0, 0.0, 1.0], [-2.0, 0.0, 2.0], [-1.0, 0.0, 1.0]];
const SOBEL_KERNEL_Y: [[f32; 3]; 3] = [[-1.0, -2.0, -1.0], [0.0, 0.0, 0.0], [1.0, 2.0, 1.0]];

/// Row-major boolean image.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    pub width: usize,
    pub height: usize,
    pub data: Vec<bool>,
}

impl Mask {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![false; width * height],
        }
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> bool {
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: bool) {
        self.data[y * self.width + x] = value;
    }

    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&v| v).count()
    }

    pub fn is_full(&self) -> bool {
        self.data.iter().all(|&v| v)
    }
}

/// Gray value with the ITU-R BT.601 weights.
#[inline]
fn gray(rgb: &[u8; 3]) -> f32 {
    0.299 * rgb[0] as f32 + 0.587 * rgb[1] as f32 + 0.114 * rgb[2] as f32
}

/// Marks pixels whose Sobel response `max(|dx|, |dy|)` exceeds `threshold`.
/// Borders are handled by clamping sample coordinates.
pub fn sobel_edge_mask(image: &RgbImage, threshold: f32) -> Mask {
    let width = image.width() as usize;
    let height = image.height() as usize;
    let luma: Vec<f32> = image.pixels().map(|p| gray(&p.0)).collect();

    let mut data = vec![false; width * height];
    data.par_chunks_mut(width.max(1))
        .enumerate()
        .for_each(|(y, row)| {
            for (x, edge) in row.iter_mut().enumerate() {
                let mut gx = 0.0;
                let mut gy = 0.0;
                for (ky, (row_x, row_y)) in SOBEL_KERNEL_X.iter().zip(&SOBEL_KERNEL_Y).enumerate() {
                    let sy = (y as isize + ky as isize - 1).clamp(0, height as isize - 1) as usize;
                    for kx in 0..3 {
                        let sx =
                            (x as isize + kx as isize - 1).clamp(0, width as isize - 1) as usize;
                        let value = luma[sy * width + sx];
                        gx += row_x[kx] * value;
                        gy += row_y[kx] * value;
                    }
                }
                *edge = gx.abs().max(gy.abs()) > threshold;
            }
        });

    Mask {
        width,
        height,
        data,
    }
}

/// Normalized 1D Gaussian kernel of odd `size`, sigma chosen the way OpenCV derives it.
pub fn gaussian_kernel(size: usize) -> Vec<f32> {
    let size = size.max(1) | 1;
    let sigma = 0.3 * ((size as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let half = (size / 2) as f32;
    let mut kernel: Vec<f32> = (0..size)
        .map(|i| {
            let d = i as f32 - half;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|k| *k /= sum);
    kernel
}

/// Separable Gaussian blur of a single-channel plane with replicated borders.
pub fn gaussian_blur(plane: &[f32], width: usize, height: usize, size: usize) -> Vec<f32> {
    let kernel = gaussian_kernel(size);
    let half = (kernel.len() / 2) as isize;

    // 1. Horizontal pass
    let mut horizontal = vec![0.0; plane.len()];
    horizontal
        .par_chunks_mut(width.max(1))
        .enumerate()
        .for_each(|(y, row)| {
            let src = &plane[y * width..(y + 1) * width];
            for (x, out) in row.iter_mut().enumerate() {
                *out = kernel
                    .iter()
                    .enumerate()
                    .map(|(k, w)| {
                        let sx = (x as isize + k as isize - half).clamp(0, width as isize - 1);
                        w * src[sx as usize]
                    })
                    .sum();
            }
        });

    // 2. Vertical pass
    let mut blurred = vec![0.0; plane.len()];
    blurred
        .par_chunks_mut(width.max(1))
        .enumerate()
        .for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate() {
                *out = kernel
                    .iter()
                    .enumerate()
                    .map(|(k, w)| {
                        let sy = (y as isize + k as isize - half).clamp(0, height as isize - 1);
                        w * horizontal[sy as usize * width + x]
                    })
                    .sum();
            }
        });
    blurred
}

/// Position and value of the maximum over pixels not set in `claimed`.
pub fn masked_max(plane: &[f32], claimed: &Mask) -> Option<(usize, f32)> {
    plane
        .iter()
        .zip(&claimed.data)
        .enumerate()
        .filter(|(_, (v, taken))| !**taken && v.is_finite())
        .map(|(i, (v, _))| (i, *v))
        .fold(None, |best, (i, v)| match best {
            Some((_, best_v)) if best_v >= v => best,
            _ => Some((i, v)),
        })
}

/// 8-connected flood fill from `seed` over pixels whose value stays within
/// `tolerance · seed_value` of the seed value (fixed range).
///
/// Pixels already set in `claimed` are never entered. Newly filled pixels are set in `claimed`
/// and returned as `(x, y)` pairs.
pub fn flood_fill(
    plane: &[f32],
    claimed: &mut Mask,
    seed: (usize, usize),
    tolerance: f32,
) -> Vec<(usize, usize)> {
    let (width, height) = (claimed.width, claimed.height);
    let seed_value = plane[seed.1 * width + seed.0];
    let range = (seed_value * tolerance).abs();
    let accepts = |v: f32| (v - seed_value).abs() <= range;

    let mut footprint = Vec::new();
    if claimed.get(seed.0, seed.1) {
        return footprint;
    }

    let mut stack = vec![seed];
    claimed.set(seed.0, seed.1, true);
    while let Some((x, y)) = stack.pop() {
        footprint.push((x, y));
        for dy in -1isize..=1 {
            for dx in -1isize..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let nx = x as isize + dx;
                let ny = y as isize + dy;
                if nx < 0 || ny < 0 || nx >= width as isize || ny >= height as isize {
                    continue;
                }
                let (nx, ny) = (nx as usize, ny as usize);
                if !claimed.get(nx, ny) && accepts(plane[ny * width + nx]) {
                    claimed.set(nx, ny, true);
                    stack.push((nx, ny));
                }
            }
        }
    }
    footprint
}
