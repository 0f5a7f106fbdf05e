use nalgebra::Vector3;
use rayon::prelude::*;

/// Resolved HDR color and depth for a 2D image.
///
/// Each pixel is shaded from `sample_count × sample_count` stratified sub-pixel samples
/// and stored already averaged. Depth is `f32::INFINITY` where no sample hit geometry.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pub width: usize,
    pub height: usize,
    pub sample_count: usize,
    pub color_buffer: Vec<Vector3<f32>>,
    pub depth_buffer: Vec<f32>,
}

/// Result of shading one sub-pixel sample.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub color: Vector3<f32>,
    /// Distance to the hit, `None` when the sample escaped to the sky.
    pub depth: Option<f32>,
}

impl FrameBuffer {
    pub fn new(width: usize, height: usize, sample_count: usize) -> Self {
        let size = width * height;
        Self {
            width,
            height,
            sample_count: sample_count.max(1),
            color_buffer: vec![Vector3::zeros(); size],
            depth_buffer: vec![f32::INFINITY; size],
        }
    }

    #[inline(always)]
    fn index(&self, x: usize, y: usize) -> usize {
        y * self.width + x
    }

    /// Stratified sub-pixel offsets in `[0, 1)²`.
    pub fn sample_offsets(&self) -> Vec<(f32, f32)> {
        let n = self.sample_count;
        let step = 1.0 / n as f32;
        (0..n * n)
            .map(|i| {
                let (sx, sy) = (i % n, i / n);
                ((sx as f32 + 0.5) * step, (sy as f32 + 0.5) * step)
            })
            .collect()
    }

    /// Shades every pixel in parallel (one rayon task per row).
    ///
    /// `shade(x, y, offset)` is called once per sub-pixel sample; colors are averaged over all
    /// samples (sky samples contribute their color too) and depth keeps the nearest hit.
    pub fn shade<F>(&mut self, shade: F)
    where
        F: Fn(usize, usize, (f32, f32)) -> Sample + Sync,
    {
        let width = self.width.max(1);
        let offsets = self.sample_offsets();
        let inv_samples = 1.0 / offsets.len() as f32;

        self.color_buffer
            .par_chunks_mut(width)
            .zip(self.depth_buffer.par_chunks_mut(width))
            .enumerate()
            .for_each(|(y, (color_row, depth_row))| {
                for (x, (color, depth)) in color_row.iter_mut().zip(depth_row.iter_mut()).enumerate()
                {
                    let mut sum = Vector3::zeros();
                    let mut nearest = f32::INFINITY;
                    for &offset in &offsets {
                        let sample = shade(x, y, offset);
                        sum += sample.color;
                        if let Some(d) = sample.depth {
                            nearest = nearest.min(d);
                        }
                    }
                    *color = sum * inv_samples;
                    *depth = nearest;
                }
            });
    }

    pub fn get_pixel(&self, x: usize, y: usize) -> Option<Vector3<f32>> {
        if x >= self.width || y >= self.height {
            return None;
        }
        Some(self.color_buffer[self.index(x, y)])
    }

    /// Depth at a pixel, `None` for sky or out of bounds.
    pub fn get_depth(&self, x: usize, y: usize) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let depth = self.depth_buffer[self.index(x, y)];
        depth.is_finite().then_some(depth)
    }
}
