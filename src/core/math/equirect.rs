//! Equirectangular pixel/direction conversions.
//!
//! One fixed bijection is used everywhere (rendering, detection, sun accumulation):
//! `lng = u·2π`, `lat = (1 − v)·π`, `dir = (−sin lng·sin lat, cos lng·sin lat, −cos lat)`,
//! with `u = (px + 0.5)/W` and `v = (py + 0.5)/H` at pixel centers. +Z is up (top row).

use nalgebra::Vector3;
use std::f32::consts::{PI, TAU};

/// Direction for continuous image coordinates `u, v` in `[0, 1]`.
#[inline]
pub fn uv_to_dir(u: f32, v: f32) -> Vector3<f32> {
    let lng = u * TAU;
    let lat = (1.0 - v) * PI;
    let (sin_lng, cos_lng) = lng.sin_cos();
    let (sin_lat, cos_lat) = lat.sin_cos();
    Vector3::new(-sin_lng * sin_lat, cos_lng * sin_lat, -cos_lat)
}

/// Direction through the center of pixel `(px, py)`. Fractional pixel coordinates are allowed.
#[inline]
pub fn pixel_to_dir(px: f32, py: f32, width: usize, height: usize) -> Vector3<f32> {
    uv_to_dir((px + 0.5) / width as f32, (py + 0.5) / height as f32)
}

/// Continuous `(u, v)` of a direction. The direction does not need to be normalized.
#[inline]
pub fn dir_to_uv(dir: &Vector3<f32>) -> (f32, f32) {
    let lat = (dir.x.hypot(dir.y)).atan2(-dir.z);
    let lng = (-dir.x).atan2(dir.y).rem_euclid(TAU);
    (lng / TAU, 1.0 - lat / PI)
}

/// Pixel containing a direction.
#[inline]
pub fn dir_to_pixel(dir: &Vector3<f32>, width: usize, height: usize) -> (usize, usize) {
    let (u, v) = dir_to_uv(dir);
    let px = ((u * width as f32).floor() as i64).rem_euclid(width as i64) as usize;
    let py = ((v * height as f32).floor() as i64).clamp(0, height as i64 - 1) as usize;
    (px, py)
}

/// Solid angle covered by one pixel of row `py`.
#[inline]
pub fn pixel_solid_angle(py: usize, width: usize, height: usize) -> f32 {
    let lat = (1.0 - (py as f32 + 0.5) / height as f32) * PI;
    (TAU / width as f32) * (PI / height as f32) * lat.sin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_direction_bijection() {
        for &(w, h) in &[(100usize, 50usize), (64, 32), (777, 388)] {
            for py in (0..h).step_by(3) {
                for px in (0..w).step_by(5) {
                    let dir = pixel_to_dir(px as f32, py as f32, w, h);
                    assert!((dir.norm() - 1.0).abs() < 1e-5);
                    assert_eq!(dir_to_pixel(&dir, w, h), (px, py), "size {w}x{h}");
                }
            }
        }
    }

    #[test]
    fn top_row_points_up() {
        let dir = pixel_to_dir(0.0, 0.0, 100, 50);
        assert!(dir.z > 0.99);
        let dir = pixel_to_dir(0.0, 49.0, 100, 50);
        assert!(dir.z < -0.99);
    }

    #[test]
    fn solid_angles_cover_sphere() {
        let (w, h) = (200, 100);
        let total: f32 = (0..h).map(|py| pixel_solid_angle(py, w, h) * w as f32).sum();
        assert!((total - 4.0 * PI).abs() < 1e-2, "total {total}");
    }
}
