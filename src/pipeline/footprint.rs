//! Shape of a light's pixel footprint on the equirectangular grid.

use crate::core::math::equirect::{pixel_solid_angle, pixel_to_dir};
use nalgebra::{Matrix2, SymmetricEigen, Vector2};
use std::f32::consts::TAU;

/// Fewest pixels an ellipse is fitted to.
pub const MIN_FOOTPRINT_PIXELS: usize = 5;

/// Second-moment ellipse of a pixel set, in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ellipse {
    pub center: Vector2<f32>,
    /// Unit principal directions.
    pub axes: [Vector2<f32>; 2],
    /// Semi-axis lengths along `axes`.
    pub radii: [f32; 2],
}

impl Ellipse {
    /// Fits the ellipse with the same first and second moments as `pixels`.
    pub fn fit(pixels: &[(usize, usize)]) -> Option<Self> {
        if pixels.len() < MIN_FOOTPRINT_PIXELS {
            return None;
        }
        let n = pixels.len() as f32;
        let center = pixels
            .iter()
            .map(|&(x, y)| Vector2::new(x as f32, y as f32))
            .sum::<Vector2<f32>>()
            / n;
        let covariance = pixels
            .iter()
            .map(|&(x, y)| {
                let d = Vector2::new(x as f32, y as f32) - center;
                d * d.transpose()
            })
            .sum::<Matrix2<f32>>()
            / n;

        let eigen = SymmetricEigen::new(covariance);
        let axes = [
            eigen.eigenvectors.column(0).into_owned(),
            eigen.eigenvectors.column(1).into_owned(),
        ];
        // A uniform filled ellipse with semi-axis a has variance a²/4 along it.
        let radii = eigen.eigenvalues.map(|l| 2.0 * l.max(0.0).sqrt());
        Some(Self {
            center,
            axes,
            radii: [radii[0], radii[1]],
        })
    }

    /// Solid angle of the cone spanned by the ellipse on an equirectangular image.
    ///
    /// `a0`, `a1` are the angles between the directions of opposite extrema along each axis;
    /// the result is `2π(1 − cos((a0 + a1)/4))`, never less than one pixel at the center row.
    pub fn solid_angle(&self, width: usize, height: usize) -> f32 {
        let angle = |axis: &Vector2<f32>, radius: f32| {
            let a = self.center + axis * radius;
            let b = self.center - axis * radius;
            let da = pixel_to_dir(a.x, a.y, width, height);
            let db = pixel_to_dir(b.x, b.y, width, height);
            da.dot(&db).clamp(-1.0, 1.0).acos()
        };
        let a0 = angle(&self.axes[0], self.radii[0]);
        let a1 = angle(&self.axes[1], self.radii[1]);
        let cone = TAU * (1.0 - ((a0 + a1) / 4.0).cos());

        let row = (self.center.y.round().max(0.0) as usize).min(height.saturating_sub(1));
        cone.max(pixel_solid_angle(row, width, height))
    }

    /// Pixels inside the ellipse, clipped to the image.
    pub fn rasterize(&self, width: usize, height: usize) -> Vec<(usize, usize)> {
        let reach = self.radii[0].max(self.radii[1]).ceil() as isize + 1;
        let (cx, cy) = (self.center.x.round() as isize, self.center.y.round() as isize);
        let mut inside = Vec::new();
        for y in (cy - reach).max(0)..=(cy + reach).min(height as isize - 1) {
            for x in (cx - reach).max(0)..=(cx + reach).min(width as isize - 1) {
                let d = Vector2::new(x as f32, y as f32) - self.center;
                let r: f32 = (0..2)
                    .map(|i| {
                        let along = d.dot(&self.axes[i]) / self.radii[i].max(0.5);
                        along * along
                    })
                    .sum();
                if r <= 1.0 {
                    inside.push((x as usize, y as usize));
                }
            }
        }
        inside
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn disc(cx: usize, cy: usize, r: usize) -> Vec<(usize, usize)> {
        let mut pixels = Vec::new();
        for y in cy - r..=cy + r {
            for x in cx - r..=cx + r {
                let (dx, dy) = (x as f32 - cx as f32, y as f32 - cy as f32);
                if dx * dx + dy * dy <= (r * r) as f32 {
                    pixels.push((x, y));
                }
            }
        }
        pixels
    }

    #[test]
    fn disc_fits_a_circle() {
        let ellipse = Ellipse::fit(&disc(50, 40, 10)).unwrap();
        assert!((ellipse.center - Vector2::new(50.0, 40.0)).norm() < 1e-4);
        for r in ellipse.radii {
            assert!((r - 10.0).abs() < 0.6, "{r}");
        }
    }

    #[test]
    fn elongated_footprint_has_distinct_axes() {
        let pixels: Vec<_> = (0..40).flat_map(|x| (0..4).map(move |y| (x + 10, y + 20))).collect();
        let ellipse = Ellipse::fit(&pixels).unwrap();
        let (minor, major) = (ellipse.radii[0].min(ellipse.radii[1]), ellipse.radii[0].max(ellipse.radii[1]));
        assert!(major > 5.0 * minor);
        assert!(ellipse.rasterize(100, 100).len() > 60);
    }

    #[test]
    fn too_few_pixels() {
        assert!(Ellipse::fit(&[(0, 0), (1, 0), (0, 1), (1, 1)]).is_none());
    }

    #[test]
    fn equatorial_cap_solid_angle() {
        // 360 px around: one pixel spans one degree at the equator.
        let (width, height) = (360, 180);
        let ellipse = Ellipse::fit(&disc(180, 90, 10)).unwrap();
        let omega = ellipse.solid_angle(width, height);
        let half_angle = 10f32.to_radians();
        let expected = 2.0 * PI * (1.0 - half_angle.cos());
        assert!((omega - expected).abs() / expected < 0.15, "{omega} vs {expected}");
    }

    #[test]
    fn solid_angle_never_below_one_pixel() {
        let ellipse = Ellipse {
            center: Vector2::new(10.0, 10.0),
            axes: [Vector2::x(), Vector2::y()],
            radii: [0.0, 0.0],
        };
        assert_eq!(ellipse.solid_angle(64, 32), pixel_solid_angle(10, 64, 32));
    }
}
