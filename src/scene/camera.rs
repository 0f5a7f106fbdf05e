use nalgebra::{Matrix4, Point3};
use std::sync::Arc;

/// Color camera calibration as stored in a capture's info file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub fx: f32,
    pub fy: f32,
    /// Raw principal point in pixels.
    pub ox: f32,
    pub oy: f32,
    pub width: usize,
    pub height: usize,
}

/// Intrinsics with the principal point offset normalized by the larger image side,
/// relative to the image center. Used for vertex projection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CenteredIntrinsics {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
    pub width: usize,
    pub height: usize,
}

/// Intrinsics with the raw principal point. Used to cast rays through frame pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawIntrinsics {
    pub fx: f32,
    pub fy: f32,
    pub ox: f32,
    pub oy: f32,
    pub width: usize,
    pub height: usize,
}

impl Calibration {
    /// Reads `fx, fy, ox, oy` from a row-major 4×4 intrinsic matrix.
    pub fn from_matrix(m: &Matrix4<f32>, width: usize, height: usize) -> Self {
        Self {
            fx: m[(0, 0)],
            fy: m[(1, 1)],
            ox: m[(0, 2)],
            oy: m[(1, 2)],
            width,
            height,
        }
    }

    pub fn centered(&self) -> CenteredIntrinsics {
        let w = self.width as f32;
        let h = self.height as f32;
        let scale = w.max(h);
        CenteredIntrinsics {
            fx: self.fx,
            fy: self.fy,
            cx: (self.ox - w / 2.0) / scale,
            cy: (self.oy - h / 2.0) / scale,
            width: self.width,
            height: self.height,
        }
    }

    pub fn raw(&self) -> RawIntrinsics {
        RawIntrinsics {
            fx: self.fx,
            fy: self.fy,
            ox: self.ox,
            oy: self.oy,
            width: self.width,
            height: self.height,
        }
    }
}

/// Sentinel written into unused target texels.
pub const TARGET_SENTINEL: [f32; 4] = [-1.0, -1.0, -1.0, -1.0];

/// Square texture with one ray target per mesh vertex.
///
/// Texel `i` holds vertex `i` as `(x, y, z, 1)`; texels past the vertex count hold
/// [`TARGET_SENTINEL`].
#[derive(Debug, Clone)]
pub struct TargetTexture {
    pub size: usize,
    pub vertex_count: usize,
    pub texels: Vec<[f32; 4]>,
}

impl TargetTexture {
    pub fn from_positions(positions: &[Point3<f32>]) -> Self {
        let size = (positions.len() as f64).sqrt().ceil() as usize;
        let mut texels = vec![TARGET_SENTINEL; size * size];
        for (texel, p) in texels.iter_mut().zip(positions) {
            *texel = [p.x, p.y, p.z, 1.0];
        }
        Self {
            size,
            vertex_count: positions.len(),
            texels,
        }
    }

    pub fn len(&self) -> usize {
        self.texels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texels.is_empty()
    }

    /// Target point of texel `i`, `None` for padding.
    pub fn target(&self, i: usize) -> Option<Point3<f32>> {
        let [x, y, z, w] = *self.texels.get(i)?;
        (w > 0.0).then(|| Point3::new(x, y, z))
    }

    /// Flattened `xyzw` texels for kernel buffers.
    pub fn to_buffer(&self) -> Vec<f32> {
        self.texels.iter().flatten().copied().collect()
    }
}

/// Full-sphere camera producing an equirectangular image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PanoramicCamera {
    pub eye: Point3<f32>,
    pub width: usize,
    pub height: usize,
    /// Sub-pixel samples per axis.
    pub samples: usize,
}

/// Camera configuration submitted to the render device.
#[derive(Debug, Clone)]
pub enum CameraSetup {
    /// One ray per target texel, from `eye` toward the texel's point.
    RayTargets {
        eye: Point3<f32>,
        targets: Arc<TargetTexture>,
    },
    Panoramic(PanoramicCamera),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn centered_intrinsics_normalize_by_long_side() {
        let calibration = Calibration {
            fx: 500.0,
            fy: 510.0,
            ox: 330.0,
            oy: 230.0,
            width: 640,
            height: 480,
        };
        let centered = calibration.centered();
        assert!((centered.cx - 10.0 / 640.0).abs() < 1e-7);
        assert!((centered.cy + 10.0 / 640.0).abs() < 1e-7);
        assert_eq!(calibration.raw().ox, 330.0);
    }

    #[test]
    fn target_texture_pads_with_sentinel() {
        let positions: Vec<Point3<f32>> = (0..10).map(|i| Point3::new(i as f32, 0.0, 0.0)).collect();
        let texture = TargetTexture::from_positions(&positions);
        assert_eq!(texture.size, 4);
        assert_eq!(texture.len(), 16);
        assert_eq!(texture.target(9), Some(Point3::new(9.0, 0.0, 0.0)));
        assert_eq!(texture.target(10), None);
        assert_eq!(texture.texels[15], TARGET_SENTINEL);
        assert_eq!(texture.to_buffer().len(), 64);
    }
}
