use nalgebra::{Point3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// A detected light source, as written to `lights.json`.
///
/// `exposure` is in EV (log2) units. `rotation` is a quaternion stored `[x, y, z, w]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DetectedLight {
    #[serde(rename = "POINT")]
    Point {
        position: [f32; 3],
        color: [f32; 3],
        exposure: f32,
    },
    #[serde(rename = "SUN")]
    Sun {
        rotation: [f32; 4],
        color: [f32; 3],
        exposure: f32,
    },
}

impl DetectedLight {
    pub fn new_point(position: Point3<f32>, color: Vector3<f32>, exposure: f32) -> Self {
        Self::Point {
            position: position.coords.into(),
            color: color.into(),
            exposure,
        }
    }

    pub fn new_sun(rotation: UnitQuaternion<f32>, color: Vector3<f32>, exposure: f32) -> Self {
        let q = rotation.quaternion();
        Self::Sun {
            rotation: [q.i, q.j, q.k, q.w],
            color: color.into(),
            exposure,
        }
    }

    pub fn exposure(&self) -> f32 {
        match self {
            DetectedLight::Point { exposure, .. } | DetectedLight::Sun { exposure, .. } => *exposure,
        }
    }

    pub fn is_sun(&self) -> bool {
        matches!(self, DetectedLight::Sun { .. })
    }
}

/// Spherical-Gaussian lobe of a point light as seen from the panorama viewpoint.
///
/// Radiance toward direction `d` is `amplitude · exp(sharpness · (d·axis − 1))`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightLobe {
    pub amplitude: Vector3<f32>,
    pub axis: Vector3<f32>,
    pub sharpness: f32,
}

impl LightLobe {
    pub fn eval(&self, dir: &Vector3<f32>) -> Vector3<f32> {
        self.amplitude * (self.sharpness * (dir.dot(&self.axis) - 1.0)).exp()
    }

    /// Packs the lobe as `[amplitude, 0, axis, 0, sharpness, 0, 0, 0]` for kernel buffers.
    pub fn to_array(&self) -> [f32; 12] {
        let a = &self.amplitude;
        let d = &self.axis;
        [
            a.x, a.y, a.z, 0.0, d.x, d.y, d.z, 0.0, self.sharpness, 0.0, 0.0, 0.0,
        ]
    }
}
