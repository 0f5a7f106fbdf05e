use nalgebra::{Matrix4, Point3, Vector3, Vector4};

//=================================
// Transform Matrix Factory
//=================================

/// Factory for the handful of matrices the estimator needs.
/// Everything is right-handed; cameras look down -Z with +Y up (render convention).
pub struct TransformFactory;

#[rustfmt::skip]
impl TransformFactory {
    /// Creates a translation matrix.
    pub fn translation(translation: &Vector3<f32>) -> Matrix4<f32> {
        Matrix4::new(
            1.0, 0.0, 0.0, translation.x,
            0.0, 1.0, 0.0, translation.y,
            0.0, 0.0, 1.0, translation.z,
            0.0, 0.0, 0.0, 1.0,
        )
    }

    /// Flips Y and Z: converts a capture-device camera frame (+Y down, +Z forward)
    /// into the render convention (+Y up, -Z forward).
    pub fn render_flip() -> Matrix4<f32> {
        Matrix4::new(
            1.0,  0.0,  0.0, 0.0,
            0.0, -1.0,  0.0, 0.0,
            0.0,  0.0, -1.0, 0.0,
            0.0,  0.0,  0.0, 1.0,
        )
    }

    /// Creates a View matrix (Look-At, Right-Handed).
    /// Transforms world space coordinates to camera/view space.
    pub fn view(eye: &Point3<f32>, target: &Point3<f32>, up: &Vector3<f32>) -> Matrix4<f32> {
        // In RHS, camera looks down -Z
        let z_axis = (eye - target).normalize();
        let x_axis = up.cross(&z_axis).normalize();
        let y_axis = z_axis.cross(&x_axis);

        // Rotation matrix from world to view
        let rotation = Matrix4::new(
            x_axis.x, x_axis.y, x_axis.z, 0.0,
            y_axis.x, y_axis.y, y_axis.z, 0.0,
            z_axis.x, z_axis.y, z_axis.z, 0.0,
            0.0,      0.0,      0.0,      1.0,
        );

        // Translation matrix to move camera to origin
        let translation = Self::translation(&-eye.coords);

        rotation * translation
    }
}

//=================================
// Core Transformation Functions
//=================================

/// World-to-camera and camera-to-world (render convention) from a capture pose.
///
/// Returns `None` for non-finite or singular poses.
pub fn extrinsics_from_pose(pose: &Matrix4<f32>) -> Option<(Matrix4<f32>, Matrix4<f32>)> {
    if pose.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let camera_to_world = pose * TransformFactory::render_flip();
    let world_to_camera = camera_to_world.try_inverse()?;
    Some((world_to_camera, camera_to_world))
}

/// Translation column of a camera-to-world matrix.
#[inline]
pub fn eye_position(camera_to_world: &Matrix4<f32>) -> Point3<f32> {
    Point3::new(
        camera_to_world[(0, 3)],
        camera_to_world[(1, 3)],
        camera_to_world[(2, 3)],
    )
}

#[inline]
pub fn transform_point(m: &Matrix4<f32>, p: &Point3<f32>) -> Point3<f32> {
    let v = m * Vector4::new(p.x, p.y, p.z, 1.0);
    Point3::new(v.x, v.y, v.z)
}

#[inline]
pub fn transform_vector(m: &Matrix4<f32>, v: &Vector3<f32>) -> Vector3<f32> {
    (m * Vector4::new(v.x, v.y, v.z, 0.0)).xyz()
}
