use nalgebra::Vector3;

pub const EPSILON: f32 = 1e-5;

/// Barycentric weights `(alpha, beta, gamma)` from the two edge parameters `(u, v)` returned by
/// ray/triangle intersection, where `u` weights the second corner and `v` the third.
#[inline]
pub fn barycentric_from_uv(u: f32, v: f32) -> Vector3<f32> {
    Vector3::new(1.0 - u - v, u, v)
}

/// Checks if the barycentric coordinates represent a point inside the triangle.
/// Points on edges (within a small tolerance) count as inside.
#[inline(always)]
pub fn is_inside_triangle(bary: Vector3<f32>, tolerance: f32) -> bool {
    bary.x >= -tolerance && bary.y >= -tolerance && bary.z >= -tolerance
}

/// Index (0, 1 or 2) of the triangle corner with the largest weight.
#[inline]
pub fn dominant_corner(bary: &Vector3<f32>) -> u32 {
    if bary.x >= bary.y && bary.x >= bary.z {
        0
    } else if bary.y >= bary.z {
        1
    } else {
        2
    }
}

/// Linearly interpolates three per-corner attributes.
#[inline]
pub fn interpolate(
    bary: &Vector3<f32>,
    a: &Vector3<f32>,
    b: &Vector3<f32>,
    c: &Vector3<f32>,
) -> Vector3<f32> {
    a * bary.x + b * bary.y + c * bary.z
}
