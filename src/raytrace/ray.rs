use crate::core::math::interpolation::{barycentric_from_uv, is_inside_triangle};
use nalgebra::{Point3, Vector3};

/// Closest distance accepted for a hit.
pub const T_MIN: f32 = 1e-6;

/// Barycentric slack so rays aimed exactly at shared vertices and edges still hit.
pub const EDGE_TOLERANCE: f32 = 1e-4;

#[derive(Debug, Clone, Copy)]
pub struct Ray {
    pub origin: Point3<f32>,
    pub dir: Vector3<f32>,
    inv_dir: Vector3<f32>,
}

impl Ray {
    pub fn new(origin: Point3<f32>, dir: Vector3<f32>) -> Self {
        Self {
            origin,
            dir,
            inv_dir: dir.map(|d| 1.0 / d),
        }
    }

    #[inline]
    pub fn at(&self, t: f32) -> Point3<f32> {
        self.origin + self.dir * t
    }
}

/// Closest intersection found along a ray.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub face: u32,
    pub t: f32,
    /// Barycentric weights of the three face corners.
    pub bary: Vector3<f32>,
}

/// Möller–Trumbore ray/triangle intersection. Returns `(t, u, v)`.
#[inline]
pub fn intersect_triangle(
    ray: &Ray,
    a: &Point3<f32>,
    b: &Point3<f32>,
    c: &Point3<f32>,
    t_max: f32,
) -> Option<(f32, f32, f32)> {
    let e1 = b - a;
    let e2 = c - a;
    let p = ray.dir.cross(&e2);
    let det = e1.dot(&p);
    if det.abs() < 1e-12 || !det.is_finite() {
        return None;
    }
    let inv_det = 1.0 / det;
    let s = ray.origin - a;
    let u = s.dot(&p) * inv_det;
    let q = s.cross(&e1);
    let v = ray.dir.dot(&q) * inv_det;
    if !is_inside_triangle(barycentric_from_uv(u, v), EDGE_TOLERANCE) {
        return None;
    }
    let t = e2.dot(&q) * inv_det;
    (t > T_MIN && t < t_max).then_some((t, u, v))
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Point3<f32>,
    pub max: Point3<f32>,
}

impl Aabb {
    /// Empty box that any point grows.
    pub fn neutral() -> Self {
        Self {
            min: Point3::new(f32::MAX, f32::MAX, f32::MAX),
            max: Point3::new(f32::MIN, f32::MIN, f32::MIN),
        }
    }

    pub fn from_triangle(tri: &[Point3<f32>; 3]) -> Self {
        let mut aabb = Self::neutral();
        tri.iter().for_each(|p| aabb.grow_point(p));
        // Match the barycentric slack of the triangle test.
        let pad = (aabb.max - aabb.min).norm() * EDGE_TOLERANCE + 1e-6;
        aabb.min -= Vector3::repeat(pad);
        aabb.max += Vector3::repeat(pad);
        aabb
    }

    pub fn grow_point(&mut self, p: &Point3<f32>) {
        self.min = self.min.inf(p);
        self.max = self.max.sup(p);
    }

    pub fn grow(&mut self, other: &Aabb) {
        self.min = self.min.inf(&other.min);
        self.max = self.max.sup(&other.max);
    }

    pub fn size(&self) -> Vector3<f32> {
        (self.max - self.min).map(|d| d.max(0.0))
    }

    /// Half the surface area (enough for SAH comparisons).
    pub fn half_area(&self) -> f32 {
        let s = self.size();
        s.x * (s.y + s.z) + s.y * s.z
    }

    /// Slab test. Returns the entry distance when the box is hit before `t_max`.
    #[inline]
    pub fn hit(&self, ray: &Ray, t_max: f32) -> Option<f32> {
        let t1 = (self.min - ray.origin).component_mul(&ray.inv_dir);
        let t2 = (self.max - ray.origin).component_mul(&ray.inv_dir);
        let t_enter = t1.zip_map(&t2, f32::min).max().max(0.0);
        let t_exit = t1.zip_map(&t2, f32::max).min().min(t_max);
        (t_enter <= t_exit).then_some(t_enter)
    }
}
