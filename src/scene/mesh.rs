use crate::error::{EstimateError, Result};
use nalgebra::{Point3, Vector3};

/// One static triangulated surface.
///
/// Geometry is fixed at construction. The per-vertex radiance attribute can be attached
/// exactly once, after reprojection.
#[derive(Debug, Clone)]
pub struct Mesh {
    pub positions: Vec<Point3<f32>>,
    pub faces: Vec<[u32; 3]>,
    /// Unit face normals (zero for degenerate faces).
    pub face_normals: Vec<Vector3<f32>>,
    /// Per-face corner positions, denormalized for kernel buffers.
    pub triangles: Vec<[Point3<f32>; 3]>,
    radiance: Option<Vec<Vector3<f32>>>,
}

impl Mesh {
    pub fn new(positions: Vec<Point3<f32>>, faces: Vec<[u32; 3]>) -> Result<Self> {
        let vertex_count = positions.len();
        if let Some(face) = faces
            .iter()
            .find(|f| f.iter().any(|&i| i as usize >= vertex_count))
        {
            return Err(EstimateError::malformed(format!(
                "face {face:?} references a vertex outside 0..{vertex_count}"
            )));
        }

        let triangles: Vec<[Point3<f32>; 3]> = faces
            .iter()
            .map(|f| f.map(|i| positions[i as usize]))
            .collect();
        let face_normals = triangles
            .iter()
            .map(|[a, b, c]| {
                let n = (b - a).cross(&(c - a));
                n.try_normalize(1e-12).unwrap_or_else(Vector3::zeros)
            })
            .collect();

        Ok(Self {
            positions,
            faces,
            face_normals,
            triangles,
            radiance: None,
        })
    }

    /// Axis-aligned cube centered at the origin with the given edge length.
    pub fn create_test_cube(size: f32) -> Self {
        let h = size * 0.5;
        let positions = (0..8)
            .map(|i| {
                Point3::new(
                    if i & 1 != 0 { h } else { -h },
                    if i & 2 != 0 { h } else { -h },
                    if i & 4 != 0 { h } else { -h },
                )
            })
            .collect();
        let faces = vec![
            [0, 4, 6], [0, 6, 2], // -X
            [1, 3, 7], [1, 7, 5], // +X
            [0, 1, 5], [0, 5, 4], // -Y
            [2, 6, 7], [2, 7, 3], // +Y
            [0, 2, 3], [0, 3, 1], // -Z
            [4, 5, 7], [4, 7, 6], // +Z
        ];
        Self::new(positions, faces).unwrap_or_else(|_| unreachable!("cube indices are in range"))
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// Axis-aligned bounds `(min, max)`; `None` for an empty mesh.
    pub fn bounds(&self) -> Option<(Point3<f32>, Point3<f32>)> {
        let first = *self.positions.first()?;
        Some(
            self.positions
                .iter()
                .fold((first, first), |(min, max), p| (min.inf(p), max.sup(p))),
        )
    }

    /// Center of the bounding box.
    pub fn bounding_box_center(&self) -> Option<Point3<f32>> {
        self.bounds().map(|(min, max)| nalgebra::center(&min, &max))
    }

    pub fn radiance(&self) -> Option<&[Vector3<f32>]> {
        self.radiance.as_deref()
    }

    /// Attaches the per-vertex radiance. Fails if already attached or if the length is wrong.
    pub fn set_radiance(&mut self, radiance: Vec<Vector3<f32>>) -> Result<()> {
        if self.radiance.is_some() {
            return Err(EstimateError::RadianceAlreadySet);
        }
        if radiance.len() != self.positions.len() {
            return Err(EstimateError::malformed(format!(
                "radiance has {} entries for {} vertices",
                radiance.len(),
                self.positions.len()
            )));
        }
        self.radiance = Some(radiance);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_geometry() {
        let cube = Mesh::create_test_cube(1.0);
        assert_eq!(cube.vertex_count(), 8);
        assert_eq!(cube.face_count(), 12);
        let (min, max) = cube.bounds().unwrap();
        assert_eq!(min, Point3::new(-0.5, -0.5, -0.5));
        assert_eq!(max, Point3::new(0.5, 0.5, 0.5));
        assert_eq!(cube.bounding_box_center(), Some(Point3::origin()));
        for n in &cube.face_normals {
            assert!((n.norm() - 1.0).abs() < 1e-6);
            // Axis aligned.
            assert!(n.iter().filter(|c| c.abs() > 0.5).count() == 1);
        }
    }

    #[test]
    fn radiance_is_set_once() {
        let mut cube = Mesh::create_test_cube(1.0);
        assert!(cube.set_radiance(vec![Vector3::zeros(); 3]).is_err());
        cube.set_radiance(vec![Vector3::zeros(); 8]).unwrap();
        assert!(matches!(
            cube.set_radiance(vec![Vector3::zeros(); 8]),
            Err(EstimateError::RadianceAlreadySet)
        ));
    }

    #[test]
    fn out_of_range_faces_are_rejected() {
        let positions = vec![Point3::origin(); 3];
        assert!(Mesh::new(positions, vec![[0, 1, 3]]).is_err());
    }
}
