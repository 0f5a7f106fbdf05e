use crate::core::framebuffer::{FrameBuffer, Sample};
use crate::core::math::equirect::uv_to_dir;
use crate::core::math::interpolation::{dominant_corner, interpolate};
use crate::error::{EstimateError, Result};
use crate::raytrace::bvh::Bvh;
use crate::raytrace::ray::Ray;
use crate::scene::camera::{PanoramicCamera, TargetTexture};
use crate::scene::mesh::Mesh;
use log::debug;
use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Instant;

/// Hit id of a texel whose ray hit nothing.
pub const NO_HIT: u32 = u32::MAX;

const FACE_MASK: u32 = 0x3FFF_FFFF;
const CORNER_MASK: u32 = 0xC000_0000;

/// Packs a face index and the hit corner (0..3) into one id.
#[inline]
pub fn encode_hit(face: u32, corner: u32) -> u32 {
    (corner << 30) | (face & FACE_MASK)
}

/// Unpacks `(face, corner)`; `None` for [`NO_HIT`].
#[inline]
pub fn decode_hit(id: u32) -> Option<(u32, u32)> {
    if id == NO_HIT {
        return None;
    }
    Some((id & FACE_MASK, (id & CORNER_MASK) >> 30))
}

/// Packed hit ids, one per target texel.
#[derive(Debug, Clone)]
pub struct HitBuffer {
    pub size: usize,
    pub ids: Vec<u32>,
}

impl HitBuffer {
    pub fn hit_count(&self) -> usize {
        self.ids.iter().filter(|&&id| id != NO_HIT).count()
    }
}

/// Mesh plus its acceleration structure.
pub struct Raycaster {
    mesh: Arc<Mesh>,
    bvh: Bvh,
}

impl Raycaster {
    pub fn new(mesh: Arc<Mesh>) -> Self {
        let started = Instant::now();
        let bvh = Bvh::build(&mesh.triangles);
        debug!(
            "BVH over {} faces built ({} nodes) in {:.2?}",
            mesh.face_count(),
            bvh.nodes.len(),
            started.elapsed()
        );
        Self { mesh, bvh }
    }

    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }

    /// Casts one ray from `eye` toward every valid texel of `targets`.
    pub fn trace_targets(&self, eye: &Point3<f32>, targets: &TargetTexture) -> HitBuffer {
        let ids = (0..targets.len())
            .into_par_iter()
            .map(|i| {
                let Some(target) = targets.target(i) else {
                    return NO_HIT;
                };
                let offset = target - eye;
                let distance = offset.norm();
                if distance <= f32::EPSILON {
                    return NO_HIT;
                }
                let ray = Ray::new(*eye, offset / distance);
                match self.bvh.intersect(&ray, f32::MAX) {
                    Some(hit) => encode_hit(hit.face, dominant_corner(&hit.bary)),
                    None => NO_HIT,
                }
            })
            .collect();
        HitBuffer {
            size: targets.size,
            ids,
        }
    }

    /// Renders the radiance-textured mesh into an equirectangular color + depth buffer.
    pub fn render_panorama(&self, camera: &PanoramicCamera) -> Result<FrameBuffer> {
        let radiance = self.mesh.radiance().ok_or_else(|| {
            EstimateError::Render("panorama requested before the mesh carries radiance".into())
        })?;

        let mut framebuffer = FrameBuffer::new(camera.width, camera.height, camera.samples);
        let (width, height) = (camera.width as f32, camera.height as f32);
        framebuffer.shade(|x, y, (ox, oy)| {
            let dir = uv_to_dir((x as f32 + ox) / width, (y as f32 + oy) / height);
            let ray = Ray::new(camera.eye, dir);
            match self.bvh.intersect(&ray, f32::MAX) {
                Some(hit) => {
                    let [a, b, c] = self.mesh.faces[hit.face as usize];
                    Sample {
                        color: interpolate(
                            &hit.bary,
                            &radiance[a as usize],
                            &radiance[b as usize],
                            &radiance[c as usize],
                        ),
                        depth: Some(hit.t),
                    }
                }
                None => Sample {
                    color: Vector3::zeros(),
                    depth: None,
                },
            }
        });
        Ok(framebuffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_ids_round_trip_through_mask() {
        let id = encode_hit(123_456, 2);
        assert_eq!((id & 0xC000_0000) >> 30, 2);
        assert_eq!(decode_hit(id), Some((123_456, 2)));
        assert_eq!(decode_hit(NO_HIT), None);
    }

    #[test]
    fn unoccluded_vertices_hit_their_own_corner() {
        let cube = Arc::new(Mesh::create_test_cube(1.0));
        let raycaster = Raycaster::new(cube.clone());
        let targets = TargetTexture::from_positions(&cube.positions);
        let eye = Point3::new(2.0, 1.5, 3.0);
        let hits = raycaster.trace_targets(&eye, &targets);
        assert_eq!(hits.ids.len(), 9);
        assert_eq!(hits.ids[8], NO_HIT);

        for (v, &id) in hits.ids.iter().take(8).enumerate() {
            let (face, corner) = decode_hit(id).unwrap();
            let hit_vertex = cube.faces[face as usize][corner as usize] as usize;
            let hit_position = cube.positions[hit_vertex];
            let visible = (cube.positions[v] - hit_position).norm() < 1e-4;
            // Only the corner facing away from the eye is hidden.
            assert_eq!(visible, v != 0, "vertex {v}");
        }
    }

    #[test]
    fn panorama_needs_radiance() {
        let raycaster = Raycaster::new(Arc::new(Mesh::create_test_cube(2.0)));
        let camera = PanoramicCamera {
            eye: Point3::origin(),
            width: 16,
            height: 8,
            samples: 1,
        };
        assert!(raycaster.render_panorama(&camera).is_err());

        let mut cube = Mesh::create_test_cube(2.0);
        cube.set_radiance(vec![Vector3::new(0.5, 0.25, 1.0); 8]).unwrap();
        let raycaster = Raycaster::new(Arc::new(cube));
        let fb = raycaster.render_panorama(&camera).unwrap();
        for y in 0..8 {
            for x in 0..16 {
                let color = fb.get_pixel(x, y).unwrap();
                assert!((color - Vector3::new(0.5, 0.25, 1.0)).norm() < 1e-4);
                let depth = fb.get_depth(x, y).unwrap();
                assert!((1.0..=3f32.sqrt() + 1e-4).contains(&depth));
            }
        }
    }
}
