//! Vertex-to-pixel correspondences between the mesh and every frame.

use crate::compute::{Bindings, BufferKind, ComputeSession, Kernel, KernelProgram, workgroups_for};
use crate::core::color::sample_confidence;
use crate::core::imgproc::Mask;
use crate::core::math::transform::{eye_position, transform_point, transform_vector};
use crate::error::{EstimateError, Result};
use crate::io::config::CorrespondenceConfig;
use crate::raytrace::{RenderDevice, decode_hit};
use crate::scene::camera::{CameraSetup, CenteredIntrinsics, TargetTexture};
use crate::scene::frame::Frame;
use crate::scene::mesh::Mesh;
use image::RgbImage;
use log::{debug, info};
use nalgebra::{Matrix4, Point3, Vector3};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::Arc;
use std::time::Instant;

/// Relative distance under which a hit corner counts as the targeted vertex.
pub const POSITION_TOLERANCE: f32 = 1e-4;

/// Per-vertex color samples of one frame, NaN where the vertex was rejected.
pub type VertexPixels = Vec<[f32; 3]>;

/// Why a vertex has no sample in a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NoHit,
    /// The ray hit a different vertex first.
    Occluded,
    BehindCamera,
    OutsideFrame,
    OnEdge,
}

// --- Shared kernel plumbing ---

pub(crate) const HITS: u32 = 0;
pub(crate) const TARGETS: u32 = 1;
pub(crate) const TRIANGLES: u32 = 2;
pub(crate) const VIEW: u32 = 3;
pub(crate) const PIXELS: u32 = 4;

/// Per-frame constants shared by the correspondence kernels.
///
/// Packed as `world_to_camera (16, column major) | camera_to_world (16) |
/// fx fy cx cy width height | exposure`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewUniforms {
    pub world_to_camera: Matrix4<f32>,
    pub camera_to_world: Matrix4<f32>,
    pub intr: CenteredIntrinsics,
    pub exposure: f32,
}

impl ViewUniforms {
    pub const LEN: usize = 39;

    pub fn new(frame: &Frame, intr: &CenteredIntrinsics, exposure: f32) -> Self {
        Self {
            world_to_camera: frame.world_to_camera,
            camera_to_world: frame.camera_to_world,
            intr: *intr,
            exposure,
        }
    }

    pub fn pack(&self) -> Vec<f32> {
        let i = &self.intr;
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(self.world_to_camera.as_slice());
        out.extend_from_slice(self.camera_to_world.as_slice());
        out.extend_from_slice(&[i.fx, i.fy, i.cx, i.cy, i.width as f32, i.height as f32]);
        out.push(self.exposure);
        out
    }

    pub fn unpack(data: &[f32]) -> std::result::Result<Self, String> {
        if data.len() != Self::LEN {
            return Err(format!("view uniforms need {} values, got {}", Self::LEN, data.len()));
        }
        let intr = CenteredIntrinsics {
            fx: data[32],
            fy: data[33],
            cx: data[34],
            cy: data[35],
            width: data[36] as usize,
            height: data[37] as usize,
        };
        if intr.width == 0 || intr.height == 0 {
            return Err("view has an empty image".into());
        }
        Ok(Self {
            world_to_camera: Matrix4::from_column_slice(&data[0..16]),
            camera_to_world: Matrix4::from_column_slice(&data[16..32]),
            intr,
            exposure: data[38],
        })
    }

    pub fn eye(&self) -> Point3<f32> {
        eye_position(&self.camera_to_world)
    }

    /// World-space optical axis, camera `-Z`.
    pub fn optical_axis(&self) -> Vector3<f32> {
        transform_vector(&self.camera_to_world, &-Vector3::z())
    }
}

/// Target of texel `gid` if its ray hit that very vertex. Returns the target and the hit face.
pub(crate) fn visible_target(gid: usize, bindings: &Bindings) -> std::result::Result<(Point3<f32>, usize), Rejection> {
    let targets = bindings.f32(TARGETS);
    let texel = targets.get(gid * 4..gid * 4 + 4).ok_or(Rejection::NoHit)?;
    if texel[3] <= 0.0 {
        return Err(Rejection::NoHit);
    }
    let target = Point3::new(texel[0], texel[1], texel[2]);

    let id = bindings.u32(HITS).get(gid).copied().ok_or(Rejection::NoHit)?;
    let (face, corner) = decode_hit(id).ok_or(Rejection::NoHit)?;
    let (face, corner) = (face as usize, corner as usize);
    let corner_at = (face * 3 + corner) * 3;
    let hit = bindings
        .f32(TRIANGLES)
        .get(corner_at..corner_at + 3)
        .map(|p| Point3::new(p[0], p[1], p[2]))
        .ok_or(Rejection::NoHit)?;

    let tolerance = POSITION_TOLERANCE * target.coords.norm().max(1.0);
    if (hit - target).norm() > tolerance {
        return Err(Rejection::Occluded);
    }
    Ok((target, face))
}

/// Projects a world point into a frame and returns the pixel containing it.
pub fn project_vertex(
    world_to_camera: &Matrix4<f32>,
    intr: &CenteredIntrinsics,
    point: &Point3<f32>,
) -> std::result::Result<(usize, usize), Rejection> {
    let p = transform_point(world_to_camera, point);
    if p.z >= 0.0 {
        return Err(Rejection::BehindCamera);
    }
    let (w, h) = (intr.width as f32, intr.height as f32);
    let u = 0.5 - p.x * intr.fx / (p.z * w) - intr.cx;
    let v = 0.5 + p.y * intr.fy / (p.z * h) - intr.cy;
    if !(0.0..=1.0).contains(&u) || !(0.0..=1.0).contains(&v) {
        return Err(Rejection::OutsideFrame);
    }
    let x = ((u * w).floor() as usize).min(intr.width - 1);
    let y = ((v * h).floor() as usize).min(intr.height - 1);
    Ok((x, y))
}

pub(crate) fn triangle_buffer(mesh: &Mesh) -> Vec<f32> {
    mesh.triangles
        .iter()
        .flat_map(|t| t.iter().flat_map(|p| [p.x, p.y, p.z]))
        .collect()
}

pub(crate) fn pixel_buffer(image: &RgbImage) -> Vec<f32> {
    image.as_raw().iter().map(|&c| c as f32).collect()
}

/// Color at `(x, y)` of an interleaved RGB buffer.
#[inline]
pub(crate) fn fetch_rgb(pixels: &[f32], width: usize, x: usize, y: usize) -> [f32; 3] {
    let i = (y * width + x) * 3;
    [pixels[i], pixels[i + 1], pixels[i + 2]]
}

// --- Vertex hitmap kernel ---

const EDGES: u32 = 5;
const HITMAP_OUTPUT: u32 = 6;

/// Samples the gamma-corrected frame color of every visible, non-edge vertex.
pub struct VertexHitmapKernel;

impl KernelProgram for VertexHitmapKernel {
    const NAME: &'static str = "VertexHitmap";
    const INPUTS: &'static [(u32, BufferKind)] = &[
        (HITS, BufferKind::U32),
        (TARGETS, BufferKind::F32),
        (TRIANGLES, BufferKind::F32),
        (VIEW, BufferKind::F32),
        (PIXELS, BufferKind::F32),
        (EDGES, BufferKind::U32),
    ];
    type Uniforms = ViewUniforms;

    fn uniforms(&self, bindings: &Bindings) -> std::result::Result<ViewUniforms, String> {
        let view = ViewUniforms::unpack(bindings.f32(VIEW))?;
        let pixels = view.intr.width * view.intr.height;
        if bindings.f32(PIXELS).len() != pixels * 3 || bindings.u32(EDGES).len() != pixels {
            return Err("pixel or edge buffer does not match the view size".into());
        }
        Ok(view)
    }
}

impl Kernel for VertexHitmapKernel {
    const OUTPUT: u32 = HITMAP_OUTPUT;
    const STRIDE: usize = 3;

    fn invoke(&self, gid: usize, view: &ViewUniforms, bindings: &Bindings, out: &mut [f32]) {
        let sample = visible_target(gid, bindings)
            .and_then(|(target, _)| project_vertex(&view.world_to_camera, &view.intr, &target))
            .and_then(|(x, y)| {
                if bindings.u32(EDGES)[y * view.intr.width + x] != 0 {
                    Err(Rejection::OnEdge)
                } else {
                    Ok(fetch_rgb(bindings.f32(PIXELS), view.intr.width, x, y))
                }
            });
        out.copy_from_slice(&sample.unwrap_or([f32::NAN; 3]));
    }
}

fn edge_buffer(edges: &Mask) -> Vec<u32> {
    edges.data.iter().map(|&e| e as u32).collect()
}

/// Samples every vertex in every frame. Entry `[f][v]` is NaN where vertex `v` is rejected.
pub fn trace_vertex_pixels(
    device: &RenderDevice,
    mesh: &Mesh,
    frames: &[Frame],
    intr: &CenteredIntrinsics,
) -> Result<Vec<VertexPixels>> {
    let targets = Arc::new(TargetTexture::from_positions(&mesh.positions));
    let mut session = ComputeSession::load(VertexHitmapKernel);
    session.set_data(TARGETS, targets.to_buffer());
    session.set_data(TRIANGLES, triangle_buffer(mesh));

    frames
        .iter()
        .map(|frame| {
            if (frame.width(), frame.height()) != (intr.width, intr.height) {
                return Err(EstimateError::malformed(format!(
                    "{} is {}x{}, intrinsics expect {}x{}",
                    frame.name,
                    frame.width(),
                    frame.height(),
                    intr.width,
                    intr.height
                )));
            }
            let hits = device.render_hits(CameraSetup::RayTargets {
                eye: frame.eye,
                targets: targets.clone(),
            })?;
            session.set_data(HITS, hits.ids);
            session.set_data(VIEW, ViewUniforms::new(frame, intr, 1.0).pack());
            session.set_data(PIXELS, pixel_buffer(&frame.rgb));
            session.set_data(EDGES, edge_buffer(&frame.edges));
            session.set_data(HITMAP_OUTPUT, vec![f32::NAN; targets.len() * 3]);
            session.start_compute(workgroups_for(targets.len()))?;

            let samples: VertexPixels = session
                .get_data_f32(HITMAP_OUTPUT)?
                .chunks_exact(3)
                .take(mesh.vertex_count())
                .map(|c| [c[0], c[1], c[2]])
                .collect();
            debug!(
                "{}: {} of {} vertices sampled",
                frame.name,
                samples.iter().filter(|s| !s[0].is_nan()).count(),
                samples.len()
            );
            Ok(samples)
        })
        .collect()
}

/// Observations of the subsampled vertices, vertex major: `observations[v * frames + f]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub vertices: Vec<usize>,
    pub frame_count: usize,
    pub observations: Vec<[f32; 3]>,
}

impl Selection {
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Sample of selected vertex `v` in frame `f`, `None` if rejected.
    pub fn observation(&self, v: usize, f: usize) -> Option<[f32; 3]> {
        let sample = *self.observations.get(v * self.frame_count + f)?;
        sample.iter().all(|c| c.is_finite()).then_some(sample)
    }

    pub fn observation_count(&self) -> usize {
        self.observations
            .iter()
            .filter(|s| s.iter().all(|c| c.is_finite()))
            .count()
    }

    /// Flat `[V, F, 3]` view for caching.
    pub fn to_flat(&self) -> Vec<f32> {
        self.observations.iter().flatten().copied().collect()
    }

    pub fn from_flat(vertices: Vec<usize>, frame_count: usize, flat: &[f32]) -> Result<Self> {
        if flat.len() != vertices.len() * frame_count * 3 {
            return Err(EstimateError::Cache(format!(
                "{} values cannot hold {} vertices in {} frames",
                flat.len(),
                vertices.len(),
                frame_count
            )));
        }
        Ok(Self {
            vertices,
            frame_count,
            observations: flat.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect(),
        })
    }
}

/// Sorted indices of the `min(n, max_verts)` vertices handed to the exposure solver.
///
/// Without randomization these are the first vertices; with it, distinct vertices drawn
/// uniformly from a generator seeded with `seed`.
pub fn select_indices(n: usize, config: &CorrespondenceConfig) -> Vec<usize> {
    let k = n.min(config.max_verts);
    if !config.randomize || k == n {
        return (0..k).collect();
    }
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut picked = rand::seq::index::sample(&mut rng, n, k).into_vec();
    picked.sort_unstable();
    picked
}

/// Gathers the selected vertices out of the per-frame samples.
pub fn select_vertices(pixels: &[VertexPixels], vertices: Vec<usize>) -> Result<Selection> {
    let frame_count = pixels.len();
    let mut observations = Vec::with_capacity(vertices.len() * frame_count);
    for &v in &vertices {
        for frame in pixels {
            let sample = frame.get(v).ok_or_else(|| {
                EstimateError::malformed(format!("vertex {v} outside the sampled range"))
            })?;
            observations.push(*sample);
        }
    }
    Ok(Selection {
        vertices,
        frame_count,
        observations,
    })
}

/// Traces every frame and returns the observations of the subsampled vertices.
pub fn vertex_hitmap(
    device: &RenderDevice,
    mesh: &Mesh,
    frames: &[Frame],
    intr: &CenteredIntrinsics,
    config: &CorrespondenceConfig,
) -> Result<Selection> {
    let started = Instant::now();
    let pixels = trace_vertex_pixels(device, mesh, frames, intr)?;
    let selection = select_vertices(&pixels, select_indices(mesh.vertex_count(), config))?;
    info!(
        "Correspondences for {} vertices over {} frames ({} observations) in {:.2?}",
        selection.vertex_count(),
        selection.frame_count,
        selection.observation_count(),
        started.elapsed()
    );
    Ok(selection)
}

/// Confidence-weighted sample weight used by the exposure solver.
#[inline]
pub fn observation_confidence(sample: &[f32; 3]) -> f32 {
    sample_confidence((sample[0] + sample[1] + sample[2]) / 3.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::Buffer;
    use crate::core::math::transform::TransformFactory;
    use crate::raytrace::encode_hit;

    fn intrinsics() -> CenteredIntrinsics {
        CenteredIntrinsics {
            fx: 500.0,
            fy: 500.0,
            cx: 0.0,
            cy: 0.0,
            width: 640,
            height: 480,
        }
    }

    #[test]
    fn projection_rejections() {
        let intr = intrinsics();
        let identity = Matrix4::identity();
        assert_eq!(
            project_vertex(&identity, &intr, &Point3::new(0.0, 0.0, 1.0)),
            Err(Rejection::BehindCamera)
        );
        assert_eq!(
            project_vertex(&identity, &intr, &Point3::new(0.0, 0.0, 0.0)),
            Err(Rejection::BehindCamera)
        );
        assert_eq!(
            project_vertex(&identity, &intr, &Point3::new(10.0, 0.0, -1.0)),
            Err(Rejection::OutsideFrame)
        );
        // On the axis: image center.
        assert_eq!(
            project_vertex(&identity, &intr, &Point3::new(0.0, 0.0, -2.0)),
            Ok((320, 240))
        );
        // +X appears on the right, +Y toward the top.
        let (x, y) = project_vertex(&identity, &intr, &Point3::new(0.64, 0.48, -2.0)).unwrap();
        assert_eq!((x, y), (480, 120));
    }

    #[test]
    fn principal_point_offset_shifts_projection() {
        let mut intr = intrinsics();
        intr.cx = 0.25;
        let (x, _) = project_vertex(&Matrix4::identity(), &intr, &Point3::new(0.0, 0.0, -1.0)).unwrap();
        assert_eq!(x, 160);
    }

    fn hitmap_session(hit: u32, target: [f32; 4], edge: bool) -> Vec<f32> {
        // One triangle whose first corner sits 2 units in front of an identity camera.
        let triangle = vec![0.0, 0.0, -2.0, 1.0, 0.0, -2.0, 0.0, 1.0, -2.0];
        let frame = Frame::from_view(0, RgbImage::from_pixel(640, 480, image::Rgb([10, 20, 30])), Matrix4::identity()).unwrap();
        let mut edges = vec![0u32; 640 * 480];
        if edge {
            edges[240 * 640 + 320] = 1;
        }
        let mut session = ComputeSession::load(VertexHitmapKernel);
        session.set_data(HITS, vec![hit]);
        session.set_data(TARGETS, target.to_vec());
        session.set_data(TRIANGLES, triangle);
        session.set_data(VIEW, ViewUniforms::new(&frame, &intrinsics(), 1.0).pack());
        session.set_data(PIXELS, pixel_buffer(&frame.rgb));
        session.set_data(EDGES, Buffer::U32(edges));
        session.set_data(HITMAP_OUTPUT, vec![0.0f32; 3]);
        session.start_compute(1).unwrap();
        session.get_data_f32(HITMAP_OUTPUT).unwrap()
    }

    #[test]
    fn hitmap_kernel_samples_and_rejects() {
        let visible = [0.0, 0.0, -2.0, 1.0];
        assert_eq!(hitmap_session(encode_hit(0, 0), visible, false), vec![10.0, 20.0, 30.0]);
        // Edge pixel.
        assert!(hitmap_session(encode_hit(0, 0), visible, true)[0].is_nan());
        // Ray stopped at another corner.
        assert!(hitmap_session(encode_hit(0, 1), visible, false)[0].is_nan());
        // Nothing hit, padding texel.
        assert!(hitmap_session(u32::MAX, visible, false)[0].is_nan());
        assert!(hitmap_session(encode_hit(0, 0), [-1.0; 4], false)[0].is_nan());
    }

    #[test]
    fn view_uniforms_round_trip_eye_and_axis() {
        let eye = Point3::new(2.0, 1.5, 3.0);
        let view = TransformFactory::view(&eye, &Point3::origin(), &Vector3::y());
        let frame = Frame::from_view(0, RgbImage::new(640, 480), view).unwrap();
        let uniforms = ViewUniforms::unpack(&ViewUniforms::new(&frame, &intrinsics(), 2.0).pack()).unwrap();
        assert!((uniforms.eye() - eye).norm() < 1e-5);
        assert!((uniforms.optical_axis() - (-eye.coords.normalize())).norm() < 1e-5);
        assert_eq!(uniforms.exposure, 2.0);
        assert!(ViewUniforms::unpack(&[0.0; 3]).is_err());
    }

    #[test]
    fn subsampling_is_deterministic() {
        let mut config = CorrespondenceConfig {
            max_verts: 4,
            ..CorrespondenceConfig::default()
        };
        assert_eq!(select_indices(10, &config), vec![0, 1, 2, 3]);
        assert_eq!(select_indices(3, &config), vec![0, 1, 2]);

        config.randomize = true;
        config.seed = 7;
        let picked = select_indices(1000, &config);
        assert_eq!(picked.len(), 4);
        assert!(picked.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(picked, select_indices(1000, &config));
    }

    #[test]
    fn selection_layout_is_vertex_major() {
        let nan = [f32::NAN; 3];
        let pixels = vec![
            vec![[1.0, 1.0, 1.0], nan, [3.0, 3.0, 3.0]],
            vec![[2.0, 2.0, 2.0], [5.0, 5.0, 5.0], nan],
        ];
        let selection = select_vertices(&pixels, vec![0, 2]).unwrap();
        assert_eq!(selection.observation(0, 1), Some([2.0; 3]));
        assert_eq!(selection.observation(1, 0), Some([3.0; 3]));
        assert_eq!(selection.observation(1, 1), None);
        assert_eq!(selection.observation_count(), 3);

        let restored = Selection::from_flat(vec![0, 2], 2, &selection.to_flat()).unwrap();
        assert_eq!(restored.observation(1, 0), Some([3.0; 3]));
        assert!(select_vertices(&pixels, vec![5]).is_err());
    }
}
