//! Calibrated per-vertex radiance from all frames.

use crate::compute::{Bindings, BufferKind, ComputeSession, Kernel, KernelProgram, workgroups_for};
use crate::core::color::sample_confidence;
use crate::error::{EstimateError, Result};
use crate::pipeline::correspondence::{
    HITS, PIXELS, TARGETS, TRIANGLES, VIEW, ViewUniforms, fetch_rgb, pixel_buffer, project_vertex,
    triangle_buffer, visible_target,
};
use crate::raytrace::RenderDevice;
use crate::scene::camera::{CameraSetup, CenteredIntrinsics, TargetTexture};
use crate::scene::frame::Frame;
use crate::scene::mesh::Mesh;
use log::{debug, info, warn};
use nalgebra::Vector3;
use std::sync::Arc;
use std::time::Instant;

const NORMALS: u32 = 5;
const RADIANCE_OUTPUT: u32 = 6;

/// Emits `(color / exposure, weight)` per visible vertex, NaN otherwise.
///
/// `weight = confidence(color) · |g|` with `g = (−v̂·n)(v̂·axis) / |v|²`, where `v` runs from the
/// eye to the vertex, `n` is the hit face normal and `axis` the optical axis. Samples the
/// original image and ignores edges.
pub struct RadianceKernel;

impl KernelProgram for RadianceKernel {
    const NAME: &'static str = "RadianceReproject";
    const INPUTS: &'static [(u32, BufferKind)] = &[
        (HITS, BufferKind::U32),
        (TARGETS, BufferKind::F32),
        (TRIANGLES, BufferKind::F32),
        (VIEW, BufferKind::F32),
        (PIXELS, BufferKind::F32),
        (NORMALS, BufferKind::F32),
    ];
    type Uniforms = (ViewUniforms, Vector3<f32>);

    fn uniforms(&self, bindings: &Bindings) -> std::result::Result<Self::Uniforms, String> {
        let view = ViewUniforms::unpack(bindings.f32(VIEW))?;
        if bindings.f32(PIXELS).len() != view.intr.width * view.intr.height * 3 {
            return Err("pixel buffer does not match the view size".into());
        }
        if !(view.exposure > 0.0) {
            return Err(format!("exposure must be positive, got {}", view.exposure));
        }
        if bindings.f32(NORMALS).len() * 3 != bindings.f32(TRIANGLES).len() {
            return Err("one normal per triangle expected".into());
        }
        let axis = view.optical_axis().normalize();
        Ok((view, axis))
    }
}

impl Kernel for RadianceKernel {
    const OUTPUT: u32 = RADIANCE_OUTPUT;
    const STRIDE: usize = 4;

    fn invoke(&self, gid: usize, (view, axis): &Self::Uniforms, bindings: &Bindings, out: &mut [f32]) {
        let Ok((target, face)) = visible_target(gid, bindings) else {
            out.fill(f32::NAN);
            return;
        };
        let Ok((x, y)) = project_vertex(&view.world_to_camera, &view.intr, &target) else {
            out.fill(f32::NAN);
            return;
        };
        let px = fetch_rgb(bindings.f32(PIXELS), view.intr.width, x, y);

        let v = target - view.eye();
        let distance_sq = v.norm_squared();
        let n = &bindings.f32(NORMALS)[face * 3..face * 3 + 3];
        let normal = Vector3::new(n[0], n[1], n[2]);
        let v_hat = v / distance_sq.sqrt();
        let g = (-v_hat.dot(&normal)) * v_hat.dot(axis) / distance_sq;
        let weight = sample_confidence((px[0] + px[1] + px[2]) / 3.0) * g.abs();

        out[0] = px[0] / view.exposure;
        out[1] = px[1] / view.exposure;
        out[2] = px[2] / view.exposure;
        out[3] = weight;
    }
}

/// Running weighted mean of radiance samples over frames.
#[derive(Debug, Clone)]
pub struct RadianceAccumulator {
    sum: Vec<Vector3<f64>>,
    weight: Vec<f64>,
}

impl RadianceAccumulator {
    pub fn new(vertices: usize) -> Self {
        Self {
            sum: vec![Vector3::zeros(); vertices],
            weight: vec![0.0; vertices],
        }
    }

    /// Adds one frame of `[r, g, b, weight]` samples. Samples with any NaN are skipped.
    pub fn add_frame(&mut self, samples: &[f32]) {
        for ((s, sum), weight) in samples.chunks_exact(4).zip(&mut self.sum).zip(&mut self.weight) {
            if s.iter().any(|c| c.is_nan()) {
                continue;
            }
            let w = s[3] as f64;
            *sum += Vector3::new(s[0] as f64, s[1] as f64, s[2] as f64) * w;
            *weight += w;
        }
    }

    /// `Σ w·c / Σ w / 255` per vertex; vertices without weight get 0.
    pub fn finish(self) -> Vec<[f32; 3]> {
        self.sum
            .iter()
            .zip(&self.weight)
            .map(|(sum, &w)| {
                let mean = sum / w;
                mean.map(|c| if c.is_nan() { 0.0 } else { (c / 255.0) as f32 }).into()
            })
            .collect()
    }
}

/// Merges per-frame `[r, g, b, weight]` sample buffers of `vertices` vertices.
pub fn merge_samples(frames: &[Vec<f32>], vertices: usize) -> Vec<[f32; 3]> {
    let mut accumulator = RadianceAccumulator::new(vertices);
    for samples in frames {
        accumulator.add_frame(samples);
    }
    accumulator.finish()
}

/// Reprojects every frame onto the mesh and merges the calibrated colors per vertex.
pub fn radiance_reproject(
    device: &RenderDevice,
    mesh: &Mesh,
    frames: &[Frame],
    intr: &CenteredIntrinsics,
    exposures: &[f64],
) -> Result<Vec<[f32; 3]>> {
    if exposures.len() != frames.len() {
        return Err(EstimateError::malformed(format!(
            "{} exposures for {} frames",
            exposures.len(),
            frames.len()
        )));
    }
    let started = Instant::now();
    let targets = Arc::new(TargetTexture::from_positions(&mesh.positions));
    let normals: Vec<f32> = mesh.face_normals.iter().flat_map(|n| [n.x, n.y, n.z]).collect();

    let mut session = ComputeSession::load(RadianceKernel);
    session.set_data(TARGETS, targets.to_buffer());
    session.set_data(TRIANGLES, triangle_buffer(mesh));
    session.set_data(NORMALS, normals);

    let mut accumulator = RadianceAccumulator::new(mesh.vertex_count());
    for (frame, &exposure) in frames.iter().zip(exposures) {
        if !(exposure > 0.0 && exposure.is_finite()) {
            warn!("{}: skipped, exposure {exposure} is not positive", frame.name);
            continue;
        }
        let hits = device.render_hits(CameraSetup::RayTargets {
            eye: frame.eye,
            targets: targets.clone(),
        })?;
        session.set_data(HITS, hits.ids);
        session.set_data(VIEW, ViewUniforms::new(frame, intr, exposure as f32).pack());
        session.set_data(PIXELS, pixel_buffer(&frame.original));
        session.set_data(RADIANCE_OUTPUT, vec![f32::NAN; targets.len() * 4]);
        session.start_compute(workgroups_for(targets.len()))?;

        let samples = session.get_data_f32(RADIANCE_OUTPUT)?;
        accumulator.add_frame(&samples[..mesh.vertex_count() * 4]);
        debug!("{}: reprojected with exposure {exposure:.4}", frame.name);
    }

    let radiance = accumulator.finish();
    info!(
        "Radiance reprojected onto {} vertices in {:.2?}",
        radiance.len(),
        started.elapsed()
    );
    Ok(radiance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raytrace::encode_hit;
    use image::RgbImage;
    use nalgebra::Matrix4;

    #[test]
    fn merge_weights_and_skips_nan() {
        let nan = f32::NAN;
        let frames = vec![
            vec![255.0, 0.0, 0.0, 1.0, nan, nan, nan, nan],
            vec![0.0, 255.0, 0.0, 3.0, 51.0, 51.0, 51.0, 0.5],
        ];
        let merged = merge_samples(&frames, 2);
        assert!((merged[0][0] - 0.25).abs() < 1e-6);
        assert!((merged[0][1] - 0.75).abs() < 1e-6);
        assert!((merged[1][2] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn all_nan_or_zero_weight_merges_to_zero() {
        let nan = f32::NAN;
        let frames = vec![vec![nan; 8], vec![nan, nan, nan, nan, 10.0, 10.0, 10.0, 0.0]];
        assert_eq!(merge_samples(&frames, 2), vec![[0.0; 3], [0.0; 3]]);
    }

    fn radiance_of(target: [f32; 4], hit: u32, exposure: f32) -> Vec<f32> {
        // Triangle facing the camera, first corner straight ahead.
        let triangle = vec![0.0, 0.0, -2.0, 1.0, 0.0, -2.0, 0.0, 1.0, -2.0];
        let intr = CenteredIntrinsics {
            fx: 500.0,
            fy: 500.0,
            cx: 0.0,
            cy: 0.0,
            width: 64,
            height: 48,
        };
        let frame =
            Frame::from_view(0, RgbImage::from_pixel(64, 48, image::Rgb([127, 127, 127])), Matrix4::identity())
                .unwrap();
        let mut session = ComputeSession::load(RadianceKernel);
        session.set_data(HITS, vec![hit]);
        session.set_data(TARGETS, target.to_vec());
        session.set_data(TRIANGLES, triangle);
        session.set_data(NORMALS, vec![0.0f32, 0.0, 1.0]);
        session.set_data(VIEW, ViewUniforms::new(&frame, &intr, exposure).pack());
        session.set_data(PIXELS, pixel_buffer(&frame.original));
        session.set_data(RADIANCE_OUTPUT, vec![0.0f32; 4]);
        session.start_compute(1).unwrap();
        session.get_data_f32(RADIANCE_OUTPUT).unwrap()
    }

    #[test]
    fn kernel_weights_by_geometry() {
        let out = radiance_of([0.0, 0.0, -2.0, 1.0], encode_hit(0, 0), 2.0);
        assert_eq!(&out[..3], &[63.5, 63.5, 63.5]);
        // Head-on at distance 2: g = 1 · 1 / 4, full confidence.
        assert!((out[3] - 0.25).abs() < 1e-6);

        assert!(radiance_of([0.0, 0.0, -2.0, 1.0], encode_hit(0, 2), 2.0)[3].is_nan());
        assert!(radiance_of([0.0, 0.0, 2.0, 1.0], encode_hit(0, 0), 2.0)[0].is_nan());
    }

    #[test]
    fn kernel_rejects_non_positive_exposure() {
        let mut session = ComputeSession::load(RadianceKernel);
        session.set_data(HITS, vec![0u32]);
        session.set_data(TARGETS, vec![0.0f32; 4]);
        session.set_data(TRIANGLES, vec![0.0f32; 9]);
        session.set_data(NORMALS, vec![0.0f32; 3]);
        let frame = Frame::from_view(0, RgbImage::new(4, 4), Matrix4::identity()).unwrap();
        let intr = CenteredIntrinsics {
            fx: 1.0,
            fy: 1.0,
            cx: 0.0,
            cy: 0.0,
            width: 4,
            height: 4,
        };
        session.set_data(VIEW, ViewUniforms::new(&frame, &intr, 0.0).pack());
        session.set_data(PIXELS, vec![0.0f32; 48]);
        session.set_data(RADIANCE_OUTPUT, vec![0.0f32; 4]);
        assert!(session.start_compute(1).is_err());
    }
}
