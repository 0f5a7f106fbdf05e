//! Directional light from the sky pixels of all frames.
//!
//! Frame pixels without depth are treated as looking at infinity. Their calibrated color is
//! scattered onto a coarse equirectangular grid and the brightest region becomes the sun.

use crate::compute::{Bindings, Buffer, BufferKind, ComputeSession, KernelProgram, ScatterKernel, workgroups_for};
use crate::core::color::{illuminance_to_ev, photometric_luminance};
use crate::core::imgproc::{Mask, flood_fill, gaussian_blur, masked_max};
use crate::core::math::equirect::{dir_to_pixel, pixel_to_dir};
use crate::core::math::transform::transform_vector;
use crate::error::{EstimateError, Result};
use crate::io::config::{DetectionConfig, SolverConfig};
use crate::pipeline::detector::refine_intensity;
use crate::pipeline::footprint::Ellipse;
use crate::scene::camera::RawIntrinsics;
use crate::scene::frame::Frame;
use crate::scene::light::DetectedLight;
use log::{debug, info, warn};
use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3};
use std::f32::consts::PI;
use std::sync::atomic::Ordering;
use std::time::Instant;

const SKY: u32 = 0;
const VIEW: u32 = 1;
const COLOR_SUM: u32 = 2;
const ILLUMINANCE_SUM: u32 = 3;

/// Frame constants: `camera_to_world (16) | fx fy ox oy width height | grid w h | exposure`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SunView {
    pub camera_to_world: Matrix4<f32>,
    pub intr: RawIntrinsics,
    pub grid: (usize, usize),
    pub exposure: f32,
}

impl SunView {
    pub const LEN: usize = 25;

    pub fn pack(&self) -> Vec<f32> {
        let i = &self.intr;
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(self.camera_to_world.as_slice());
        out.extend_from_slice(&[i.fx, i.fy, i.ox, i.oy, i.width as f32, i.height as f32]);
        out.extend_from_slice(&[self.grid.0 as f32, self.grid.1 as f32, self.exposure]);
        out
    }

    pub fn unpack(data: &[f32]) -> std::result::Result<Self, String> {
        if data.len() != Self::LEN {
            return Err(format!("sun view needs {} values, got {}", Self::LEN, data.len()));
        }
        Ok(Self {
            camera_to_world: Matrix4::from_column_slice(&data[..16]),
            intr: RawIntrinsics {
                fx: data[16],
                fy: data[17],
                ox: data[18],
                oy: data[19],
                width: data[20] as usize,
                height: data[21] as usize,
            },
            grid: (data[22] as usize, data[23] as usize),
            exposure: data[24],
        })
    }
}

/// Accumulates `rgb/255/exposure` and photometric luminance of sky pixels per grid cell.
///
/// Color cells hold `r g b count`, illuminance cells `sum count`.
pub struct SunKernel;

impl KernelProgram for SunKernel {
    const NAME: &'static str = "SunReproject";
    const INPUTS: &'static [(u32, BufferKind)] = &[
        (SKY, BufferKind::F32),
        (VIEW, BufferKind::F32),
        (COLOR_SUM, BufferKind::Accum),
        (ILLUMINANCE_SUM, BufferKind::Accum),
    ];
    type Uniforms = SunView;

    fn uniforms(&self, bindings: &Bindings) -> std::result::Result<SunView, String> {
        let view = SunView::unpack(bindings.f32(VIEW))?;
        let cells = view.grid.0 * view.grid.1;
        if cells == 0 || bindings.accum(COLOR_SUM).len() != cells * 4 || bindings.accum(ILLUMINANCE_SUM).len() != cells * 2 {
            return Err("accumulators do not match the grid".into());
        }
        if bindings.f32(SKY).len() != view.intr.width * view.intr.height * 4 {
            return Err("sky buffer does not match the intrinsics".into());
        }
        if !(view.exposure > 0.0) {
            return Err(format!("exposure must be positive, got {}", view.exposure));
        }
        Ok(view)
    }
}

impl ScatterKernel for SunKernel {
    fn invocations(&self, view: &SunView, _: &Bindings) -> usize {
        view.intr.width * view.intr.height
    }

    fn invoke(&self, gid: usize, view: &SunView, bindings: &Bindings) {
        let px = &bindings.f32(SKY)[gid * 4..gid * 4 + 4];
        if px[3] == 0.0 {
            return;
        }
        let intr = &view.intr;
        let (x, y) = ((gid % intr.width) as f32, (gid / intr.width) as f32);
        let ray = Vector3::new(
            (x + 0.5 - intr.ox) / intr.fx,
            -((y + 0.5) - intr.oy) / intr.fy,
            -1.0,
        );
        let world = transform_vector(&view.camera_to_world, &ray);
        let (cx, cy) = dir_to_pixel(&world, view.grid.0, view.grid.1);
        let cell = cy * view.grid.0 + cx;

        let rgb = Vector3::new(px[0], px[1], px[2]) / (255.0 * view.exposure);
        let colors = bindings.accum(COLOR_SUM);
        for c in 0..3 {
            colors[cell * 4 + c].fetch_add(rgb[c], Ordering::Relaxed);
        }
        colors[cell * 4 + 3].fetch_add(1.0, Ordering::Relaxed);
        let illuminance = bindings.accum(ILLUMINANCE_SUM);
        illuminance[cell * 2].fetch_add(photometric_luminance(&rgb), Ordering::Relaxed);
        illuminance[cell * 2 + 1].fetch_add(1.0, Ordering::Relaxed);
    }
}

fn sky_buffer(frame: &Frame) -> Vec<f32> {
    frame.sky.as_raw().iter().map(|&c| c as f32).collect()
}

/// Averaged sky grid: color and illuminance per cell, zero where nothing landed.
#[derive(Debug, Clone)]
pub struct SkyGrid {
    pub width: usize,
    pub height: usize,
    pub color: Vec<Vector3<f32>>,
    pub illuminance: Vec<f32>,
}

/// Scatters every frame's sky pixels onto a `width × height` grid.
pub fn accumulate_sky(
    frames: &[Frame],
    intr: &RawIntrinsics,
    exposures: &[f64],
    width: usize,
    height: usize,
) -> Result<SkyGrid> {
    let cells = width * height;
    let mut session = ComputeSession::load(SunKernel);
    session.set_data(COLOR_SUM, Buffer::accumulator(cells * 4));
    session.set_data(ILLUMINANCE_SUM, Buffer::accumulator(cells * 2));

    for (frame, &exposure) in frames.iter().zip(exposures) {
        if !(exposure > 0.0 && exposure.is_finite()) {
            warn!("{}: sky skipped, exposure {exposure} is not positive", frame.name);
            continue;
        }
        if (frame.width(), frame.height()) != (intr.width, intr.height) {
            return Err(EstimateError::malformed(format!(
                "{} does not match the calibration size",
                frame.name
            )));
        }
        session.set_data(SKY, sky_buffer(frame));
        let view = SunView {
            camera_to_world: frame.camera_to_world,
            intr: *intr,
            grid: (width, height),
            exposure: exposure as f32,
        };
        session.set_data(VIEW, view.pack());
        session.start_scatter(workgroups_for(intr.width * intr.height))?;
    }

    let colors = session.get_data_f32(COLOR_SUM)?;
    let illuminance = session.get_data_f32(ILLUMINANCE_SUM)?;
    let average = |sum: f32, count: f32| if count > 0.0 { sum / count } else { 0.0 };
    Ok(SkyGrid {
        width,
        height,
        color: colors
            .chunks_exact(4)
            .map(|c| Vector3::new(average(c[0], c[3]), average(c[1], c[3]), average(c[2], c[3])))
            .collect(),
        illuminance: illuminance.chunks_exact(2).map(|c| average(c[0], c[1])).collect(),
    })
}

/// Orientation whose local `-Z` points along `forward` (Z-up world).
///
/// `r = f × ẑ` (`f × ŷ` when `f` is vertical), `u = r × f`, rotation columns `(r, u, −f)`.
pub fn sun_rotation(forward: &Vector3<f32>) -> UnitQuaternion<f32> {
    let f = forward.normalize();
    let r = f
        .cross(&Vector3::z())
        .try_normalize(1e-6)
        .unwrap_or_else(|| f.cross(&Vector3::y()).normalize());
    let u = r.cross(&f);
    let basis = Matrix3::from_columns(&[r, u, -f]);
    UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(basis))
}

/// Finds the sun in the sky pixels. `None` when the sky holds no usable bright region.
pub fn detect_sun(
    frames: &[Frame],
    intr: &RawIntrinsics,
    exposures: &[f64],
    config: &DetectionConfig,
    solver: &SolverConfig,
) -> Result<Option<DetectedLight>> {
    let started = Instant::now();
    let (width, height) = (config.sun_width, config.sun_height);
    let grid = accumulate_sky(frames, intr, exposures, width, height)?;

    // 1. Brightest region
    let blurred = gaussian_blur(&grid.illuminance, width, height, config.sun_blur);
    let mut claimed = Mask::new(width, height);
    let Some((peak_index, peak)) = masked_max(&blurred, &claimed) else {
        return Ok(None);
    };
    if peak <= 0.0 {
        debug!("No sky pixels with light; no sun");
        return Ok(None);
    }
    let seed = (peak_index % width, peak_index / width);
    let cells = flood_fill(&blurred, &mut claimed, seed, config.sun_tolerance);
    let Some(ellipse) = Ellipse::fit(&cells) else {
        debug!("Sun footprint of {} cells is too small", cells.len());
        return Ok(None);
    };

    // 2. Intensity
    let illuminance: f32 = cells.iter().map(|&(x, y)| blurred[y * width + x]).sum();
    let ev = illuminance_to_ev(illuminance);
    if !ev.is_finite() || ev == 0.0 {
        return Ok(None);
    }
    let mean_rgb = cells
        .iter()
        .map(|&(x, y)| grid.color[y * width + x])
        .sum::<Vector3<f32>>()
        / cells.len() as f32;
    let color = mean_rgb / ev;

    // 3. Direction & refinement
    let forward = pixel_to_dir(seed.0 as f32, seed.1 as f32, width, height);
    let sharpness = 4.0 * PI / ellipse.solid_angle(width, height);
    let peak_rgb = grid.color[peak_index].mean();
    let samples = cells.iter().map(|&(x, y)| {
        (pixel_to_dir(x as f32, y as f32, width, height), grid.color[y * width + x])
    });
    let Some(fit) = refine_intensity(samples, &forward, sharpness, &mean_rgb, &color, peak_rgb, solver)?
    else {
        debug!("Sun intensity refinement gave no positive exposure");
        return Ok(None);
    };

    let sun = DetectedLight::new_sun(sun_rotation(&forward), color, fit.ev);
    info!(
        "Sun detected toward {:?} (EV {:.2}, {} cells) in {:.2?}",
        forward,
        fit.ev,
        cells.len(),
        started.elapsed()
    );
    Ok(Some(sun))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::math::transform::TransformFactory;
    use image::{RgbImage, Rgba};
    use nalgebra::Point3;

    fn intrinsics() -> RawIntrinsics {
        RawIntrinsics {
            fx: 100.0,
            fy: 100.0,
            ox: 32.0,
            oy: 24.0,
            width: 64,
            height: 48,
        }
    }

    /// A frame looking along `forward` whose every pixel is sky, bright in a central square.
    fn sky_frame(forward: &Vector3<f32>) -> Frame {
        let view = TransformFactory::view(&Point3::origin(), &Point3::from(*forward), &Vector3::z());
        let mut frame = Frame::from_view(0, RgbImage::new(64, 48), view).unwrap();
        for (x, y, px) in frame.sky.enumerate_pixels_mut() {
            let bright = (17..=47).contains(&x) && (9..=39).contains(&y);
            *px = if bright { Rgba([250, 245, 240, 1]) } else { Rgba([10, 10, 10, 1]) };
        }
        frame
    }

    #[test]
    fn rotation_points_local_minus_z_forward() {
        for forward in [
            Vector3::new(1.0, 1.0, 0.8),
            Vector3::new(0.0, -1.0, 0.2),
            Vector3::new(0.0, 0.0, 1.0),
        ] {
            let f = forward.normalize();
            let q = sun_rotation(&f);
            assert!((q * -Vector3::z() - f).norm() < 1e-5, "{forward:?}");
            // Right-handed basis: local +X stays horizontal unless looking straight up.
            if f.z.abs() < 0.99 {
                assert!((q * Vector3::x()).z.abs() < 1e-5);
            }
        }
    }

    #[test]
    fn center_pixel_lands_in_the_viewing_direction() {
        let forward = Vector3::new(1.0, 1.0, 0.8).normalize();
        let frame = sky_frame(&forward);
        let grid = accumulate_sky(&[frame], &intrinsics(), &[2.0], 100, 50).unwrap();
        let (cx, cy) = dir_to_pixel(&forward, 100, 50);
        let cell = grid.color[cy * 100 + cx];
        assert!((cell.x - 250.0 / 510.0).abs() < 1e-4);
        assert!(grid.illuminance[cy * 100 + cx] > 0.0);
        // Straight down nothing was seen.
        assert_eq!(grid.illuminance[49 * 100 + 10], 0.0);
    }

    #[test]
    fn frames_without_positive_exposure_are_skipped() {
        let forward = Vector3::new(1.0, 1.0, 0.8).normalize();
        let frames = [sky_frame(&forward), sky_frame(&forward)];
        let grid = accumulate_sky(&frames, &intrinsics(), &[0.0, 2.0], 100, 50).unwrap();
        let (cx, cy) = dir_to_pixel(&forward, 100, 50);
        assert!((grid.color[cy * 100 + cx].x - 250.0 / 510.0).abs() < 1e-4);

        let none = accumulate_sky(&frames, &intrinsics(), &[0.0, f64::NAN], 100, 50).unwrap();
        assert!(none.illuminance.iter().all(|&il| il == 0.0));
    }

    #[test]
    fn bright_sky_patch_becomes_the_sun() {
        let forward = Vector3::new(1.0, 1.0, 0.8).normalize();
        let frame = sky_frame(&forward);
        let sun = detect_sun(
            &[frame],
            &intrinsics(),
            &[1.0],
            &DetectionConfig::default(),
            &SolverConfig::default(),
        )
        .unwrap()
        .unwrap();
        let DetectedLight::Sun { rotation, color, exposure } = sun else {
            panic!("expected a sun");
        };
        let q = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
            rotation[3], rotation[0], rotation[1], rotation[2],
        ));
        assert!((q * -Vector3::z()).dot(&forward) > 0.99);
        assert!(exposure > 0.0);
        assert!(color.iter().all(|&c| c > 0.0));
    }

    #[test]
    fn no_sky_no_sun() {
        let view = TransformFactory::view(&Point3::origin(), &Point3::new(1.0, 0.0, 0.0), &Vector3::z());
        let frame = Frame::from_view(0, RgbImage::new(64, 48), view).unwrap();
        let sun = detect_sun(
            &[frame],
            &intrinsics(),
            &[1.0],
            &DetectionConfig::default(),
            &SolverConfig::default(),
        )
        .unwrap();
        assert!(sun.is_none());
    }
}
