//! Point light and sun detection on the HDR panorama.

use crate::compute::{Bindings, BufferKind, ComputeSession, Kernel, KernelProgram, workgroups_for};
use crate::core::color::{LUMINOUS_EFFICACY, illuminance_to_ev, luminance};
use crate::core::imgproc::{Mask, flood_fill, gaussian_blur, masked_max};
use crate::core::math::equirect::{pixel_solid_angle, pixel_to_dir};
use crate::error::Result;
use crate::io::config::{DetectionConfig, SolverConfig};
use crate::pipeline::footprint::Ellipse;
use crate::pipeline::panorama::Panorama;
use crate::pipeline::sun::detect_sun;
use crate::scene::camera::RawIntrinsics;
use crate::scene::frame::Frame;
use crate::scene::light::{DetectedLight, LightLobe};
use crate::solver::{IntensityCost, Problem, SolverOptions};
use log::{debug, info, warn};
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f32::consts::PI;
use std::time::Instant;

// --- Kernels ---

const GRID: u32 = 0;
const INPUT: u32 = 1;
const OUTPUT: u32 = 2;

fn grid_size(bindings: &Bindings) -> std::result::Result<(usize, usize), String> {
    match bindings.f32(GRID) {
        &[w, h] if w >= 1.0 && h >= 1.0 => Ok((w as usize, h as usize)),
        other => Err(format!("grid size must be [width, height], got {other:?}")),
    }
}

/// Per-pixel illuminance of an equirectangular radiance image:
/// `luminance · 179 · solid angle of the pixel`.
pub struct LuminanceKernel;

impl KernelProgram for LuminanceKernel {
    const NAME: &'static str = "Luminance";
    const INPUTS: &'static [(u32, BufferKind)] = &[(GRID, BufferKind::F32), (INPUT, BufferKind::F32)];
    type Uniforms = (usize, usize);

    fn uniforms(&self, bindings: &Bindings) -> std::result::Result<(usize, usize), String> {
        let (w, h) = grid_size(bindings)?;
        if bindings.f32(INPUT).len() != w * h * 3 {
            return Err("color buffer does not match the grid".into());
        }
        Ok((w, h))
    }
}

impl Kernel for LuminanceKernel {
    const OUTPUT: u32 = OUTPUT;
    const STRIDE: usize = 1;

    fn invoke(&self, gid: usize, &(w, h): &(usize, usize), bindings: &Bindings, out: &mut [f32]) {
        let c = &bindings.f32(INPUT)[gid * 3..gid * 3 + 3];
        let rgb = Vector3::new(c[0], c[1], c[2]);
        out[0] = luminance(&rgb) * LUMINOUS_EFFICACY * pixel_solid_angle(gid / w, w, h);
    }
}

/// Renders the spherical-Gaussian lobes of the detected lights over the panorama grid.
pub struct SgRenderKernel;

impl KernelProgram for SgRenderKernel {
    const NAME: &'static str = "SGRender";
    const INPUTS: &'static [(u32, BufferKind)] = &[(GRID, BufferKind::F32), (INPUT, BufferKind::F32)];
    type Uniforms = ((usize, usize), Vec<LightLobe>);

    fn uniforms(&self, bindings: &Bindings) -> std::result::Result<Self::Uniforms, String> {
        let size = grid_size(bindings)?;
        let packed = bindings.f32(INPUT);
        if packed.len() % 12 != 0 {
            return Err("lobes are packed as 12 floats".into());
        }
        let lobes = packed
            .chunks_exact(12)
            .map(|l| LightLobe {
                amplitude: Vector3::new(l[0], l[1], l[2]),
                axis: Vector3::new(l[4], l[5], l[6]),
                sharpness: l[8],
            })
            .collect();
        Ok((size, lobes))
    }
}

impl Kernel for SgRenderKernel {
    const OUTPUT: u32 = OUTPUT;
    const STRIDE: usize = 3;

    fn invoke(&self, gid: usize, ((w, h), lobes): &Self::Uniforms, _: &Bindings, out: &mut [f32]) {
        let dir = pixel_to_dir((gid % w) as f32, (gid / w) as f32, *w, *h);
        let color: Vector3<f32> = lobes.iter().map(|lobe| lobe.eval(&dir)).sum();
        out.copy_from_slice(color.as_slice());
    }
}

/// Per-pixel illuminance of a panorama.
pub fn panorama_illuminance(panorama: &Panorama) -> Result<Vec<f32>> {
    let (w, h) = (panorama.width(), panorama.height());
    let mut session = ComputeSession::load(LuminanceKernel);
    session.set_data(GRID, vec![w as f32, h as f32]);
    session.set_data(
        INPUT,
        panorama.buffer.color_buffer.iter().flat_map(|c| [c.x, c.y, c.z]).collect::<Vec<_>>(),
    );
    session.set_data(OUTPUT, vec![0.0f32; w * h]);
    session.start_compute(workgroups_for(w * h))?;
    session.get_data_f32(OUTPUT)
}

/// Debug render of `lobes` on a `width × height` equirectangular grid.
pub fn render_lobes(lobes: &[LightLobe], width: usize, height: usize) -> Result<Vec<Vector3<f32>>> {
    let mut session = ComputeSession::load(SgRenderKernel);
    session.set_data(GRID, vec![width as f32, height as f32]);
    session.set_data(INPUT, lobes.iter().flat_map(LightLobe::to_array).collect::<Vec<_>>());
    session.set_data(OUTPUT, vec![0.0f32; width * height * 3]);
    session.start_compute(workgroups_for(width * height))?;
    Ok(session
        .get_data_f32(OUTPUT)?
        .chunks_exact(3)
        .map(|c| Vector3::new(c[0], c[1], c[2]))
        .collect())
}

// --- Intensity refinement ---

/// Refined lobe amplitude and the exposure it implies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntensityFit {
    pub amplitude: Vector3<f32>,
    pub ev: f32,
}

/// Fits the amplitude of a spherical Gaussian with fixed `axis` and `sharpness` to footprint
/// samples `(direction, radiance)`.
///
/// Each sample is weighted by its mean radiance over `peak`. The refined EV is the mean of
/// `amplitude / color` over the channels; `None` unless it is positive.
pub fn refine_intensity(
    samples: impl Iterator<Item = (Vector3<f32>, Vector3<f32>)>,
    axis: &Vector3<f32>,
    sharpness: f32,
    initial: &Vector3<f32>,
    color: &Vector3<f32>,
    peak: f32,
    solver: &SolverConfig,
) -> Result<Option<IntensityFit>> {
    let mut problem = Problem::new();
    problem.add_parameter_block("amplitude", &[initial.x as f64, initial.y as f64, initial.z as f64])?;
    for (dir, radiance) in samples {
        let weight = if peak > 0.0 { radiance.mean() / peak } else { 1.0 };
        let cost = IntensityCost::new(
            dir.dot(axis) as f64,
            sharpness as f64,
            [radiance.x as f64, radiance.y as f64, radiance.z as f64],
            weight as f64,
        );
        problem.add_residual_block(cost, &["amplitude"], solver.loss)?;
    }
    let solution = problem.solve(&SolverOptions::from(solver))?;
    debug!("Intensity solve: {}", solution.summary.brief_report());

    let amplitude = solution
        .get("amplitude")
        .map(|a| Vector3::new(a[0] as f32, a[1] as f32, a[2] as f32))
        .unwrap_or(*initial);
    let ev = amplitude.component_div(color).mean();
    Ok((ev.is_finite() && ev > 0.0).then_some(IntensityFit { amplitude, ev }))
}

// --- Point lights ---

/// Lights found in one run, plus debug products.
#[derive(Debug, Clone, Default)]
pub struct Detection {
    /// Point lights in discovery order, then the sun.
    pub lights: Vec<DetectedLight>,
    /// One lobe per point light, same order.
    pub lobes: Vec<LightLobe>,
    /// Per-pixel illuminance of the panorama.
    pub illuminance: Vec<f32>,
    /// Panorama with every fitted footprint painted in a random color.
    pub light_map: Vec<Vector3<f32>>,
}

/// Turns one footprint into a point light.
fn estimate_point_light(
    panorama: &Panorama,
    filtered: &[f32],
    pixels: &[(usize, usize)],
    ellipse: &Ellipse,
    seed: (usize, usize),
    solver: &SolverConfig,
) -> Result<Option<(DetectedLight, LightLobe)>> {
    let (w, h) = (panorama.width(), panorama.height());

    // 1. Intensity & color
    let illuminance: f32 = pixels.iter().map(|&(x, y)| filtered[y * w + x]).sum();
    let ev = illuminance_to_ev(illuminance);
    if !ev.is_finite() || ev == 0.0 {
        debug!("Footprint at {seed:?} has illuminance {illuminance}, skipped");
        return Ok(None);
    }
    let mean_rgb =
        pixels.iter().map(|&(x, y)| panorama.color(x, y)).sum::<Vector3<f32>>() / pixels.len() as f32;
    let color = mean_rgb / ev;

    // 2. Position from the centroid direction and mean depth
    let depths: Vec<f32> = pixels
        .iter()
        .map(|&(x, y)| panorama.depth(x, y))
        .filter(|d| d.is_finite())
        .collect();
    if depths.is_empty() {
        debug!("Footprint at {seed:?} only sees sky, skipped");
        return Ok(None);
    }
    let depth = depths.iter().sum::<f32>() / depths.len() as f32;
    let axis = pixel_to_dir(ellipse.center.x.floor(), ellipse.center.y.floor(), w, h);
    let position = panorama.eye + axis * depth;

    // 3. Refinement
    let sharpness = 4.0 * PI / ellipse.solid_angle(w, h);
    let peak = panorama.color(seed.0, seed.1).mean();
    let samples = pixels
        .iter()
        .map(|&(x, y)| (pixel_to_dir(x as f32, y as f32, w, h), panorama.color(x, y)));
    let Some(fit) = refine_intensity(samples, &axis, sharpness, &mean_rgb, &color, peak, solver)? else {
        debug!("Footprint at {seed:?} refined to a non-positive exposure, skipped");
        return Ok(None);
    };

    let lobe = LightLobe {
        amplitude: fit.amplitude,
        axis,
        sharpness,
    };
    Ok(Some((DetectedLight::new_point(position, color, fit.ev), lobe)))
}

/// Repeatedly claims the brightest remaining region of the panorama as a point light.
///
/// Stops when the peak drops below `stop_ratio` times the brightest peak seen (or below
/// `min_peak`), when no pixel is left, or after `max_lights` candidate regions.
pub fn detect_point_lights(
    panorama: &Panorama,
    illuminance: &[f32],
    config: &DetectionConfig,
    solver: &SolverConfig,
) -> Result<Detection> {
    let (w, h) = (panorama.width(), panorama.height());
    let filtered = gaussian_blur(illuminance, w, h, config.point_blur);
    let mut claimed = Mask::new(w, h);
    let mut rng = StdRng::seed_from_u64(0);
    let mut light_map = panorama.buffer.color_buffer.clone();
    let mut detection = Detection::default();
    let mut max_peak = 0.0f32;

    for candidate in 0..config.max_lights {
        let Some((index, peak)) = masked_max(&filtered, &claimed) else {
            debug!("Every pixel claimed after {candidate} candidates");
            break;
        };
        max_peak = max_peak.max(peak);
        if peak <= 0.0 || peak < config.stop_ratio * max_peak {
            break;
        }
        if config.min_peak.is_some_and(|floor| peak < floor) {
            break;
        }

        let seed = (index % w, index / w);
        let pixels = flood_fill(&filtered, &mut claimed, seed, config.point_tolerance);
        let Some(ellipse) = Ellipse::fit(&pixels) else {
            debug!("Candidate at {seed:?} covers {} pixels, too few for a light", pixels.len());
            continue;
        };
        let paint = Vector3::new(rng.random::<f32>(), rng.random::<f32>(), rng.random::<f32>());
        for (x, y) in ellipse.rasterize(w, h) {
            light_map[y * w + x] = paint;
        }

        if let Some((light, lobe)) = estimate_point_light(panorama, &filtered, &pixels, &ellipse, seed, solver)? {
            debug!("Point light {} at {seed:?}: {light:?}", detection.lights.len());
            detection.lights.push(light);
            detection.lobes.push(lobe);
        }
    }

    detection.light_map = light_map;
    Ok(detection)
}

/// Detects point lights on the panorama, then the sun in the frames' sky pixels.
pub fn detect_lights(
    panorama: &Panorama,
    frames: &[Frame],
    intr: &RawIntrinsics,
    exposures: &[f64],
    config: &DetectionConfig,
    solver: &SolverConfig,
) -> Result<Detection> {
    let started = Instant::now();
    let illuminance = panorama_illuminance(panorama)?;
    let mut detection = detect_point_lights(panorama, &illuminance, config, solver)?;
    detection.illuminance = illuminance;
    let points = detection.lights.len();

    if config.detect_sun {
        match detect_sun(frames, intr, exposures, config, solver)? {
            Some(sun) => detection.lights.push(sun),
            None => info!("No sun detected"),
        }
    }
    if detection.lights.is_empty() {
        warn!("No light sources detected");
    }
    info!(
        "Detected {} point lights and {} sun in {:.2?}",
        points,
        detection.lights.len() - points,
        started.elapsed()
    );
    Ok(detection)
}
