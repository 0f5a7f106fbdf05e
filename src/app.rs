use crate::error::Result;
use crate::io::cache::{Artifact, ArtifactCache, CacheKey, KeyBuilder};
use crate::io::config::{Config, CorrespondenceConfig, LossConfig, SolverConfig};
use crate::io::export::{write_exposures, write_hdr_mesh, write_lights};
use crate::io::image::{save_hdr, save_scalar_hdr, save_tonemapped};
use crate::io::loader::{Capture, load_path};
use crate::pipeline::correspondence::{Selection, select_indices, vertex_hitmap};
use crate::pipeline::detector::{Detection, detect_lights, render_lobes};
use crate::pipeline::exposure::solve_exposure;
use crate::pipeline::panorama::{Panorama, render_panorama};
use crate::pipeline::reproject::radiance_reproject;
use crate::raytrace::device::RenderDevice;
use crate::scene::light::DetectedLight;
use crate::scene::mesh::Mesh;
use crate::solver::SolveSummary;
use log::{debug, info, warn};
use nalgebra::Vector3;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

const CORRESPONDENCE_STAGE: &str = "correspondence";
const EXPOSURE_STAGE: &str = "exposure";
const REPROJECTION_STAGE: &str = "reprojection";

/// What one run produced.
#[derive(Debug, Clone)]
pub struct EstimationReport {
    pub output_dir: PathBuf,
    /// Frame names in capture order, matching `exposures`.
    pub frame_names: Vec<String>,
    /// Linear exposure per frame.
    pub exposures: Vec<f64>,
    /// `None` when the exposures came from the cache.
    pub exposure_summary: Option<SolveSummary>,
    pub lights: Vec<DetectedLight>,
    /// Every file written, in write order.
    pub written: Vec<PathBuf>,
}

/// Runs the full estimation for one capture folder.
///
/// Stages run strictly in sequence: load, correspondence, exposure, reprojection, panorama,
/// detection. A failing stage aborts the run with the stage name attached to the error.
#[derive(Debug, Clone)]
pub struct Estimator {
    config: Config,
}

impl Estimator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn output_dir(&self, capture_dir: &Path) -> PathBuf {
        self.config
            .output
            .dir
            .as_ref()
            .map_or_else(|| capture_dir.to_path_buf(), PathBuf::from)
    }

    fn cache(&self, capture_dir: &Path) -> ArtifactCache {
        ArtifactCache::new(capture_dir.join(&self.config.output.cache_dir), self.config.output.cache)
    }

    pub fn run<P: AsRef<Path>>(&self, capture_dir: P) -> Result<EstimationReport> {
        let capture_dir = capture_dir.as_ref();
        let start_time = Instant::now();
        let output_dir = self.output_dir(capture_dir);
        std::fs::create_dir_all(&output_dir)?;
        let cache = self.cache(capture_dir);
        let mut written = Vec::new();
        info!("Estimating lighting for '{}'", capture_dir.display());

        // 1. Load
        let capture =
            load_path(capture_dir, &self.config.loader).map_err(|e| e.in_stage("loader"))?;
        let frame_names: Vec<String> = capture.frames.iter().map(|f| f.name.clone()).collect();
        let mesh = Arc::new(capture.mesh.clone());
        let device = RenderDevice::spawn(mesh.clone()).map_err(|e| e.in_stage("render device"))?;

        // 2. Correspondence & exposure
        let correspondence_key = correspondence_key(&capture, &self.config.correspondence);
        let exposure_key = exposure_key(correspondence_key, &self.config.solver);
        let (exposures, exposure_summary) =
            match cached_exposures(&cache, exposure_key, capture.frames.len()) {
                Some(exposures) => {
                    info!("Using cached exposures ({})", cache.path(EXPOSURE_STAGE, exposure_key).display());
                    (exposures, None)
                }
                None => {
                    let selection = self
                        .correspondences(&device, &capture, &cache, correspondence_key)
                        .map_err(|e| e.in_stage(CORRESPONDENCE_STAGE))?;
                    let solution = solve_exposure(&selection, &self.config.solver)
                        .map_err(|e| e.in_stage(EXPOSURE_STAGE))?;
                    let artifact = Artifact::new(
                        vec![solution.exposures.len()],
                        solution.exposures.iter().map(|&e| e as f32).collect(),
                    )?;
                    cache
                        .store(EXPOSURE_STAGE, exposure_key, &artifact)
                        .map_err(|e| e.in_stage(EXPOSURE_STAGE))?;
                    // Continue at cache precision so fresh and cached runs agree downstream.
                    let exposures = artifact.data.iter().map(|&e| f64::from(e)).collect();
                    (exposures, Some(solution.summary))
                }
            };
        let exposures_path = output_dir.join("exposures.json");
        write_exposures(&exposures_path, &frame_names, &exposures)
            .map_err(|e| e.in_stage(EXPOSURE_STAGE))?;
        written.push(exposures_path);

        // 3. Radiance reprojection
        let reprojection_key = reprojection_key(correspondence_key, &exposures);
        let radiance = self
            .reprojection(&device, &capture, &exposures, &cache, reprojection_key)
            .map_err(|e| e.in_stage(REPROJECTION_STAGE))?;
        let mut lit = Mesh::clone(&mesh);
        lit.set_radiance(radiance.iter().map(|c| Vector3::from(*c)).collect())
            .map_err(|e| e.in_stage(REPROJECTION_STAGE))?;
        let lit = Arc::new(lit);
        if self.config.output.debug {
            let path = output_dir.join("hdr_mesh.obj");
            write_hdr_mesh(&path, &lit).map_err(|e| e.in_stage(REPROJECTION_STAGE))?;
            written.push(path);
        }

        // 4. Panorama
        let panorama = render_panorama(&device, lit, &capture.frames, &self.config.panorama)
            .map_err(|e| e.in_stage("panorama"))?;

        // 5. Lights
        let detection = detect_lights(
            &panorama,
            &capture.frames,
            &capture.intr_raw,
            &exposures,
            &self.config.detection,
            &self.config.solver,
        )
        .map_err(|e| e.in_stage("detection"))?;
        let lights_path = output_dir.join("lights.json");
        write_lights(&lights_path, &detection.lights).map_err(|e| e.in_stage("detection"))?;
        written.push(lights_path);

        if self.config.output.debug {
            write_debug_images(&output_dir, &panorama, &detection, &mut written)
                .map_err(|e| e.in_stage("debug output"))?;
        }

        info!("Estimation completed in {:.2?}", start_time.elapsed());
        info!("Done.");
        Ok(EstimationReport {
            output_dir,
            frame_names,
            exposures,
            exposure_summary,
            lights: detection.lights,
            written,
        })
    }

    fn correspondences(
        &self,
        device: &RenderDevice,
        capture: &Capture,
        cache: &ArtifactCache,
        key: CacheKey,
    ) -> Result<Selection> {
        let frame_count = capture.frames.len();
        if let Some(artifact) = cache.load(CORRESPONDENCE_STAGE, key) {
            let vertices = select_indices(capture.mesh.vertex_count(), &self.config.correspondence);
            if artifact.shape == [vertices.len(), frame_count, 3] {
                return Selection::from_flat(vertices, frame_count, &artifact.data);
            }
            warn!("Cached correspondences have shape {:?}, recomputing", artifact.shape);
        }

        let selection = vertex_hitmap(
            device,
            &capture.mesh,
            &capture.frames,
            &capture.intr_centered,
            &self.config.correspondence,
        )?;
        let artifact = Artifact::new(
            vec![selection.vertex_count(), frame_count, 3],
            selection.to_flat(),
        )?;
        cache.store(CORRESPONDENCE_STAGE, key, &artifact)?;
        Ok(selection)
    }

    fn reprojection(
        &self,
        device: &RenderDevice,
        capture: &Capture,
        exposures: &[f64],
        cache: &ArtifactCache,
        key: CacheKey,
    ) -> Result<Vec<[f32; 3]>> {
        let vertex_count = capture.mesh.vertex_count();
        if let Some(artifact) = cache.load(REPROJECTION_STAGE, key) {
            if artifact.shape == [vertex_count, 3] {
                info!("Using cached radiance for {vertex_count} vertices");
                return Ok(artifact.data.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect());
            }
            warn!("Cached radiance has shape {:?}, recomputing", artifact.shape);
        }

        let radiance = radiance_reproject(
            device,
            &capture.mesh,
            &capture.frames,
            &capture.intr_centered,
            exposures,
        )?;
        let artifact = Artifact::new(vec![vertex_count, 3], radiance.iter().flatten().copied().collect())?;
        cache.store(REPROJECTION_STAGE, key, &artifact)?;
        Ok(radiance)
    }
}

/// Hash of everything the correspondence search reads.
fn correspondence_key(capture: &Capture, config: &CorrespondenceConfig) -> CacheKey {
    let intr = &capture.intr_centered;
    let mut builder = KeyBuilder::new(CORRESPONDENCE_STAGE)
        .f32s(&capture.mesh.positions.iter().flat_map(|p| [p.x, p.y, p.z]).collect::<Vec<_>>())
        .bytes(&capture.mesh.faces.iter().flatten().flat_map(|i| i.to_le_bytes()).collect::<Vec<_>>())
        .f32s(&[intr.fx, intr.fy, intr.cx, intr.cy])
        .u64(intr.width as u64)
        .u64(intr.height as u64)
        .u64(config.max_verts as u64)
        .u64(config.randomize as u64)
        .u64(config.seed);
    for frame in &capture.frames {
        let edges: Vec<u8> = frame.edges.data.iter().map(|&e| e as u8).collect();
        builder = builder
            .f32s(frame.world_to_camera.as_slice())
            .bytes(frame.rgb.as_raw())
            .bytes(frame.original.as_raw())
            .bytes(&edges);
    }
    builder.finish()
}

fn exposure_key(correspondence: CacheKey, config: &SolverConfig) -> CacheKey {
    let (loss, scale) = match config.loss {
        LossConfig::None => (0, 0.0),
        LossConfig::Huber { scale } => (1, scale),
        LossConfig::Cauchy { scale } => (2, scale),
    };
    KeyBuilder::new(EXPOSURE_STAGE)
        .key(correspondence)
        .u64(config.max_iterations as u64)
        .f64s(&[config.function_tolerance, scale])
        .u64(loss)
        .finish()
}

/// Keyed on the exposures as cached, so a fresh solve and a cache hit share one key.
fn reprojection_key(correspondence: CacheKey, exposures: &[f64]) -> CacheKey {
    let exposures: Vec<f32> = exposures.iter().map(|&e| e as f32).collect();
    KeyBuilder::new(REPROJECTION_STAGE)
        .key(correspondence)
        .f32s(&exposures)
        .finish()
}

fn cached_exposures(cache: &ArtifactCache, key: CacheKey, frames: usize) -> Option<Vec<f64>> {
    let artifact = cache.load(EXPOSURE_STAGE, key)?;
    if artifact.shape != [frames] {
        warn!("Cached exposures have shape {:?}, expected [{frames}]", artifact.shape);
        return None;
    }
    Some(artifact.data.iter().map(|&e| e as f64).collect())
}

fn write_debug_images(
    dir: &Path,
    panorama: &Panorama,
    detection: &Detection,
    written: &mut Vec<PathBuf>,
) -> Result<()> {
    let (w, h) = (panorama.width(), panorama.height());
    let buffer = &panorama.buffer;

    let path = dir.join("panorama.hdr");
    save_hdr(&path, &buffer.color_buffer, w, h)?;
    written.push(path);

    let path = dir.join("panorama_depth.hdr");
    save_scalar_hdr(&path, &buffer.depth_buffer, w, h)?;
    written.push(path);

    if detection.illuminance.len() == w * h {
        let path = dir.join("panorama_illuminance.hdr");
        save_scalar_hdr(&path, &detection.illuminance, w, h)?;
        written.push(path);
    }
    if detection.light_map.len() == w * h {
        let path = dir.join("panorama_lights.png");
        save_tonemapped(&path, &detection.light_map, w, h, 1.0)?;
        written.push(path);
    }

    let path = dir.join("panorama_sg.hdr");
    save_hdr(&path, &render_lobes(&detection.lobes, w, h)?, w, h)?;
    written.push(path);

    debug!("Wrote debug images to '{}'", dir.display());
    Ok(())
}
