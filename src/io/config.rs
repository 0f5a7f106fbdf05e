use crate::error::{EstimateError, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub correspondence: CorrespondenceConfig,
    #[serde(default)]
    pub solver: SolverConfig,
    #[serde(default)]
    pub panorama: PanoramaConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoaderConfig {
    #[serde(default = "default_true")]
    pub correct_gamma: bool,
    /// Name of the folder holding the RGB-D frames.
    #[serde(default = "default_frames_dir")]
    pub frames_dir: String,
    /// File name suffix identifying the mesh reconstruction.
    #[serde(default = "default_mesh_suffix")]
    pub mesh_suffix: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            correct_gamma: true,
            frames_dir: default_frames_dir(),
            mesh_suffix: default_mesh_suffix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorrespondenceConfig {
    /// Upper bound on vertices handed to the exposure solver.
    #[serde(default = "default_max_verts")]
    pub max_verts: usize,
    #[serde(default = "default_false")]
    pub randomize: bool,
    #[serde(default)]
    pub seed: u64,
}

impl Default for CorrespondenceConfig {
    fn default() -> Self {
        Self {
            max_verts: default_max_verts(),
            randomize: false,
            seed: 0,
        }
    }
}

/// Robust loss applied to solver residuals, validated when the config is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LossConfig {
    None,
    Huber { scale: f64 },
    Cauchy { scale: f64 },
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolverConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Relative cost decrease under which the solver stops.
    #[serde(default = "default_function_tolerance")]
    pub function_tolerance: f64,
    #[serde(default = "default_loss")]
    pub loss: LossConfig,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            function_tolerance: default_function_tolerance(),
            loss: default_loss(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PanoramaConfig {
    #[serde(default = "default_panorama_width")]
    pub width: usize,
    #[serde(default = "default_panorama_height")]
    pub height: usize,
    /// Sub-pixel samples per axis.
    #[serde(default = "default_samples")]
    pub samples: usize,
}

impl Default for PanoramaConfig {
    fn default() -> Self {
        Self {
            width: default_panorama_width(),
            height: default_panorama_height(),
            samples: default_samples(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    // --- Point lights ---
    #[serde(default = "default_point_blur")]
    pub point_blur: usize,
    #[serde(default = "default_point_tolerance")]
    pub point_tolerance: f32,
    /// A peak below `stop_ratio` times the largest peak seen ends the search.
    #[serde(default = "default_stop_ratio")]
    pub stop_ratio: f32,
    /// Optional absolute illuminance floor for peaks.
    #[serde(default)]
    pub min_peak: Option<f32>,
    #[serde(default = "default_max_lights")]
    pub max_lights: usize,

    // --- Sun ---
    #[serde(default = "default_true")]
    pub detect_sun: bool,
    #[serde(default = "default_sun_blur")]
    pub sun_blur: usize,
    #[serde(default = "default_sun_tolerance")]
    pub sun_tolerance: f32,
    #[serde(default = "default_sun_width")]
    pub sun_width: usize,
    #[serde(default = "default_sun_height")]
    pub sun_height: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            point_blur: default_point_blur(),
            point_tolerance: default_point_tolerance(),
            stop_ratio: default_stop_ratio(),
            min_peak: None,
            max_lights: default_max_lights(),
            detect_sun: true,
            sun_blur: default_sun_blur(),
            sun_tolerance: default_sun_tolerance(),
            sun_width: default_sun_width(),
            sun_height: default_sun_height(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Where outputs go; defaults to the capture folder.
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default = "default_true")]
    pub cache: bool,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    /// Write HDR mesh and panorama debug images.
    #[serde(default = "default_false")]
    pub debug: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: None,
            cache: true,
            cache_dir: default_cache_dir(),
            debug: false,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_frames_dir() -> String {
    "rgbd".to_string()
}
fn default_mesh_suffix() -> String {
    "mesh.refined.v2.obj".to_string()
}
fn default_max_verts() -> usize {
    200_000
}
fn default_max_iterations() -> usize {
    100
}
fn default_function_tolerance() -> f64 {
    1e-9
}
fn default_loss() -> LossConfig {
    LossConfig::None
}
fn default_panorama_width() -> usize {
    7768
}
fn default_panorama_height() -> usize {
    3884
}
fn default_samples() -> usize {
    2
}
fn default_point_blur() -> usize {
    21
}
fn default_point_tolerance() -> f32 {
    0.4
}
fn default_stop_ratio() -> f32 {
    0.8
}
fn default_max_lights() -> usize {
    32
}
fn default_sun_blur() -> usize {
    3
}
fn default_sun_tolerance() -> f32 {
    0.3
}
fn default_sun_width() -> usize {
    100
}
fn default_sun_height() -> usize {
    50
}
fn default_cache_dir() -> String {
    ".hdr_cache".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| EstimateError::Config(format!("Failed to read config file: {}", e)))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| EstimateError::Config(format!("Failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(EstimateError::Config(msg.to_string()));
        if self.panorama.width == 0 || self.panorama.height == 0 || self.panorama.samples == 0 {
            return fail("panorama size and samples must be positive");
        }
        if self.detection.sun_width == 0 || self.detection.sun_height == 0 {
            return fail("sun grid size must be positive");
        }
        if !(0.0..=1.0).contains(&self.detection.stop_ratio) {
            return fail("detection.stop_ratio must lie in [0, 1]");
        }
        match self.solver.loss {
            LossConfig::Huber { scale } | LossConfig::Cauchy { scale } if scale <= 0.0 => {
                fail("solver.loss.scale must be positive")
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert!(config.loader.correct_gamma);
        assert_eq!(config.correspondence.max_verts, 200_000);
        assert_eq!(config.solver.max_iterations, 100);
        assert_eq!(config.solver.loss, LossConfig::None);
        assert_eq!((config.panorama.width, config.panorama.height), (7768, 3884));
        assert_eq!(config.detection.point_blur, 21);
        assert_eq!(config.detection.sun_width, 100);
    }

    #[test]
    fn sections_override_defaults() {
        let config = Config::parse(
            r#"
            [correspondence]
            max_verts = 5000
            randomize = true

            [solver.loss]
            kind = "huber"
            scale = 12.5

            [detection]
            stop_ratio = 0.6
            min_peak = 3.0
            "#,
        )
        .unwrap();
        assert_eq!(config.correspondence.max_verts, 5000);
        assert!(config.correspondence.randomize);
        assert_eq!(config.solver.loss, LossConfig::Huber { scale: 12.5 });
        assert_eq!(config.detection.min_peak, Some(3.0));
        assert_eq!(config.detection.point_tolerance, 0.4);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(Config::parse("[solver.loss]\nkind = \"tukey\"").is_err());
        assert!(Config::parse("[solver.loss]\nkind = \"cauchy\"\nscale = -1.0").is_err());
        assert!(Config::parse("[panorama]\nsamples = 0").is_err());
    }
}
