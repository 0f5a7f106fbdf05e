//! Capture folder loading.
//!
//! Layout: `<capture>/<frames_dir>/_info.txt` plus `frame-NNNNNN.{color.jpg,depth.pgm,pose.txt}`
//! files, and a mesh file ending in the configured suffix next to the frames folder.

use crate::error::{EstimateError, Result};
use crate::io::config::LoaderConfig;
use crate::io::image::{load_color, load_depth};
use crate::io::obj_loader::load_obj;
use crate::scene::camera::{Calibration, CenteredIntrinsics, RawIntrinsics};
use crate::scene::frame::{Frame, frame_name};
use crate::scene::mesh::Mesh;
use log::{debug, info};
use nalgebra::Matrix4;
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

const INFO_FILE: &str = "_info.txt";
const COLOR_SUFFIX: &str = ".color.jpg";
const DEPTH_SUFFIX: &str = ".depth.pgm";
const POSE_SUFFIX: &str = ".pose.txt";

/// Everything a run needs from a capture folder.
#[derive(Debug)]
pub struct Capture {
    pub frames: Vec<Frame>,
    pub calibration: Calibration,
    pub intr_centered: CenteredIntrinsics,
    pub intr_raw: RawIntrinsics,
    pub mesh: Mesh,
    pub mesh_path: PathBuf,
}

/// Loads frames, intrinsics and the mesh from a capture folder.
pub fn load_path<P: AsRef<Path>>(path: P, options: &LoaderConfig) -> Result<Capture> {
    let path = path.as_ref();
    let started = Instant::now();

    let frames_dir = path.join(&options.frames_dir);
    if !frames_dir.is_dir() {
        return Err(EstimateError::malformed(format!(
            "frames folder {} does not exist",
            frames_dir.display()
        )));
    }
    let mesh_path = find_mesh(path, &options.mesh_suffix)?;

    // 1. Calibration
    let info = parse_info(&fs::read_to_string(frames_dir.join(INFO_FILE))?)?;
    let calibration = calibration_from_info(&info)?;

    // 2. Frames
    let count = count_frames(&frames_dir)?;
    info!(
        "Loading {} frames from {} (gamma correction: {})",
        count,
        frames_dir.display(),
        options.correct_gamma
    );
    let frames = (0..count)
        .into_par_iter()
        .map(|index| load_frame(&frames_dir, index, &calibration, options.correct_gamma))
        .collect::<Result<Vec<_>>>()?;

    // 3. Mesh
    let mesh = load_obj(&mesh_path)?;

    info!("Capture loaded in {:.2?}", started.elapsed());
    Ok(Capture {
        frames,
        intr_centered: calibration.centered(),
        intr_raw: calibration.raw(),
        calibration,
        mesh,
        mesh_path,
    })
}

fn find_mesh(dir: &Path, suffix: &str) -> Result<PathBuf> {
    let mut candidates: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(suffix))
        })
        .collect();
    candidates.sort();
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| EstimateError::MissingMesh {
            dir: dir.to_path_buf(),
            suffix: suffix.to_string(),
        })
}

/// Parses `key = value` lines. Blank lines and lines without `=` are ignored.
pub fn parse_info(content: &str) -> Result<HashMap<String, String>> {
    Ok(content
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect())
}

fn info_value<'a>(info: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    info.get(key)
        .map(String::as_str)
        .ok_or_else(|| EstimateError::malformed(format!("{INFO_FILE} lacks '{key}'")))
}

/// Parses 16 whitespace-separated numbers as a row-major 4×4 matrix.
pub fn parse_matrix(text: &str) -> Result<Matrix4<f32>> {
    let values = text
        .split_whitespace()
        .map(|v| v.parse::<f32>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| EstimateError::malformed(format!("bad matrix entry: {e}")))?;
    if values.len() != 16 {
        return Err(EstimateError::malformed(format!(
            "expected 16 matrix entries, found {}",
            values.len()
        )));
    }
    Ok(Matrix4::from_row_slice(&values))
}

pub fn calibration_from_info(info: &HashMap<String, String>) -> Result<Calibration> {
    let dimension = |key: &str| -> Result<usize> {
        info_value(info, key)?
            .parse()
            .map_err(|e| EstimateError::malformed(format!("{key}: {e}")))
    };
    let width = dimension("m_colorWidth")?;
    let height = dimension("m_colorHeight")?;
    let intrinsic = parse_matrix(info_value(info, "m_calibrationColorIntrinsic")?)?;
    Ok(Calibration::from_matrix(&intrinsic, width, height))
}

/// Counts `frame-NNNNNN.color.jpg` files and checks they number `0..count` without gaps.
pub fn count_frames(frames_dir: &Path) -> Result<usize> {
    let mut indices: Vec<usize> = fs::read_dir(frames_dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            let digits = name.strip_prefix("frame-")?.strip_suffix(COLOR_SUFFIX)?;
            (digits.len() == 6 && digits.bytes().all(|b| b.is_ascii_digit()))
                .then(|| digits.parse().ok())
                .flatten()
        })
        .collect();
    indices.sort_unstable();

    if let Some((expected, found)) = indices
        .iter()
        .enumerate()
        .find(|(expected, found)| expected != *found)
    {
        return Err(EstimateError::malformed(format!(
            "frame numbering has a gap: expected {}, found {}",
            frame_name(expected),
            frame_name(*found)
        )));
    }
    if indices.is_empty() {
        return Err(EstimateError::malformed(format!(
            "no frames found in {}",
            frames_dir.display()
        )));
    }
    Ok(indices.len())
}

fn load_frame(
    frames_dir: &Path,
    index: usize,
    calibration: &Calibration,
    correct_gamma: bool,
) -> Result<Frame> {
    let name = frame_name(index);
    let file = |suffix: &str| {
        let path = frames_dir.join(format!("{name}{suffix}"));
        if path.is_file() {
            Ok(path)
        } else {
            Err(EstimateError::malformed(format!(
                "{} is missing",
                path.display()
            )))
        }
    };

    let color = load_color(file(COLOR_SUFFIX)?)?;
    if (color.width() as usize, color.height() as usize) != (calibration.width, calibration.height)
    {
        debug!(
            "{name}: color is {}x{}, calibration says {}x{}",
            color.width(),
            color.height(),
            calibration.width,
            calibration.height
        );
    }
    let depth = load_depth(file(DEPTH_SUFFIX)?, color.width(), color.height())?;
    let pose = parse_matrix(&fs::read_to_string(file(POSE_SUFFIX)?)?)
        .map_err(|e| EstimateError::malformed(format!("{name}: {e}")))?;

    Frame::from_capture(index, color, &depth, &pose, correct_gamma)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::frame::DepthImage;
    use image::{Luma, Rgb, RgbImage};

    const INFO: &str = "m_versionNumber = 4\nm_colorWidth = 200\nm_colorHeight = 100\n\
        m_calibrationColorIntrinsic = 180 0 99 0 0 181 51 0 0 0 1 0 0 0 0 1\n";

    fn write_frame(dir: &Path, index: usize) {
        let name = frame_name(index);
        RgbImage::from_pixel(200, 100, Rgb([120, 60, 30]))
            .save(dir.join(format!("{name}.color.jpg")))
            .unwrap();
        DepthImage::from_pixel(100, 50, Luma([1000]))
            .save(dir.join(format!("{name}.depth.pgm")))
            .unwrap();
        fs::write(
            dir.join(format!("{name}.pose.txt")),
            format!("1 0 0 {index}\n0 1 0 0\n0 0 1 0\n0 0 0 1\n"),
        )
        .unwrap();
    }

    fn write_capture(frames: usize) -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        let frames_dir = root.path().join("rgbd");
        fs::create_dir(&frames_dir).unwrap();
        fs::write(frames_dir.join(INFO_FILE), INFO).unwrap();
        for i in 0..frames {
            write_frame(&frames_dir, i);
        }
        fs::write(
            root.path().join("scene.mesh.refined.v2.obj"),
            "v 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\n",
        )
        .unwrap();
        root
    }

    #[test]
    fn loads_synthetic_capture() {
        let root = write_capture(3);
        let capture = load_path(root.path(), &LoaderConfig::default()).unwrap();

        assert_eq!(capture.frames.len(), 3);
        assert_eq!(capture.frames[2].name, "frame-000002");
        assert_eq!(capture.frames[2].eye.x, 2.0);
        assert_eq!(capture.calibration.fx, 180.0);
        assert_eq!(capture.intr_raw.oy, 51.0);
        assert!((capture.intr_centered.cx - (99.0 - 100.0) / 200.0).abs() < 1e-7);
        assert_eq!(capture.mesh.face_count(), 1);

        // Depth is present everywhere, so only the sky mask's alpha stays zero.
        let frame = &capture.frames[0];
        assert!(frame.sky.pixels().all(|p| p.0[3] == 0));
        assert_eq!(frame.edges.count(), 0);
    }

    #[test]
    fn gap_in_numbering_fails_loudly() {
        let root = write_capture(2);
        write_frame(&root.path().join("rgbd"), 3);
        let err = load_path(root.path(), &LoaderConfig::default()).unwrap_err();
        assert!(err.to_string().contains("frame-000002"), "{err}");
    }

    #[test]
    fn missing_companion_file_fails() {
        let root = write_capture(2);
        fs::remove_file(root.path().join("rgbd/frame-000001.pose.txt")).unwrap();
        let err = load_path(root.path(), &LoaderConfig::default()).unwrap_err();
        assert!(err.to_string().contains("frame-000001.pose.txt"), "{err}");
    }

    #[test]
    fn missing_mesh_is_reported() {
        let root = write_capture(1);
        fs::remove_file(root.path().join("scene.mesh.refined.v2.obj")).unwrap();
        let err = load_path(root.path(), &LoaderConfig::default()).unwrap_err();
        assert!(matches!(err, EstimateError::MissingMesh { .. }));
    }

    #[test]
    fn info_parsing() {
        let info = parse_info(INFO).unwrap();
        assert_eq!(info["m_colorWidth"], "200");
        assert!(parse_matrix("1 2 3").is_err());
        let calibration = calibration_from_info(&info).unwrap();
        assert_eq!((calibration.width, calibration.height), (200, 100));
        assert_eq!(calibration.fy, 181.0);
    }
}
