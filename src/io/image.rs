use crate::core::color::to_display;
use crate::error::{EstimateError, Result};
use crate::scene::frame::DepthImage;
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgb, Rgb32FImage, RgbImage};
use log::debug;
use nalgebra::Vector3;
use std::path::Path;

/// Loads an 8-bit color image as RGB.
pub fn load_color<P: AsRef<Path>>(path: P) -> Result<RgbImage> {
    Ok(image::open(path)?.into_rgb8())
}

/// Loads a 16-bit depth map and resizes it (nearest neighbor) to `width × height`.
pub fn load_depth<P: AsRef<Path>>(path: P, width: u32, height: u32) -> Result<DepthImage> {
    let depth = image::open(path)?.into_luma16();
    if depth.dimensions() == (width, height) {
        return Ok(depth);
    }
    Ok(imageops::resize(&depth, width, height, FilterType::Nearest))
}

fn check_len(len: usize, width: usize, height: usize) -> Result<()> {
    if len != width * height {
        return Err(EstimateError::malformed(format!(
            "image buffer has {len} pixels, expected {width}x{height}"
        )));
    }
    Ok(())
}

/// Saves linear HDR colors as a Radiance `.hdr` file. Non-finite values are written as 0.
pub fn save_hdr<P: AsRef<Path>>(
    path: P,
    pixels: &[Vector3<f32>],
    width: usize,
    height: usize,
) -> Result<()> {
    check_len(pixels.len(), width, height)?;
    let img: Rgb32FImage = ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
        let c = pixels[y as usize * width + x as usize];
        Rgb(c.map(|v| if v.is_finite() { v.max(0.0) } else { 0.0 }).into())
    });
    img.save(path.as_ref())?;
    debug!("Saved HDR image '{}'", path.as_ref().display());
    Ok(())
}

/// Saves a scalar plane (depth, illuminance) as a gray Radiance `.hdr` file.
pub fn save_scalar_hdr<P: AsRef<Path>>(
    path: P,
    values: &[f32],
    width: usize,
    height: usize,
) -> Result<()> {
    let pixels: Vec<Vector3<f32>> = values.iter().map(|&v| Vector3::repeat(v)).collect();
    save_hdr(path, &pixels, width, height)
}

/// Tone maps HDR colors and saves them as an 8-bit image (format from the extension).
pub fn save_tonemapped<P: AsRef<Path>>(
    path: P,
    pixels: &[Vector3<f32>],
    width: usize,
    height: usize,
    exposure: f32,
) -> Result<()> {
    check_len(pixels.len(), width, height)?;
    let img: RgbImage = ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
        Rgb(to_display(pixels[y as usize * width + x as usize], exposure))
    });
    img.save(path.as_ref())?;
    debug!("Saved image '{}'", path.as_ref().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn depth_is_resized_to_color_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame-000000.depth.pgm");
        let mut depth = DepthImage::new(4, 2);
        depth.put_pixel(3, 1, Luma([4000]));
        depth.save(&path).unwrap();

        let loaded = load_depth(&path, 8, 4).unwrap();
        assert_eq!(loaded.dimensions(), (8, 4));
        assert_eq!(loaded.get_pixel(7, 3).0[0], 4000);
        assert_eq!(loaded.get_pixel(0, 0).0[0], 0);
    }

    #[test]
    fn hdr_output_keeps_values_above_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pan.hdr");
        let pixels = vec![Vector3::new(4.0, 0.5, f32::NAN), Vector3::zeros()];
        save_hdr(&path, &pixels, 2, 1).unwrap();

        let back = image::open(&path).unwrap().into_rgb32f();
        let p = back.get_pixel(0, 0).0;
        assert!((p[0] - 4.0).abs() < 0.05);
        assert_eq!(p[2], 0.0);
        assert!(save_hdr(&path, &pixels, 3, 1).is_err());
    }
}
