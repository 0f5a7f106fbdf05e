use crate::core::color::{CAPTURE_GAMMA, adjust_gamma};
use crate::core::imgproc::{Mask, sobel_edge_mask};
use crate::core::math::transform::{extrinsics_from_pose, eye_position, transform_vector};
use crate::error::{EstimateError, Result};
use image::{ImageBuffer, Luma, RgbImage, RgbaImage};
use nalgebra::{Matrix4, Point3, Vector3};

/// Sobel response above which a pixel counts as an edge.
pub const EDGE_THRESHOLD: f32 = 200.0;

/// Columns at the left and right border the capture device never fills correctly.
pub const INVALID_LEFT_COLUMNS: usize = 92;
pub const INVALID_RIGHT_COLUMNS: usize = 90;

/// 16-bit depth map as stored by the capture device.
pub type DepthImage = ImageBuffer<Luma<u16>, Vec<u16>>;

/// Name of frame `index` in capture folders and output files.
pub fn frame_name(index: usize) -> String {
    format!("frame-{index:06}")
}

/// One captured observation. Immutable once built.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: usize,
    pub name: String,
    /// Color as captured.
    pub original: RgbImage,
    /// Color after the optional inverse gamma correction.
    pub rgb: RgbImage,
    /// `rgb` where depth is missing (alpha 1), zero elsewhere and on the invalid borders.
    pub sky: RgbaImage,
    pub edges: Mask,
    pub world_to_camera: Matrix4<f32>,
    /// Camera-to-world in the render convention (camera looks down -Z).
    pub camera_to_world: Matrix4<f32>,
    pub eye: Point3<f32>,
}

impl Frame {
    /// Builds a frame from its decoded files. `depth` must already match the color resolution.
    pub fn from_capture(
        index: usize,
        original: RgbImage,
        depth: &DepthImage,
        pose: &Matrix4<f32>,
        correct_gamma: bool,
    ) -> Result<Self> {
        let name = frame_name(index);
        if depth.dimensions() != original.dimensions() {
            return Err(EstimateError::malformed(format!(
                "{name}: depth is {:?}, color is {:?}",
                depth.dimensions(),
                original.dimensions()
            )));
        }
        let (world_to_camera, camera_to_world) = extrinsics_from_pose(pose)
            .ok_or_else(|| EstimateError::malformed(format!("{name}: pose is not invertible")))?;

        // 1. Color
        let mut rgb = original.clone();
        if correct_gamma {
            adjust_gamma(&mut rgb, CAPTURE_GAMMA);
        }

        // 2. Sky image from missing depth
        let sky = sky_image(&rgb, depth);

        // 3. Edge mask
        let edges = sobel_edge_mask(&rgb, EDGE_THRESHOLD);

        Ok(Self {
            index,
            name,
            original,
            rgb,
            sky,
            edges,
            world_to_camera,
            camera_to_world,
            eye: eye_position(&camera_to_world),
        })
    }

    /// Builds a frame from a rendered view with full depth coverage.
    ///
    /// `world_to_camera` uses the render convention directly. Used for synthetic captures.
    pub fn from_view(index: usize, image: RgbImage, world_to_camera: Matrix4<f32>) -> Result<Self> {
        let name = frame_name(index);
        let camera_to_world = world_to_camera
            .try_inverse()
            .ok_or_else(|| EstimateError::malformed(format!("{name}: view is not invertible")))?;
        let edges = sobel_edge_mask(&image, EDGE_THRESHOLD);
        let sky = RgbaImage::new(image.width(), image.height());
        Ok(Self {
            index,
            name,
            original: image.clone(),
            rgb: image,
            sky,
            edges,
            world_to_camera,
            camera_to_world,
            eye: eye_position(&camera_to_world),
        })
    }

    pub fn width(&self) -> usize {
        self.rgb.width() as usize
    }

    pub fn height(&self) -> usize {
        self.rgb.height() as usize
    }

    /// World-space viewing direction.
    pub fn optical_axis(&self) -> Vector3<f32> {
        transform_vector(&self.camera_to_world, &Vector3::new(0.0, 0.0, -1.0)).normalize()
    }
}

/// Masked RGBA image: color and alpha 1 where depth is absent, zero where it is present.
/// The invalid border columns are zeroed entirely.
pub fn sky_image(rgb: &RgbImage, depth: &DepthImage) -> RgbaImage {
    let width = rgb.width() as usize;
    RgbaImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let column = x as usize;
        let on_border =
            column < INVALID_LEFT_COLUMNS || column + INVALID_RIGHT_COLUMNS >= width;
        if on_border || depth.get_pixel(x, y).0[0] != 0 {
            image::Rgba([0, 0, 0, 0])
        } else {
            let [r, g, b] = rgb.get_pixel(x, y).0;
            image::Rgba([r, g, b, 1])
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::math::transform::TransformFactory;

    #[test]
    fn sky_image_masks_depth_and_borders() {
        let rgb = RgbImage::from_pixel(200, 2, image::Rgb([10, 20, 30]));
        let mut depth = DepthImage::new(200, 2);
        depth.put_pixel(100, 0, Luma([1200]));

        let sky = sky_image(&rgb, &depth);
        assert_eq!(sky.get_pixel(100, 1).0, [10, 20, 30, 1]);
        assert_eq!(sky.get_pixel(100, 0).0, [0, 0, 0, 0]);
        assert_eq!(sky.get_pixel(91, 1).0, [0, 0, 0, 0]);
        assert_eq!(sky.get_pixel(92, 1).0[3], 1);
        assert_eq!(sky.get_pixel(109, 1).0[3], 1);
        assert_eq!(sky.get_pixel(110, 1).0, [0, 0, 0, 0]);
    }

    #[test]
    fn capture_frame_extrinsics() {
        let rgb = RgbImage::from_pixel(4, 3, image::Rgb([64, 64, 64]));
        let depth = DepthImage::from_pixel(4, 3, Luma([500]));
        let pose = TransformFactory::translation(&Vector3::new(0.0, 1.0, 0.0));
        let frame = Frame::from_capture(7, rgb, &depth, &pose, true).unwrap();
        assert_eq!(frame.name, "frame-000007");
        assert_eq!(frame.eye, Point3::new(0.0, 1.0, 0.0));
        assert!(frame.rgb.get_pixel(0, 0).0[0] > 64);
        assert_eq!(frame.original.get_pixel(0, 0).0[0], 64);
        // Device +Z forward becomes the optical axis.
        assert!((frame.optical_axis() - Vector3::z()).norm() < 1e-6);
    }

    #[test]
    fn mismatched_depth_is_malformed() {
        let rgb = RgbImage::new(4, 3);
        let depth = DepthImage::new(2, 2);
        let err = Frame::from_capture(0, rgb, &depth, &Matrix4::identity(), false).unwrap_err();
        assert!(matches!(err, EstimateError::MalformedCapture(_)));
    }
}
