//! Equirectangular HDR panorama of the radiance-textured mesh.

use crate::core::framebuffer::FrameBuffer;
use crate::error::{EstimateError, Result};
use crate::io::config::PanoramaConfig;
use crate::raytrace::RenderDevice;
use crate::scene::camera::{CameraSetup, PanoramicCamera};
use crate::scene::frame::Frame;
use crate::scene::mesh::Mesh;
use log::info;
use nalgebra::{Point3, Vector3};
use std::sync::Arc;
use std::time::Instant;

/// Rendered panorama and the point it was rendered from.
#[derive(Debug, Clone)]
pub struct Panorama {
    pub eye: Point3<f32>,
    pub buffer: FrameBuffer,
}

impl Panorama {
    pub fn width(&self) -> usize {
        self.buffer.width
    }

    pub fn height(&self) -> usize {
        self.buffer.height
    }

    pub fn color(&self, x: usize, y: usize) -> Vector3<f32> {
        self.buffer.color_buffer[y * self.buffer.width + x]
    }

    /// Hit distance, `f32::INFINITY` for sky.
    pub fn depth(&self, x: usize, y: usize) -> f32 {
        self.buffer.depth_buffer[y * self.buffer.width + x]
    }
}

/// Frame eye closest to the center of the mesh bounds.
pub fn choose_viewpoint(mesh: &Mesh, frames: &[Frame]) -> Result<Point3<f32>> {
    let center = mesh
        .bounding_box_center()
        .ok_or_else(|| EstimateError::malformed("mesh has no vertices"))?;
    frames
        .iter()
        .map(|f| f.eye)
        .min_by(|a, b| {
            nalgebra::distance_squared(a, &center).total_cmp(&nalgebra::distance_squared(b, &center))
        })
        .ok_or_else(|| EstimateError::malformed("no frames to choose a viewpoint from"))
}

/// Renders the panorama from the best frame viewpoint. `mesh` must carry radiance.
pub fn render_panorama(
    device: &RenderDevice,
    mesh: Arc<Mesh>,
    frames: &[Frame],
    config: &PanoramaConfig,
) -> Result<Panorama> {
    let started = Instant::now();
    let eye = choose_viewpoint(&mesh, frames)?;
    device.set_mesh(mesh)?;
    let buffer = device.render_frame(CameraSetup::Panoramic(PanoramicCamera {
        eye,
        width: config.width,
        height: config.height,
        samples: config.samples,
    }))?;
    info!(
        "Panorama {}x{} ({} samples/pixel) from {:?} rendered in {:.2?}",
        config.width,
        config.height,
        config.samples * config.samples,
        eye,
        started.elapsed()
    );
    Ok(Panorama { eye, buffer })
}
