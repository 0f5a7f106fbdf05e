//! The estimation stages, leaves first: correspondence, exposure, reprojection, panorama and
//! light detection.

pub mod correspondence;
pub mod detector;
pub mod exposure;
pub mod footprint;
pub mod panorama;
pub mod reproject;
pub mod sun;

pub use correspondence::{Selection, VertexPixels, vertex_hitmap};
pub use detector::{Detection, detect_lights};
pub use exposure::{ExposureSolution, MIN_EXPOSURE, solve_exposure};
pub use panorama::{Panorama, render_panorama};
pub use reproject::radiance_reproject;
