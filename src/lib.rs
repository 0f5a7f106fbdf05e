//! Offline HDR lighting estimation.
//!
//! A capture folder (RGB-D frames, poses, intrinsics and one mesh reconstruction) goes through
//! correspondence search, exposure calibration, radiance reprojection, panorama rendering and
//! light detection. See [`app::Estimator`] for the stage sequence.

pub mod app;
pub mod compute;
pub mod core;
pub mod error;
pub mod io;
pub mod pipeline;
pub mod raytrace;
pub mod scene;
pub mod solver;

pub use error::{EstimateError, Result};
