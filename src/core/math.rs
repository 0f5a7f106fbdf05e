pub mod equirect;
pub mod interpolation;
pub mod transform;
