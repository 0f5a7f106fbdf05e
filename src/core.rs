pub mod color;
pub mod framebuffer;
pub mod imgproc;
pub mod math;
