pub mod camera;
pub mod frame;
pub mod light;
pub mod mesh;
