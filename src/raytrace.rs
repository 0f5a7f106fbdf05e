//! CPU ray casting against the mesh reconstruction.

pub mod bvh;
pub mod device;
pub mod ray;
pub mod raycaster;

pub use device::{RenderDevice, RenderOutput};
pub use raycaster::{HitBuffer, NO_HIT, decode_hit, encode_hit};
