//! Data-parallel compute kernels over numbered buffers.
//!
//! A [`ComputeSession`] owns one kernel and its buffer bindings for the duration of a stage:
//! bind inputs, dispatch, read back, and everything is released when the session drops.

pub mod buffer;
pub mod kernel;
pub mod session;

pub use buffer::{Bindings, Buffer, BufferKind};
pub use kernel::{Kernel, KernelProgram, ScatterKernel, WORKGROUP_SIZE, workgroups_for};
pub use session::ComputeSession;
