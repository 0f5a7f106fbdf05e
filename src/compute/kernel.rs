use crate::compute::buffer::{Bindings, BufferKind};

/// Invocations per workgroup.
pub const WORKGROUP_SIZE: usize = 128;

/// Number of workgroups needed to cover `invocations`.
#[inline]
pub fn workgroups_for(invocations: usize) -> usize {
    invocations.div_ceil(WORKGROUP_SIZE)
}

/// Common description of a kernel program.
///
/// Implementations must be thread-safe (Sync) because invocations run concurrently.
pub trait KernelProgram: Sync {
    /// Program name, used in logs and errors.
    const NAME: &'static str;

    /// Bindings the kernel reads, with their expected buffer kinds.
    const INPUTS: &'static [(u32, BufferKind)];

    /// Per-dispatch constants decoded once from the bound buffers.
    type Uniforms: Sync;

    /// Decodes the uniforms. An `Err` aborts the dispatch.
    fn uniforms(&self, bindings: &Bindings) -> Result<Self::Uniforms, String>;
}

/// A kernel writing one fixed-size `f32` record per invocation.
pub trait Kernel: KernelProgram {
    /// Binding of the `f32` output buffer.
    const OUTPUT: u32;

    /// Output values per invocation.
    const STRIDE: usize;

    /// Runs invocation `gid`, writing its record into `out` (length `STRIDE`).
    fn invoke(&self, gid: usize, uniforms: &Self::Uniforms, bindings: &Bindings, out: &mut [f32]);
}

/// A kernel accumulating into atomic buffers; invocations may hit the same cells.
pub trait ScatterKernel: KernelProgram {
    /// Total invocations the bound inputs call for.
    fn invocations(&self, uniforms: &Self::Uniforms, bindings: &Bindings) -> usize;

    fn invoke(&self, gid: usize, uniforms: &Self::Uniforms, bindings: &Bindings);
}
