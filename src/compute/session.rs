use crate::compute::buffer::{Bindings, Buffer, BufferKind};
use crate::compute::kernel::{Kernel, KernelProgram, ScatterKernel, WORKGROUP_SIZE};
use crate::error::{EstimateError, Result};
use log::debug;
use rayon::prelude::*;
use std::time::Instant;

/// A loaded kernel plus its bound buffers.
///
/// Dropping the session releases every buffer, on success and on error paths alike.
pub struct ComputeSession<K: KernelProgram> {
    kernel: K,
    bindings: Bindings,
    dispatches: usize,
    started: Instant,
}

impl<K: KernelProgram> ComputeSession<K> {
    pub fn load(kernel: K) -> Self {
        debug!("Loading compute kernel '{}'", K::NAME);
        Self {
            kernel,
            bindings: Bindings::default(),
            dispatches: 0,
            started: Instant::now(),
        }
    }

    /// Binds a buffer, replacing whatever was bound to the slot.
    pub fn set_data(&mut self, binding: u32, buffer: impl Into<Buffer>) {
        self.bindings.slots.insert(binding, buffer.into());
    }

    /// Reads a bound `f32` or accumulation buffer back.
    pub fn get_data_f32(&self, binding: u32) -> Result<Vec<f32>> {
        self.bindings
            .get(binding)
            .ok_or_else(|| self.error(format!("binding {binding} is empty")))?
            .to_f32()
            .ok_or_else(|| self.error(format!("binding {binding} does not hold f32 data")))
    }

    fn error(&self, message: String) -> EstimateError {
        EstimateError::Kernel {
            kernel: K::NAME,
            message,
        }
    }

    fn validate_inputs(&self) -> Result<K::Uniforms> {
        for &(binding, kind) in K::INPUTS {
            match self.bindings.get(binding) {
                None => return Err(self.error(format!("binding {binding} is not set"))),
                Some(buffer) if buffer.kind() != kind => {
                    return Err(self.error(format!(
                        "binding {binding} holds {:?}, expected {kind:?}",
                        buffer.kind()
                    )));
                }
                Some(_) => {}
            }
        }
        self.kernel
            .uniforms(&self.bindings)
            .map_err(|message| self.error(message))
    }
}

impl<K: Kernel> ComputeSession<K> {
    /// Dispatches `workgroups × WORKGROUP_SIZE` invocations, clipped to the output length.
    pub fn start_compute(&mut self, workgroups: usize) -> Result<()> {
        let uniforms = self.validate_inputs()?;
        let mut output = match self.bindings.slots.remove(&K::OUTPUT) {
            Some(Buffer::F32(v)) if v.len() % K::STRIDE == 0 => v,
            Some(other) => {
                let message = format!(
                    "output binding {} must be f32 with a multiple of {} values",
                    K::OUTPUT,
                    K::STRIDE
                );
                self.bindings.slots.insert(K::OUTPUT, other);
                return Err(self.error(message));
            }
            None => return Err(self.error(format!("output binding {} is not set", K::OUTPUT))),
        };

        let invocations = (workgroups * WORKGROUP_SIZE).min(output.len() / K::STRIDE);
        let kernel = &self.kernel;
        let bindings = &self.bindings;
        output[..invocations * K::STRIDE]
            .par_chunks_mut(K::STRIDE)
            .enumerate()
            .for_each(|(gid, record)| kernel.invoke(gid, &uniforms, bindings, record));

        self.bindings.slots.insert(K::OUTPUT, Buffer::F32(output));
        self.dispatches += 1;
        Ok(())
    }
}

impl<K: ScatterKernel> ComputeSession<K> {
    /// Dispatches `workgroups × WORKGROUP_SIZE` invocations, clipped to what the inputs need.
    pub fn start_scatter(&mut self, workgroups: usize) -> Result<()> {
        let uniforms = self.validate_inputs()?;
        let kernel = &self.kernel;
        let bindings = &self.bindings;
        let invocations = (workgroups * WORKGROUP_SIZE).min(kernel.invocations(&uniforms, bindings));
        (0..invocations)
            .into_par_iter()
            .for_each(|gid| kernel.invoke(gid, &uniforms, bindings));
        self.dispatches += 1;
        Ok(())
    }
}

impl<K: KernelProgram> Drop for ComputeSession<K> {
    fn drop(&mut self) {
        let buffers = self.bindings.slots.len();
        self.bindings.slots.clear();
        debug!(
            "Released kernel '{}' ({} dispatches, {} buffers) after {:.2?}",
            K::NAME,
            self.dispatches,
            buffers,
            self.started.elapsed()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::kernel::workgroups_for;
    use std::sync::atomic::Ordering;

    /// Doubles its input and adds a uniform offset.
    struct Doubler;

    impl KernelProgram for Doubler {
        const NAME: &'static str = "Doubler";
        const INPUTS: &'static [(u32, BufferKind)] = &[(1, BufferKind::F32), (2, BufferKind::F32)];
        type Uniforms = f32;

        fn uniforms(&self, bindings: &Bindings) -> std::result::Result<f32, String> {
            bindings
                .f32(2)
                .first()
                .copied()
                .ok_or_else(|| "missing offset".to_string())
        }
    }

    impl Kernel for Doubler {
        const OUTPUT: u32 = 3;
        const STRIDE: usize = 1;

        fn invoke(&self, gid: usize, offset: &f32, bindings: &Bindings, out: &mut [f32]) {
            out[0] = bindings.f32(1)[gid] * 2.0 + offset;
        }
    }

    /// Counts values per bucket.
    struct Histogram;

    impl KernelProgram for Histogram {
        const NAME: &'static str = "Histogram";
        const INPUTS: &'static [(u32, BufferKind)] = &[(1, BufferKind::U32), (2, BufferKind::Accum)];
        type Uniforms = ();

        fn uniforms(&self, _: &Bindings) -> std::result::Result<(), String> {
            Ok(())
        }
    }

    impl ScatterKernel for Histogram {
        fn invocations(&self, _: &(), bindings: &Bindings) -> usize {
            bindings.u32(1).len()
        }

        fn invoke(&self, gid: usize, _: &(), bindings: &Bindings) {
            let bucket = bindings.u32(1)[gid] as usize;
            bindings.accum(2)[bucket].fetch_add(1.0, Ordering::Relaxed);
        }
    }

    #[test]
    fn map_kernel_bind_dispatch_read() {
        let input: Vec<f32> = (0..300).map(|i| i as f32).collect();
        let mut session = ComputeSession::load(Doubler);
        session.set_data(1, input);
        session.set_data(2, vec![0.5f32]);
        session.set_data(3, vec![-1.0f32; 300]);
        session.start_compute(workgroups_for(300)).unwrap();
        let out = session.get_data_f32(3).unwrap();
        assert_eq!(out[0], 0.5);
        assert_eq!(out[299], 598.5);
    }

    #[test]
    fn workgroups_clip_invocations() {
        let mut session = ComputeSession::load(Doubler);
        session.set_data(1, vec![1.0f32; 300]);
        session.set_data(2, vec![0.0f32]);
        session.set_data(3, vec![-1.0f32; 300]);
        session.start_compute(1).unwrap();
        let out = session.get_data_f32(3).unwrap();
        assert_eq!(out[WORKGROUP_SIZE - 1], 2.0);
        assert_eq!(out[WORKGROUP_SIZE], -1.0);
    }

    #[test]
    fn missing_or_mistyped_bindings_fail() {
        let mut session = ComputeSession::load(Doubler);
        session.set_data(1, vec![1.0f32]);
        session.set_data(3, vec![0.0f32]);
        assert!(matches!(
            session.start_compute(1),
            Err(EstimateError::Kernel { kernel: "Doubler", .. })
        ));

        session.set_data(2, vec![7u32]);
        let err = session.start_compute(1).unwrap_err();
        assert!(err.to_string().contains("expected F32"));
        assert!(session.get_data_f32(9).is_err());
    }

    #[test]
    fn scatter_kernel_accumulates() {
        let mut session = ComputeSession::load(Histogram);
        session.set_data(1, vec![0u32, 2, 2, 1, 2]);
        session.set_data(2, Buffer::accumulator(3));
        session.start_scatter(workgroups_for(5)).unwrap();
        assert_eq!(session.get_data_f32(2).unwrap(), vec![1.0, 1.0, 3.0]);
    }
}
