use atomic_float::AtomicF32;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

/// A typed buffer bound to a kernel binding slot.
#[derive(Debug)]
pub enum Buffer {
    F32(Vec<f32>),
    U32(Vec<u32>),
    /// Accumulation target for scatter kernels.
    Accum(Vec<AtomicF32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    F32,
    U32,
    Accum,
}

impl Buffer {
    /// Zero-initialized accumulation buffer.
    pub fn accumulator(len: usize) -> Self {
        Buffer::Accum((0..len).map(|_| AtomicF32::new(0.0)).collect())
    }

    pub fn kind(&self) -> BufferKind {
        match self {
            Buffer::F32(_) => BufferKind::F32,
            Buffer::U32(_) => BufferKind::U32,
            Buffer::Accum(_) => BufferKind::Accum,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Buffer::F32(v) => v.len(),
            Buffer::U32(v) => v.len(),
            Buffer::Accum(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads the buffer back as `f32` values.
    pub fn to_f32(&self) -> Option<Vec<f32>> {
        match self {
            Buffer::F32(v) => Some(v.clone()),
            Buffer::Accum(v) => Some(v.iter().map(|a| a.load(Ordering::Relaxed)).collect()),
            Buffer::U32(_) => None,
        }
    }
}

impl From<Vec<f32>> for Buffer {
    fn from(value: Vec<f32>) -> Self {
        Buffer::F32(value)
    }
}

impl From<Vec<u32>> for Buffer {
    fn from(value: Vec<u32>) -> Self {
        Buffer::U32(value)
    }
}

/// Buffers keyed by binding index.
///
/// Accessors return an empty slice for missing or mistyped slots; sessions validate the
/// bindings a kernel declares before dispatching it.
#[derive(Debug, Default)]
pub struct Bindings {
    pub(crate) slots: BTreeMap<u32, Buffer>,
}

impl Bindings {
    pub fn get(&self, binding: u32) -> Option<&Buffer> {
        self.slots.get(&binding)
    }

    pub fn f32(&self, binding: u32) -> &[f32] {
        match self.slots.get(&binding) {
            Some(Buffer::F32(v)) => v,
            _ => &[],
        }
    }

    pub fn u32(&self, binding: u32) -> &[u32] {
        match self.slots.get(&binding) {
            Some(Buffer::U32(v)) => v,
            _ => &[],
        }
    }

    pub fn accum(&self, binding: u32) -> &[AtomicF32] {
        match self.slots.get(&binding) {
            Some(Buffer::Accum(v)) => v,
            _ => &[],
        }
    }
}
