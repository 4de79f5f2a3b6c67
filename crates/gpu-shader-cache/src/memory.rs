//! GPU virtual memory access used to fetch guest shader code.
//!
//! Reads never fail from the cache's point of view: unmapped ranges resolve to
//! empty spans, so hashing and byte-exact comparisons are total over any address.

use core::fmt;
use std::cell::{Ref, RefCell};

use crate::hash_table::DataAccessor;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GpuMemoryError {
    pub gpu_va: u64,
    pub len: usize,
}

impl fmt::Display for GpuMemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gpu memory access is not mapped: gpu_va=0x{:x}, len=0x{:x}",
            self.gpu_va, self.len
        )
    }
}

impl std::error::Error for GpuMemoryError {}

pub trait GpuMemory {
    fn read(&self, gpu_va: u64, dst: &mut [u8]) -> Result<(), GpuMemoryError>;

    /// Returns `len` bytes at `gpu_va`, or an empty vector if any part is unmapped.
    fn get_span(&self, gpu_va: u64, len: usize) -> Vec<u8> {
        self.get_span_mapped(gpu_va, len).unwrap_or_default()
    }

    fn get_span_mapped(&self, gpu_va: u64, len: usize) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read(gpu_va, &mut buf).ok()?;
        Some(buf)
    }

    fn read_u32(&self, gpu_va: u64) -> Option<u32> {
        let mut buf = [0u8; 4];
        self.read(gpu_va, &mut buf).ok()?;
        Some(u32::from_le_bytes(buf))
    }
}

/// Byte-exact comparison of `expected` against live memory at `gpu_va`.
pub fn memory_matches(memory: &dyn GpuMemory, gpu_va: u64, expected: &[u8]) -> bool {
    match memory.get_span_mapped(gpu_va, expected.len()) {
        Some(current) => current == expected,
        None => false,
    }
}

/// Flat memory starting at GPU VA 0. Anything past the end is unmapped.
#[derive(Clone, Debug)]
pub struct VecGpuMemory {
    mem: RefCell<Vec<u8>>,
}

impl VecGpuMemory {
    pub fn new(size_bytes: usize) -> Self {
        Self {
            mem: RefCell::new(vec![0u8; size_bytes]),
        }
    }

    pub fn as_slice(&self) -> Ref<'_, [u8]> {
        Ref::map(self.mem.borrow(), |v| v.as_slice())
    }

    pub fn write(&self, gpu_va: u64, data: &[u8]) -> Result<(), GpuMemoryError> {
        let err = GpuMemoryError {
            gpu_va,
            len: data.len(),
        };
        let start = usize::try_from(gpu_va).map_err(|_| err.clone())?;
        let end = start.checked_add(data.len()).ok_or(err.clone())?;
        let mut mem = self.mem.borrow_mut();
        let slice = mem.get_mut(start..end).ok_or(err)?;
        slice.copy_from_slice(data);
        Ok(())
    }
}

impl GpuMemory for VecGpuMemory {
    fn read(&self, gpu_va: u64, dst: &mut [u8]) -> Result<(), GpuMemoryError> {
        let err = GpuMemoryError {
            gpu_va,
            len: dst.len(),
        };
        let start = usize::try_from(gpu_va).map_err(|_| err.clone())?;
        let end = start.checked_add(dst.len()).ok_or(err.clone())?;
        let mem = self.mem.borrow();
        let slice = mem.get(start..end).ok_or(err)?;
        dst.copy_from_slice(slice);
        Ok(())
    }
}

const CODE_READ_CHUNK: usize = 0x100;

/// Lazily pulls shader code out of GPU memory as a hash table lookup asks for
/// longer prefixes. Reading stops at the first unmapped chunk.
pub struct ShaderCodeAccessor<'a> {
    memory: &'a dyn GpuMemory,
    gpu_va: u64,
    buf: Vec<u8>,
    exhausted: bool,
}

impl<'a> ShaderCodeAccessor<'a> {
    pub fn new(memory: &'a dyn GpuMemory, gpu_va: u64) -> Self {
        Self {
            memory,
            gpu_va,
            buf: Vec::new(),
            exhausted: false,
        }
    }

    fn read_append(&mut self, len: usize) -> bool {
        let start = self.buf.len();
        let Some(addr) = self.gpu_va.checked_add(start as u64) else {
            return false;
        };
        self.buf.resize(start + len, 0);
        if self.memory.read(addr, &mut self.buf[start..]).is_err() {
            self.buf.truncate(start);
            return false;
        }
        true
    }

    fn fill_to(&mut self, len: usize) {
        if self.exhausted || self.buf.len() >= len {
            return;
        }
        let want = (len - self.buf.len()).max(CODE_READ_CHUNK);
        if self.read_append(want) {
            return;
        }

        // Near the end of mapped memory: walk chunk by chunk, then byte by byte.
        while self.buf.len() < len {
            let step = CODE_READ_CHUNK.min(len - self.buf.len());
            if !self.read_append(step) {
                let chunk_end = self.buf.len() + step;
                while self.buf.len() < chunk_end && self.read_append(1) {}
                self.exhausted = true;
                return;
            }
        }
    }
}

impl DataAccessor for ShaderCodeAccessor<'_> {
    fn get_span(&mut self, offset: usize, len: usize) -> &[u8] {
        let end = offset.saturating_add(len);
        self.fill_to(end);
        let end = end.min(self.buf.len());
        let start = offset.min(end);
        &self.buf[start..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_span_is_empty() {
        let mem = VecGpuMemory::new(0x100);
        assert!(mem.get_span(0xF0, 0x20).is_empty());
        assert_eq!(mem.get_span_mapped(0xF0, 0x20), None);
        assert_eq!(mem.get_span(0xF0, 0x10).len(), 0x10);
    }

    #[test]
    fn memory_matches_is_byte_exact() {
        let mem = VecGpuMemory::new(0x100);
        mem.write(0x10, &[1, 2, 3, 4]).unwrap();
        assert!(memory_matches(&mem, 0x10, &[1, 2, 3, 4]));
        assert!(!memory_matches(&mem, 0x10, &[1, 2, 3, 5]));
        assert!(!memory_matches(&mem, 0xFE, &[0, 0, 0, 0]));
    }

    #[test]
    fn code_accessor_stops_at_unmapped_memory() {
        let mem = VecGpuMemory::new(0x180);
        mem.write(0x100, &[7u8; 0x80]).unwrap();
        let mut accessor = ShaderCodeAccessor::new(&mem, 0x100);
        assert_eq!(accessor.get_span(0, 0x40), &[7u8; 0x40][..]);
        assert_eq!(accessor.get_span(0, 0x200).len(), 0x80);
        assert!(accessor.get_span(0x300, 4).is_empty());
    }
}
