//! The per-channel GPU state the cache reads besides shader code.

use crate::engine_state::{GpuChannelPoolState, TextureDescriptor};
use crate::memory::GpuMemory;

/// GPU address range of a bound uniform buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferBounds {
    pub gpu_va: u64,
    pub size: u64,
}

/// Buffer and texture managers of one GPU channel.
pub trait GpuChannel {
    fn memory(&self) -> &dyn GpuMemory;

    /// Uniform buffer bound at `index` for a graphics stage, or the compute engine when `is_compute`.
    fn uniform_buffer_bounds(&self, is_compute: bool, stage_index: usize, index: u32) -> BufferBounds;

    /// Bitmask of enabled uniform buffer slots.
    fn uniform_buffer_use_mask(&self, is_compute: bool, stage_index: usize) -> u32;

    /// Descriptor at `texture_id` in the pool described by `pool`, `None` when the id is out of range.
    fn texture_descriptor(
        &self,
        pool: &GpuChannelPoolState,
        texture_id: u32,
    ) -> Option<TextureDescriptor>;

    /// Reads one 32-bit word from a bound uniform buffer. Unbound or unmapped words read as zero.
    fn uniform_buffer_word(
        &self,
        is_compute: bool,
        stage_index: usize,
        index: u32,
        word_offset: u32,
    ) -> u32 {
        let bounds = self.uniform_buffer_bounds(is_compute, stage_index, index);
        let byte_offset = u64::from(word_offset) * 4;
        if bounds.gpu_va == 0 || byte_offset + 4 > bounds.size {
            return 0;
        }
        self.memory()
            .read_u32(bounds.gpu_va + byte_offset)
            .unwrap_or(0)
    }
}
