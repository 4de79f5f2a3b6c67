//! The translator's view of the GPU.
//!
//! Every query that can change the generated code is recorded in the
//! specialization state under construction. Two sources exist: the live GPU
//! channel during normal operation and a recorded specialization state when
//! programs are rebuilt from the disk cache.

use std::sync::Arc;

use crate::channel::GpuChannel;
use crate::config::HostCapabilities;
use crate::engine_state::{
    AttributeType, CompareOp, GpuChannelPoolState, PrimitiveTopology, TextureDescriptor,
    TextureTarget,
};
use crate::hash_table::DataAccessor;
use crate::memory::ShaderCodeAccessor;
use crate::program::CachedShaderStage;
use crate::resources::{BindingAllocator, ResourceCounts, ResourceReservations, SetBindingPair};
use crate::specialization::{resolve_texture_id, ShaderSpecializationState, TextureKey};

/// State shared by both accessor kinds.
pub struct GpuAccessorBase<'a> {
    caps: &'a HostCapabilities,
    counts: &'a mut ResourceCounts,
    reservations: ResourceReservations,
    stage_index: usize,
    is_compute: bool,
    spec: &'a mut ShaderSpecializationState,
}

impl<'a> GpuAccessorBase<'a> {
    pub fn new(
        caps: &'a HostCapabilities,
        counts: &'a mut ResourceCounts,
        reservations: ResourceReservations,
        stage_index: usize,
        spec: &'a mut ShaderSpecializationState,
    ) -> Self {
        let is_compute = spec.is_compute();
        Self {
            caps,
            counts,
            reservations,
            stage_index,
            is_compute,
            spec,
        }
    }

    /// Retargets the accessor at another stage of the same program.
    pub fn set_stage_index(&mut self, stage_index: usize) {
        self.stage_index = stage_index;
    }

    pub fn set_reservations(&mut self, reservations: ResourceReservations) {
        self.reservations = reservations;
    }

    pub fn specialization(&mut self) -> &mut ShaderSpecializationState {
        &mut *self.spec
    }

    pub fn binding_allocator(&mut self) -> BindingAllocator<'_> {
        BindingAllocator::new(self.caps, &mut *self.counts, self.reservations, self.stage_index)
    }
}

pub trait GpuAccessor {
    fn base(&self) -> &GpuAccessorBase<'_>;

    /// Specialization state being recorded for the current program.
    fn specialization(&mut self) -> &mut ShaderSpecializationState;

    fn binding_allocator(&mut self) -> BindingAllocator<'_>;

    /// Up to `len` bytes of guest code starting at `address`.
    fn read_code(&mut self, address: u64, len: usize) -> Vec<u8>;

    /// Word at `byte_offset` of constant buffer 1 of the current stage.
    fn constant_buffer1_word(&mut self, byte_offset: u32) -> u32;

    /// Bitmask of enabled constant buffers for the current stage.
    fn query_constant_buffer_use(&mut self) -> u32;

    fn query_texture_array_length_from_buffer(&mut self, slot: u32) -> u32;

    fn query_texture_array_length_from_pool(&mut self, is_sampler: bool) -> u32;

    /// Descriptor the handle refers to, `None` when it resolves to nothing.
    fn lookup_texture_descriptor(&mut self, handle: i32, cbuf_slot: i32) -> Option<TextureDescriptor>;

    fn host_capabilities(&self) -> &HostCapabilities {
        self.base().caps
    }

    fn stage_index(&self) -> usize {
        self.base().stage_index
    }

    fn is_compute(&self) -> bool {
        self.base().is_compute
    }

    fn reservations(&self) -> ResourceReservations {
        self.base().reservations
    }

    fn query_compute_local_size(&mut self) -> (u32, u32, u32) {
        let spec = self.specialization();
        spec.record_compute_local_size();
        let state = spec.compute_state();
        (state.local_size_x, state.local_size_y, state.local_size_z)
    }

    /// Local and shared memory sizes in bytes.
    fn query_compute_memory_sizes(&mut self) -> (u32, u32) {
        let spec = self.specialization();
        spec.record_compute_memory_size();
        let state = spec.compute_state();
        (state.local_memory_size, state.shared_memory_size)
    }

    fn query_primitive_topology(&mut self) -> PrimitiveTopology {
        let spec = self.specialization();
        spec.record_primitive_topology();
        spec.graphics_state().topology
    }

    fn query_tessellation_mode(&mut self) -> u32 {
        self.specialization().graphics_state().tessellation_mode
    }

    /// Compare op and reference when alpha testing is enabled.
    fn query_alpha_test(&mut self) -> Option<(CompareOp, f32)> {
        let spec = self.specialization();
        spec.record_alpha_test();
        let state = spec.graphics_state();
        state
            .alpha_test_enable
            .then_some((state.alpha_test_compare, state.alpha_test_reference))
    }

    fn query_attribute_type(&mut self, location: usize) -> AttributeType {
        self.specialization()
            .graphics_state()
            .attribute_types
            .get(location)
            .copied()
            .unwrap_or_default()
    }

    fn query_fragment_output_type(&mut self, location: usize) -> AttributeType {
        self.specialization()
            .graphics_state()
            .fragment_output_types
            .get(location)
            .copied()
            .unwrap_or_default()
    }

    fn query_early_z_force(&mut self) -> bool {
        self.specialization().graphics_state().early_z_force
    }

    /// Fixed point size, `None` when the shader writes its own.
    fn query_program_point_size(&mut self) -> Option<f32> {
        let state = self.specialization().graphics_state();
        (!state.program_point_size_enable).then_some(state.point_size)
    }

    fn query_has_constant_buffer_draw_parameters(&mut self) -> bool {
        self.specialization()
            .graphics_state()
            .has_constant_buffer_draw_parameters
    }

    fn query_has_unaligned_storage_buffer(&mut self) -> bool {
        let spec = self.specialization();
        if spec.is_compute() {
            spec.compute_state().has_unaligned_storage_buffer
        } else {
            spec.graphics_state().has_unaligned_storage_buffer
        }
    }

    fn query_dual_source_blend_enable(&mut self) -> bool {
        self.specialization().graphics_state().dual_source_blend_enable
    }

    fn query_y_negate_enabled(&mut self) -> bool {
        self.specialization().graphics_state().y_negate_enabled
    }

    fn query_viewport_transform_disable(&mut self) -> bool {
        self.specialization().graphics_state().viewport_transform_disable
    }

    /// Depth range is `[-1, 1]`.
    fn query_depth_mode(&mut self) -> bool {
        self.specialization().graphics_state().depth_mode
    }

    fn query_alpha_to_coverage_dither_enable(&mut self) -> bool {
        let state = self.specialization().graphics_state();
        state.alpha_to_coverage_enable && state.alpha_to_coverage_dither_enable
    }

    fn query_transform_feedback_enabled(&mut self) -> bool {
        self.specialization().transform_feedback().is_some()
    }

    fn query_transform_feedback_varying_locations(&mut self, buffer_index: usize) -> Vec<u8> {
        self.specialization()
            .transform_feedback()
            .and_then(|tf| tf.get(buffer_index))
            .map(|d| d.locations().to_vec())
            .unwrap_or_default()
    }

    fn query_transform_feedback_stride(&mut self, buffer_index: usize) -> u32 {
        self.specialization()
            .transform_feedback()
            .and_then(|tf| tf.get(buffer_index))
            .map_or(0, |d| d.stride)
    }

    fn query_texture_format(&mut self, handle: i32, cbuf_slot: i32) -> (u32, bool) {
        let stage = self.stage_index();
        self.specialization()
            .record_texture_format(stage, handle, cbuf_slot);
        let descriptor = self.texture_descriptor(handle, cbuf_slot);
        (descriptor.format, descriptor.srgb)
    }

    fn query_sampler_type(&mut self, handle: i32, cbuf_slot: i32) -> TextureTarget {
        let stage = self.stage_index();
        self.specialization()
            .record_texture_sampler_type(stage, handle, cbuf_slot);
        self.texture_descriptor(handle, cbuf_slot).target
    }

    fn query_texture_coord_normalized(&mut self, handle: i32, cbuf_slot: i32) -> bool {
        let stage = self.stage_index();
        self.specialization()
            .record_texture_coord_normalized(stage, handle, cbuf_slot);
        self.texture_descriptor(handle, cbuf_slot).coord_normalized
    }

    /// Looks up the descriptor and records the values seen.
    fn texture_descriptor(&mut self, handle: i32, cbuf_slot: i32) -> TextureDescriptor {
        let stage = self.stage_index();
        match self.lookup_texture_descriptor(handle, cbuf_slot) {
            Some(descriptor) => {
                self.specialization()
                    .register_texture(stage, handle, cbuf_slot, &descriptor);
                descriptor
            }
            None => TextureDescriptor::default(),
        }
    }

    fn create_constant_buffer_binding(&mut self, index: u32) -> SetBindingPair {
        self.binding_allocator().create_constant_buffer_binding(index)
    }

    fn create_storage_buffer_binding(&mut self, index: u32) -> SetBindingPair {
        self.binding_allocator().create_storage_buffer_binding(index)
    }

    fn create_texture_binding(&mut self, count: u32, is_buffer: bool) -> SetBindingPair {
        self.binding_allocator().create_texture_binding(count, is_buffer)
    }

    fn create_image_binding(&mut self, count: u32, is_buffer: bool) -> SetBindingPair {
        self.binding_allocator().create_image_binding(count, is_buffer)
    }
}

/// Accessor backed by the live GPU channel.
pub struct ChannelGpuAccessor<'a> {
    base: GpuAccessorBase<'a>,
    channel: &'a dyn GpuChannel,
    pool: GpuChannelPoolState,
}

impl<'a> ChannelGpuAccessor<'a> {
    pub fn new(
        base: GpuAccessorBase<'a>,
        channel: &'a dyn GpuChannel,
        pool: GpuChannelPoolState,
    ) -> Self {
        Self {
            base,
            channel,
            pool,
        }
    }
}

impl GpuAccessor for ChannelGpuAccessor<'_> {
    fn base(&self) -> &GpuAccessorBase<'_> {
        &self.base
    }

    fn specialization(&mut self) -> &mut ShaderSpecializationState {
        self.base.specialization()
    }

    fn binding_allocator(&mut self) -> BindingAllocator<'_> {
        self.base.binding_allocator()
    }

    fn read_code(&mut self, address: u64, len: usize) -> Vec<u8> {
        ShaderCodeAccessor::new(self.channel.memory(), address)
            .get_span(0, len)
            .to_vec()
    }

    fn constant_buffer1_word(&mut self, byte_offset: u32) -> u32 {
        self.channel.uniform_buffer_word(
            self.base.is_compute,
            self.base.stage_index,
            1,
            byte_offset / 4,
        )
    }

    fn query_constant_buffer_use(&mut self) -> u32 {
        let stage = self.base.stage_index;
        let mask = self
            .channel
            .uniform_buffer_use_mask(self.base.is_compute, stage);
        self.base.spec.record_constant_buffer_use(stage, mask);
        mask
    }

    fn query_texture_array_length_from_buffer(&mut self, slot: u32) -> u32 {
        let stage = self.base.stage_index;
        let bounds = self
            .channel
            .uniform_buffer_bounds(self.base.is_compute, stage, slot);
        let length = (bounds.size / 4) as u32;
        self.base
            .spec
            .register_texture_array_length_from_buffer(stage, 0, slot as i32, length);
        length
    }

    fn query_texture_array_length_from_pool(&mut self, is_sampler: bool) -> u32 {
        let maximum_id = if is_sampler {
            self.pool.sampler_pool_maximum_id
        } else {
            self.pool.texture_pool_maximum_id
        };
        let length = maximum_id.saturating_add(1);
        self.base
            .spec
            .register_texture_array_length_from_pool(is_sampler, length);
        length
    }

    fn lookup_texture_descriptor(&mut self, handle: i32, cbuf_slot: i32) -> Option<TextureDescriptor> {
        let key = TextureKey::new(self.base.stage_index, handle, cbuf_slot);
        let texture_id = resolve_texture_id(self.channel, &self.pool, self.base.is_compute, &key);
        self.channel.texture_descriptor(&self.pool, texture_id)
    }
}

/// Accessors that follow translation through every stage of one program.
pub trait ProgramGpuAccessor: GpuAccessor {
    /// Selects stage slot `slot`: 0 is compute or vertex A, 1 to 5 are vertex B through fragment.
    fn select_stage(&mut self, slot: usize);

    fn set_reservations(&mut self, reservations: ResourceReservations);
}

fn slot_stage_index(slot: usize) -> usize {
    slot.saturating_sub(1)
}

impl ProgramGpuAccessor for ChannelGpuAccessor<'_> {
    fn select_stage(&mut self, slot: usize) {
        self.base.set_stage_index(slot_stage_index(slot));
    }

    fn set_reservations(&mut self, reservations: ResourceReservations) {
        self.base.set_reservations(reservations);
    }
}

/// Accessor that replays the values recorded when a program was first
/// translated, for rebuilding programs from the disk cache.
pub struct DiskCacheGpuAccessor<'a> {
    base: GpuAccessorBase<'a>,
    stages: &'a [Option<Arc<CachedShaderStage>>],
    slot: usize,
    old_spec: &'a ShaderSpecializationState,
}

impl<'a> DiskCacheGpuAccessor<'a> {
    pub fn new(
        base: GpuAccessorBase<'a>,
        stages: &'a [Option<Arc<CachedShaderStage>>],
        old_spec: &'a ShaderSpecializationState,
    ) -> Self {
        Self {
            base,
            stages,
            slot: 0,
            old_spec,
        }
    }

    fn current(&self) -> Option<&CachedShaderStage> {
        self.stages.get(self.slot).and_then(|s| s.as_deref())
    }
}

impl ProgramGpuAccessor for DiskCacheGpuAccessor<'_> {
    fn select_stage(&mut self, slot: usize) {
        self.slot = slot;
        self.base.set_stage_index(slot_stage_index(slot));
    }

    fn set_reservations(&mut self, reservations: ResourceReservations) {
        self.base.set_reservations(reservations);
    }
}

impl GpuAccessor for DiskCacheGpuAccessor<'_> {
    fn base(&self) -> &GpuAccessorBase<'_> {
        &self.base
    }

    fn specialization(&mut self) -> &mut ShaderSpecializationState {
        self.base.specialization()
    }

    fn binding_allocator(&mut self) -> BindingAllocator<'_> {
        self.base.binding_allocator()
    }

    /// `address` is an offset into the stored code.
    fn read_code(&mut self, address: u64, len: usize) -> Vec<u8> {
        let Some(stage) = self.current() else {
            return Vec::new();
        };
        let code = &stage.code[..];
        let start = usize::try_from(address).unwrap_or(usize::MAX).min(code.len());
        let end = start.saturating_add(len).min(code.len());
        code[start..end].to_vec()
    }

    fn constant_buffer1_word(&mut self, byte_offset: u32) -> u32 {
        let start = byte_offset as usize;
        self.current()
            .and_then(|stage| stage.cb1_data.get(start..start.checked_add(4)?))
            .map_or(0, |bytes| {
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
            })
    }

    fn query_constant_buffer_use(&mut self) -> u32 {
        let stage = self.base.stage_index;
        let mask = self.old_spec.constant_buffer_use(stage).unwrap_or(0);
        self.base.spec.record_constant_buffer_use(stage, mask);
        mask
    }

    fn query_texture_array_length_from_buffer(&mut self, slot: u32) -> u32 {
        let stage = self.base.stage_index;
        let length = self
            .old_spec
            .texture_array_length_from_buffer(stage, 0, slot as i32)
            .unwrap_or(0);
        self.base
            .spec
            .register_texture_array_length_from_buffer(stage, 0, slot as i32, length);
        length
    }

    fn query_texture_array_length_from_pool(&mut self, is_sampler: bool) -> u32 {
        let length = self
            .old_spec
            .texture_array_length_from_pool(is_sampler)
            .unwrap_or(0);
        self.base
            .spec
            .register_texture_array_length_from_pool(is_sampler, length);
        length
    }

    fn lookup_texture_descriptor(&mut self, handle: i32, cbuf_slot: i32) -> Option<TextureDescriptor> {
        self.old_spec
            .texture_descriptor(self.base.stage_index, handle, cbuf_slot)
    }
}
