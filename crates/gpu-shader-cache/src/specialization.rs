//! Dependency tracking for translated shaders.
//!
//! While a shader is translated, every engine fact the translator asks for is
//! recorded here together with the value it saw. A cached program is reused
//! only when the recorded facts still hold for the current draw or dispatch.
//! Facts that were never queried are never compared.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

use bitflags::bitflags;
use hashbrown::HashMap;

use crate::channel::GpuChannel;
use crate::codec::{FieldReader, FieldWriter, ReadLeExt, Section, SectionMagic, WriteLeExt};
use crate::config::HostCapabilities;
use crate::engine_state::{
    combine_packed_id, unpack_handle_offsets, unpack_texture_id, unpack_texture_slots,
    GpuChannelComputeState, GpuChannelGraphicsState, GpuChannelPoolState, ProgramPipelineState,
    TextureDescriptor, TextureTarget, TransformFeedbackDescriptor, TOTAL_RENDER_TARGETS,
    TOTAL_VERTEX_ATTRIBS,
};
use crate::error::{DiskCacheLoadError, DiskResult};
use crate::program::{CachedShaderStage, GRAPHICS_STAGES};

bitflags! {
    /// Engine state categories the translator consulted.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct QueriedStateFlags: u32 {
        const PRIMITIVE_TOPOLOGY = 1 << 1;
        const TRANSFORM_FEEDBACK = 1 << 3;
        const TEXTURE_ARRAY_FROM_BUFFER = 1 << 4;
        const TEXTURE_ARRAY_FROM_POOL = 1 << 5;
        const ALPHA_TEST = 1 << 6;
        const COMPUTE_LOCAL_SIZE = 1 << 7;
        const COMPUTE_MEMORY_SIZE = 1 << 8;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct QueriedTextureStateFlags: u32 {
        const TEXTURE_FORMAT = 1 << 0;
        const SAMPLER_TYPE = 1 << 1;
        const COORD_NORMALIZED = 1 << 2;
    }
}

/// Identifies a texture reference made by one stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureKey {
    pub stage_index: i32,
    pub handle: i32,
    pub cbuf_slot: i32,
}

impl TextureKey {
    pub fn new(stage_index: usize, handle: i32, cbuf_slot: i32) -> Self {
        Self {
            stage_index: stage_index as i32,
            handle,
            cbuf_slot,
        }
    }
}

impl Section for TextureKey {
    const MAGIC: SectionMagic = SectionMagic::TEXTURE_KEY;

    fn encode(&self, w: &mut FieldWriter) {
        w.i32(self.stage_index);
        w.i32(self.handle);
        w.i32(self.cbuf_slot);
    }

    fn decode(r: &mut FieldReader<'_>) -> Self {
        Self {
            stage_index: r.i32(),
            handle: r.i32(),
            cbuf_slot: r.i32(),
        }
    }
}

/// Key of a pool derived array length: sampler pool or texture pool.
struct PoolKey(bool);

impl Section for PoolKey {
    const MAGIC: SectionMagic = SectionMagic::TEXTURE_KEY;

    fn encode(&self, w: &mut FieldWriter) {
        w.bool(self.0);
    }

    fn decode(r: &mut FieldReader<'_>) -> Self {
        Self(r.bool())
    }
}

/// Descriptor values observed for one texture reference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TextureSpecializationState {
    pub queried_flags: QueriedTextureStateFlags,
    pub format: u32,
    pub format_srgb: bool,
    pub target: TextureTarget,
    pub coord_normalized: bool,
}

impl TextureSpecializationState {
    fn matches(&self, descriptor: &TextureDescriptor) -> bool {
        let flags = self.queried_flags;
        if flags.contains(QueriedTextureStateFlags::COORD_NORMALIZED)
            && self.coord_normalized != descriptor.coord_normalized
        {
            return false;
        }
        if flags.contains(QueriedTextureStateFlags::TEXTURE_FORMAT)
            && (self.format != descriptor.format || self.format_srgb != descriptor.srgb)
        {
            return false;
        }
        if flags.contains(QueriedTextureStateFlags::SAMPLER_TYPE) && self.target != descriptor.target
        {
            return false;
        }
        true
    }
}

impl Section for TextureSpecializationState {
    const MAGIC: SectionMagic = SectionMagic::TEXTURE_STATE;

    fn encode(&self, w: &mut FieldWriter) {
        w.u32(self.queried_flags.bits());
        w.u32(self.format);
        w.bool(self.format_srgb);
        w.u8(self.target as u8);
        w.bool(self.coord_normalized);
    }

    fn decode(r: &mut FieldReader<'_>) -> Self {
        Self {
            queried_flags: QueriedTextureStateFlags::from_bits_truncate(r.u32()),
            format: r.u32(),
            format_srgb: r.bool(),
            target: TextureTarget::from_u8(r.u8()),
            coord_normalized: r.bool(),
        }
    }
}

/// Stable index of a texture record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureSpecHandle(u32);

/// Options for a graphics match that come from the program rather than the state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GraphicsMatchOptions {
    pub vertex_as_compute: bool,
    pub uses_draw_parameters: bool,
    pub check_textures: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ShaderSpecializationState {
    queried_state: QueriedStateFlags,
    compute: bool,
    compute_state: GpuChannelComputeState,
    graphics_state: GpuChannelGraphicsState,
    pipeline_state: Option<ProgramPipelineState>,
    transform_feedback: Option<Vec<TransformFeedbackDescriptor>>,
    constant_buffer_use_per_stage: u8,
    constant_buffer_use: [u32; GRAPHICS_STAGES],

    textures: Vec<(TextureKey, TextureSpecializationState)>,
    texture_index: HashMap<TextureKey, TextureSpecHandle>,
    array_from_buffer: BTreeMap<TextureKey, u32>,
    array_from_pool: BTreeMap<bool, u32>,

    texture_by_binding: Vec<Vec<Option<TextureSpecHandle>>>,
    image_by_binding: Vec<Vec<Option<TextureSpecHandle>>>,
}

impl ShaderSpecializationState {
    fn empty(compute: bool) -> Self {
        Self {
            queried_state: QueriedStateFlags::empty(),
            compute,
            compute_state: GpuChannelComputeState::default(),
            graphics_state: GpuChannelGraphicsState::default(),
            pipeline_state: None,
            transform_feedback: None,
            constant_buffer_use_per_stage: 0,
            constant_buffer_use: [0; GRAPHICS_STAGES],
            textures: Vec::new(),
            texture_index: HashMap::new(),
            array_from_buffer: BTreeMap::new(),
            array_from_pool: BTreeMap::new(),
            texture_by_binding: Vec::new(),
            image_by_binding: Vec::new(),
        }
    }

    pub fn new_compute(state: GpuChannelComputeState) -> Self {
        Self {
            compute_state: state,
            ..Self::empty(true)
        }
    }

    pub fn new_graphics(
        state: GpuChannelGraphicsState,
        pipeline: Option<ProgramPipelineState>,
        transform_feedback: Option<&[TransformFeedbackDescriptor]>,
    ) -> Self {
        let mut spec = Self {
            graphics_state: state,
            pipeline_state: pipeline,
            ..Self::empty(false)
        };
        if let Some(descriptors) = transform_feedback {
            spec.transform_feedback = Some(descriptors.to_vec());
            spec.queried_state |= QueriedStateFlags::TRANSFORM_FEEDBACK;
        }
        spec
    }

    pub fn is_compute(&self) -> bool {
        self.compute
    }

    pub fn queried_state(&self) -> QueriedStateFlags {
        self.queried_state
    }

    pub fn compute_state(&self) -> &GpuChannelComputeState {
        &self.compute_state
    }

    pub fn graphics_state(&self) -> &GpuChannelGraphicsState {
        &self.graphics_state
    }

    pub fn pipeline_state(&self) -> Option<&ProgramPipelineState> {
        self.pipeline_state.as_ref()
    }

    pub fn transform_feedback(&self) -> Option<&[TransformFeedbackDescriptor]> {
        self.transform_feedback.as_deref()
    }

    pub fn textures(&self) -> impl Iterator<Item = (&TextureKey, &TextureSpecializationState)> {
        self.textures.iter().map(|(k, v)| (k, v))
    }

    pub fn record_primitive_topology(&mut self) {
        self.queried_state |= QueriedStateFlags::PRIMITIVE_TOPOLOGY;
    }

    pub fn record_alpha_test(&mut self) {
        self.queried_state |= QueriedStateFlags::ALPHA_TEST;
    }

    pub fn record_compute_local_size(&mut self) {
        self.queried_state |= QueriedStateFlags::COMPUTE_LOCAL_SIZE;
    }

    pub fn record_compute_memory_size(&mut self) {
        self.queried_state |= QueriedStateFlags::COMPUTE_MEMORY_SIZE;
    }

    pub fn record_constant_buffer_use(&mut self, stage_index: usize, use_mask: u32) {
        if stage_index < GRAPHICS_STAGES {
            self.constant_buffer_use[stage_index] = use_mask;
            self.constant_buffer_use_per_stage |= 1 << stage_index;
        }
    }

    pub fn constant_buffer_use(&self, stage_index: usize) -> Option<u32> {
        if stage_index < GRAPHICS_STAGES && self.constant_buffer_use_per_stage & (1 << stage_index) != 0
        {
            Some(self.constant_buffer_use[stage_index])
        } else {
            None
        }
    }

    fn texture_record(&mut self, key: TextureKey) -> &mut TextureSpecializationState {
        let handle = match self.texture_index.get(&key) {
            Some(handle) => *handle,
            None => {
                let handle = TextureSpecHandle(self.textures.len() as u32);
                self.textures.push((key, TextureSpecializationState::default()));
                self.texture_index.insert(key, handle);
                handle
            }
        };
        &mut self.textures[handle.0 as usize].1
    }

    fn texture_state(&self, key: &TextureKey) -> Option<&TextureSpecializationState> {
        let handle = self.texture_index.get(key)?;
        Some(&self.textures[handle.0 as usize].1)
    }

    /// Stores the descriptor values seen for a texture reference.
    pub fn register_texture(
        &mut self,
        stage_index: usize,
        handle: i32,
        cbuf_slot: i32,
        descriptor: &TextureDescriptor,
    ) {
        let state = self.texture_record(TextureKey::new(stage_index, handle, cbuf_slot));
        state.format = descriptor.format;
        state.format_srgb = descriptor.srgb;
        state.target = descriptor.target;
        state.coord_normalized = descriptor.coord_normalized;
    }

    pub fn record_texture_format(&mut self, stage_index: usize, handle: i32, cbuf_slot: i32) {
        self.texture_record(TextureKey::new(stage_index, handle, cbuf_slot))
            .queried_flags |= QueriedTextureStateFlags::TEXTURE_FORMAT;
    }

    pub fn record_texture_sampler_type(&mut self, stage_index: usize, handle: i32, cbuf_slot: i32) {
        self.texture_record(TextureKey::new(stage_index, handle, cbuf_slot))
            .queried_flags |= QueriedTextureStateFlags::SAMPLER_TYPE;
    }

    pub fn record_texture_coord_normalized(
        &mut self,
        stage_index: usize,
        handle: i32,
        cbuf_slot: i32,
    ) {
        self.texture_record(TextureKey::new(stage_index, handle, cbuf_slot))
            .queried_flags |= QueriedTextureStateFlags::COORD_NORMALIZED;
    }

    pub fn register_texture_array_length_from_buffer(
        &mut self,
        stage_index: usize,
        handle: i32,
        cbuf_slot: i32,
        length: u32,
    ) {
        self.array_from_buffer
            .insert(TextureKey::new(stage_index, handle, cbuf_slot), length);
        self.queried_state |= QueriedStateFlags::TEXTURE_ARRAY_FROM_BUFFER;
    }

    pub fn register_texture_array_length_from_pool(&mut self, is_sampler: bool, length: u32) {
        self.array_from_pool.insert(is_sampler, length);
        self.queried_state |= QueriedStateFlags::TEXTURE_ARRAY_FROM_POOL;
    }

    /// Recorded descriptor for a texture reference, if one was registered.
    pub fn texture_descriptor(
        &self,
        stage_index: usize,
        handle: i32,
        cbuf_slot: i32,
    ) -> Option<TextureDescriptor> {
        let state = self.texture_state(&TextureKey::new(stage_index, handle, cbuf_slot))?;
        Some(TextureDescriptor {
            format: state.format,
            srgb: state.format_srgb,
            target: state.target,
            coord_normalized: state.coord_normalized,
        })
    }

    pub fn texture_array_length_from_buffer(
        &self,
        stage_index: usize,
        handle: i32,
        cbuf_slot: i32,
    ) -> Option<u32> {
        self.array_from_buffer
            .get(&TextureKey::new(stage_index, handle, cbuf_slot))
            .copied()
    }

    pub fn texture_array_length_from_pool(&self, is_sampler: bool) -> Option<u32> {
        self.array_from_pool.get(&is_sampler).copied()
    }

    /// Builds the per-binding lookup arrays from each stage's resource list.
    pub fn prepare(&mut self, shaders: &[Option<Arc<CachedShaderStage>>]) {
        let stages = if self.compute { 1 } else { GRAPHICS_STAGES };
        self.texture_by_binding = vec![Vec::new(); stages];
        self.image_by_binding = vec![Vec::new(); stages];

        for info in shaders.iter().flatten().filter_map(|s| s.info.as_ref()) {
            let stage_index = info.stage.stage_index();
            if stage_index >= stages {
                continue;
            }
            let lookup = |handle: i32, cbuf_slot: i32| {
                self.texture_index
                    .get(&TextureKey::new(stage_index, handle, cbuf_slot))
                    .copied()
            };
            let textures = info
                .textures
                .iter()
                .map(|t| lookup(t.handle, t.cbuf_slot))
                .collect();
            let images = info
                .images
                .iter()
                .map(|t| lookup(t.handle, t.cbuf_slot))
                .collect();
            self.texture_by_binding[stage_index] = textures;
            self.image_by_binding[stage_index] = images;
        }
    }

    fn binding_matches(
        &self,
        bindings: &[Vec<Option<TextureSpecHandle>>],
        stage_index: usize,
        index: usize,
        descriptor: &TextureDescriptor,
    ) -> bool {
        match bindings.get(stage_index).and_then(|b| b.get(index)).copied().flatten() {
            Some(handle) => self.textures[handle.0 as usize].1.matches(descriptor),
            None => true,
        }
    }

    /// Checks a texture bound at draw time against what the shader was specialized for.
    pub fn matches_texture(
        &self,
        stage_index: usize,
        index: usize,
        descriptor: &TextureDescriptor,
    ) -> bool {
        self.binding_matches(&self.texture_by_binding, stage_index, index, descriptor)
    }

    pub fn matches_image(
        &self,
        stage_index: usize,
        index: usize,
        descriptor: &TextureDescriptor,
    ) -> bool {
        self.binding_matches(&self.image_by_binding, stage_index, index, descriptor)
    }

    pub fn matches_graphics(
        &self,
        channel: &dyn GpuChannel,
        caps: &HostCapabilities,
        pool: &GpuChannelPoolState,
        graphics: &GpuChannelGraphicsState,
        transform_feedback: Option<&[TransformFeedbackDescriptor]>,
        options: GraphicsMatchOptions,
    ) -> bool {
        let recorded = &self.graphics_state;

        if graphics.viewport_transform_disable != recorded.viewport_transform_disable {
            return false;
        }

        let this_a2c_dither =
            recorded.alpha_to_coverage_enable && recorded.alpha_to_coverage_dither_enable;
        let other_a2c_dither =
            graphics.alpha_to_coverage_enable && graphics.alpha_to_coverage_dither_enable;
        if this_a2c_dither != other_a2c_dither {
            return false;
        }

        if graphics.depth_mode != recorded.depth_mode {
            return false;
        }

        if self.queried_state.contains(QueriedStateFlags::ALPHA_TEST) {
            if graphics.alpha_test_enable != recorded.alpha_test_enable {
                return false;
            }
            if graphics.alpha_test_enable
                && (graphics.alpha_test_compare != recorded.alpha_test_compare
                    || graphics.alpha_test_reference.to_bits()
                        != recorded.alpha_test_reference.to_bits())
            {
                return false;
            }
        }

        if !attribute_types_match(caps, options.vertex_as_compute, recorded, graphics) {
            return false;
        }

        if options.uses_draw_parameters
            && graphics.has_constant_buffer_draw_parameters
                != recorded.has_constant_buffer_draw_parameters
        {
            return false;
        }

        if graphics.has_unaligned_storage_buffer != recorded.has_unaligned_storage_buffer {
            return false;
        }

        if caps.needs_fragment_output_specialization
            && graphics.fragment_output_types[..TOTAL_RENDER_TARGETS]
                != recorded.fragment_output_types[..TOTAL_RENDER_TARGETS]
        {
            return false;
        }

        if graphics.dual_source_blend_enable != recorded.dual_source_blend_enable {
            return false;
        }

        if graphics.y_negate_enabled != recorded.y_negate_enabled {
            return false;
        }

        if self.queried_state.contains(QueriedStateFlags::PRIMITIVE_TOPOLOGY)
            && graphics.topology != recorded.topology
        {
            return false;
        }

        if self.transform_feedback.as_deref() != transform_feedback {
            return false;
        }

        self.matches_common(channel, pool, false, options.check_textures)
    }

    pub fn matches_compute(
        &self,
        channel: &dyn GpuChannel,
        pool: &GpuChannelPoolState,
        compute: &GpuChannelComputeState,
        check_textures: bool,
    ) -> bool {
        let recorded = &self.compute_state;

        if compute.has_unaligned_storage_buffer != recorded.has_unaligned_storage_buffer {
            return false;
        }

        if self.queried_state.contains(QueriedStateFlags::COMPUTE_LOCAL_SIZE)
            && (compute.local_size_x, compute.local_size_y, compute.local_size_z)
                != (
                    recorded.local_size_x,
                    recorded.local_size_y,
                    recorded.local_size_z,
                )
        {
            return false;
        }

        if self.queried_state.contains(QueriedStateFlags::COMPUTE_MEMORY_SIZE)
            && (compute.local_memory_size, compute.shared_memory_size)
                != (recorded.local_memory_size, recorded.shared_memory_size)
        {
            return false;
        }

        self.matches_common(channel, pool, true, check_textures)
    }

    fn matches_common(
        &self,
        channel: &dyn GpuChannel,
        pool: &GpuChannelPoolState,
        is_compute: bool,
        check_textures: bool,
    ) -> bool {
        let mut mask = self.constant_buffer_use_per_stage;
        while mask != 0 {
            let index = mask.trailing_zeros() as usize;
            let use_mask = channel.uniform_buffer_use_mask(is_compute, index);
            if self.constant_buffer_use[index] != use_mask {
                return false;
            }
            mask &= !(1 << index);
        }

        for (key, length) in &self.array_from_buffer {
            let bounds = channel.uniform_buffer_bounds(
                is_compute,
                key.stage_index as usize,
                key.cbuf_slot as u32,
            );
            if (bounds.size / 4) as u32 != *length {
                return false;
            }
        }

        for (is_sampler, length) in &self.array_from_pool {
            let maximum_id = if *is_sampler {
                pool.sampler_pool_maximum_id
            } else {
                pool.texture_pool_maximum_id
            };
            if maximum_id.saturating_add(1) != *length {
                return false;
            }
        }

        if check_textures {
            for (key, state) in &self.textures {
                let texture_id = resolve_texture_id(channel, pool, is_compute, key);
                if let Some(descriptor) = channel.texture_descriptor(pool, texture_id) {
                    if !state.matches(&descriptor) {
                        return false;
                    }
                }
            }
        }

        true
    }

    pub fn write<W: Write + ?Sized>(&self, w: &mut W) -> DiskResult<()> {
        w.write_u32_le(self.queried_state.bits())?;
        w.write_bool(self.compute)?;
        if self.compute {
            w.write_section(&self.compute_state)?;
        } else {
            w.write_section(&self.graphics_state)?;
        }

        w.write_u8(self.constant_buffer_use_per_stage)?;
        let mut mask = self.constant_buffer_use_per_stage;
        while mask != 0 {
            let index = mask.trailing_zeros() as usize;
            w.write_u32_le(self.constant_buffer_use[index])?;
            mask &= !(1 << index);
        }

        w.write_bool(self.pipeline_state.is_some())?;
        if let Some(pipeline) = &self.pipeline_state {
            w.write_section(pipeline)?;
        }

        if self.queried_state.contains(QueriedStateFlags::TRANSFORM_FEEDBACK) {
            let descriptors = self.transform_feedback.as_deref().unwrap_or(&[]);
            w.write_u16_le(count_u16(descriptors.len())?)?;
            for descriptor in descriptors {
                w.write_section(descriptor)?;
            }
        }

        w.write_u16_le(count_u16(self.textures.len())?)?;
        for (key, state) in &self.textures {
            w.write_section(key)?;
            w.write_section(state)?;
        }

        if self.queried_state.contains(QueriedStateFlags::TEXTURE_ARRAY_FROM_BUFFER) {
            w.write_u16_le(count_u16(self.array_from_buffer.len())?)?;
            for (key, length) in &self.array_from_buffer {
                w.write_section(key)?;
                w.write_i32_le(*length as i32)?;
            }
        }

        if self.queried_state.contains(QueriedStateFlags::TEXTURE_ARRAY_FROM_POOL) {
            w.write_u16_le(count_u16(self.array_from_pool.len())?)?;
            for (is_sampler, length) in &self.array_from_pool {
                w.write_section(&PoolKey(*is_sampler))?;
                w.write_i32_le(*length as i32)?;
            }
        }

        Ok(())
    }

    pub fn read<R: Read + ?Sized>(r: &mut R) -> DiskResult<Self> {
        let queried_state = QueriedStateFlags::from_bits_truncate(r.read_u32_le()?);
        let compute = r.read_bool()?;
        let mut spec = Self::empty(compute);
        spec.queried_state = queried_state;
        if compute {
            spec.compute_state = r.read_section()?;
        } else {
            spec.graphics_state = r.read_section()?;
        }

        spec.constant_buffer_use_per_stage = r.read_u8()?;
        if u32::from(spec.constant_buffer_use_per_stage) >> GRAPHICS_STAGES != 0 {
            return Err(DiskCacheLoadError::Corrupt("invalid constant buffer stage mask"));
        }
        let mut mask = spec.constant_buffer_use_per_stage;
        while mask != 0 {
            let index = mask.trailing_zeros() as usize;
            spec.constant_buffer_use[index] = r.read_u32_le()?;
            mask &= !(1 << index);
        }

        if r.read_bool()? {
            spec.pipeline_state = Some(r.read_section()?);
        }

        if queried_state.contains(QueriedStateFlags::TRANSFORM_FEEDBACK) {
            let count = r.read_u16_le()?;
            let descriptors = (0..count)
                .map(|_| r.read_section())
                .collect::<DiskResult<Vec<TransformFeedbackDescriptor>>>()?;
            spec.transform_feedback = Some(descriptors);
        }

        let count = r.read_u16_le()?;
        for _ in 0..count {
            let key: TextureKey = r.read_section()?;
            let state: TextureSpecializationState = r.read_section()?;
            *spec.texture_record(key) = state;
        }

        if queried_state.contains(QueriedStateFlags::TEXTURE_ARRAY_FROM_BUFFER) {
            let count = r.read_u16_le()?;
            for _ in 0..count {
                let key: TextureKey = r.read_section()?;
                let length = r.read_i32_le()?;
                spec.array_from_buffer.insert(key, length as u32);
            }
        }

        if queried_state.contains(QueriedStateFlags::TEXTURE_ARRAY_FROM_POOL) {
            let count = r.read_u16_le()?;
            for _ in 0..count {
                let key: PoolKey = r.read_section()?;
                let length = r.read_i32_le()?;
                spec.array_from_pool.insert(key.0, length as u32);
            }
        }

        Ok(spec)
    }
}

fn count_u16(len: usize) -> DiskResult<u16> {
    u16::try_from(len).map_err(|_| DiskCacheLoadError::Corrupt("too many entries"))
}

fn attribute_types_match(
    caps: &HostCapabilities,
    vertex_as_compute: bool,
    recorded: &GpuChannelGraphicsState,
    current: &GpuChannelGraphicsState,
) -> bool {
    if caps.may_convert_vtg_to_compute() && !vertex_as_compute {
        let scaled = caps.supports_scaled_vertex_formats;
        (0..TOTAL_VERTEX_ATTRIBS).all(|i| {
            recorded.attribute_types[i].filtered(scaled) == current.attribute_types[i].filtered(scaled)
        })
    } else {
        recorded.attribute_types == current.attribute_types
    }
}

/// Reads the texture handle of `key` out of its constant buffer and returns the texture id.
pub fn resolve_texture_id(
    channel: &dyn GpuChannel,
    pool: &GpuChannelPoolState,
    is_compute: bool,
    key: &TextureKey,
) -> u32 {
    let stage_index = key.stage_index.max(0) as usize;
    let (texture_buffer, sampler_buffer) =
        unpack_texture_slots(key.cbuf_slot, pool.texture_buffer_index);
    let (texture_word_offset, sampler_word_offset, handle_type) = unpack_handle_offsets(key.handle);
    let texture_word =
        channel.uniform_buffer_word(is_compute, stage_index, texture_buffer, texture_word_offset);
    let sampler_word =
        channel.uniform_buffer_word(is_compute, stage_index, sampler_buffer, sampler_word_offset);
    unpack_texture_id(combine_packed_id(
        texture_word,
        sampler_word,
        sampler_word_offset,
        handle_type,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::BufferBounds;
    use crate::engine_state::{AttributeType, CompareOp, PrimitiveTopology};
    use crate::memory::{GpuMemory, VecGpuMemory};
    use crate::program::{ShaderProgramInfo, ShaderStage, TextureBinding};
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    struct TestChannel {
        memory: VecGpuMemory,
        use_masks: [u32; GRAPHICS_STAGES],
        texture_buffer: BufferBounds,
        descriptors: Vec<TextureDescriptor>,
    }

    impl TestChannel {
        fn new() -> Self {
            Self {
                memory: VecGpuMemory::new(0x1000),
                use_masks: [0; GRAPHICS_STAGES],
                texture_buffer: BufferBounds {
                    gpu_va: 0x800,
                    size: 0x100,
                },
                descriptors: vec![TextureDescriptor::default(); 4],
            }
        }
    }

    impl GpuChannel for TestChannel {
        fn memory(&self) -> &dyn GpuMemory {
            &self.memory
        }

        fn uniform_buffer_bounds(&self, _: bool, _: usize, index: u32) -> BufferBounds {
            if index == 2 {
                self.texture_buffer
            } else {
                BufferBounds::default()
            }
        }

        fn uniform_buffer_use_mask(&self, _: bool, stage_index: usize) -> u32 {
            self.use_masks[stage_index]
        }

        fn texture_descriptor(
            &self,
            _: &GpuChannelPoolState,
            texture_id: u32,
        ) -> Option<TextureDescriptor> {
            self.descriptors.get(texture_id as usize).copied()
        }
    }

    fn pool() -> GpuChannelPoolState {
        GpuChannelPoolState {
            texture_pool_gpu_va: 0x4000,
            texture_pool_maximum_id: 3,
            sampler_pool_maximum_id: 7,
            texture_buffer_index: 2,
        }
    }

    fn graphics_match(
        spec: &ShaderSpecializationState,
        channel: &TestChannel,
        graphics: &GpuChannelGraphicsState,
    ) -> bool {
        spec.matches_graphics(
            channel,
            &HostCapabilities::vulkan("test"),
            &pool(),
            graphics,
            None,
            GraphicsMatchOptions {
                check_textures: true,
                ..Default::default()
            },
        )
    }

    #[test]
    fn unqueried_alpha_test_never_causes_a_miss() {
        let channel = TestChannel::new();
        let recorded = GpuChannelGraphicsState::default();
        let spec = ShaderSpecializationState::new_graphics(recorded, None, None);

        let current = GpuChannelGraphicsState {
            alpha_test_enable: true,
            alpha_test_compare: CompareOp::Less,
            ..recorded
        };
        assert!(graphics_match(&spec, &channel, &current));
    }

    #[test]
    fn queried_alpha_test_misses_when_enable_differs() {
        let channel = TestChannel::new();
        let recorded = GpuChannelGraphicsState::default();
        let mut spec = ShaderSpecializationState::new_graphics(recorded, None, None);
        spec.record_alpha_test();

        let current = GpuChannelGraphicsState {
            alpha_test_enable: true,
            ..recorded
        };
        assert!(!graphics_match(&spec, &channel, &current));
        assert!(graphics_match(&spec, &channel, &recorded));
    }

    #[test]
    fn topology_compared_only_when_queried() {
        let channel = TestChannel::new();
        let recorded = GpuChannelGraphicsState::default();
        let mut spec = ShaderSpecializationState::new_graphics(recorded, None, None);
        let current = GpuChannelGraphicsState {
            topology: PrimitiveTopology::Points,
            ..recorded
        };
        assert!(graphics_match(&spec, &channel, &current));
        spec.record_primitive_topology();
        assert!(!graphics_match(&spec, &channel, &current));
    }

    #[test]
    fn pipeline_fields_compared_unconditionally() {
        let channel = TestChannel::new();
        let recorded = GpuChannelGraphicsState::default();
        let spec = ShaderSpecializationState::new_graphics(recorded, None, None);
        let current = GpuChannelGraphicsState {
            y_negate_enabled: true,
            ..recorded
        };
        assert!(!graphics_match(&spec, &channel, &current));
    }

    #[test]
    fn attribute_types_filtered_when_stages_may_run_as_compute() {
        let channel = TestChannel::new();
        let recorded = GpuChannelGraphicsState::default();
        let spec = ShaderSpecializationState::new_graphics(recorded, None, None);
        let mut current = recorded;
        current.attribute_types[0] = AttributeType::SSCALED;

        let mut caps = HostCapabilities::vulkan("test");
        let options = GraphicsMatchOptions::default();
        assert!(!spec.matches_graphics(&channel, &caps, &pool(), &current, None, options));

        caps.supports_geometry_shader = false;
        assert!(spec.matches_graphics(&channel, &caps, &pool(), &current, None, options));
    }

    #[test]
    fn constant_buffer_use_checked_per_touched_stage() {
        let mut channel = TestChannel::new();
        let mut spec =
            ShaderSpecializationState::new_graphics(GpuChannelGraphicsState::default(), None, None);
        spec.record_constant_buffer_use(4, 0b11);
        channel.use_masks[4] = 0b11;
        channel.use_masks[0] = 0xff;
        let graphics = GpuChannelGraphicsState::default();
        assert!(graphics_match(&spec, &channel, &graphics));
        channel.use_masks[4] = 0b1;
        assert!(!graphics_match(&spec, &channel, &graphics));
    }

    #[test]
    fn texture_dependency_reresolved_through_pool() {
        let mut channel = TestChannel::new();
        // Handle word 3 of the texture buffer holds texture id 2.
        channel.memory.write(0x800 + 3 * 4, &2u32.to_le_bytes()).unwrap();

        let mut spec =
            ShaderSpecializationState::new_graphics(GpuChannelGraphicsState::default(), None, None);
        spec.register_texture(4, 3, -1, &channel.descriptors[2]);
        spec.record_texture_sampler_type(4, 3, -1);

        let graphics = GpuChannelGraphicsState::default();
        assert!(graphics_match(&spec, &channel, &graphics));

        // Format was never queried, so changing it is fine.
        channel.descriptors[2].format = 0x55;
        assert!(graphics_match(&spec, &channel, &graphics));

        channel.descriptors[2].target = TextureTarget::Texture3D;
        assert!(!graphics_match(&spec, &channel, &graphics));
    }

    #[test]
    fn array_length_from_pool_tracks_maximum_id() {
        let channel = TestChannel::new();
        let mut spec = ShaderSpecializationState::new_compute(GpuChannelComputeState::default());
        spec.register_texture_array_length_from_pool(true, 8);
        let compute = GpuChannelComputeState::default();
        assert!(spec.matches_compute(&channel, &pool(), &compute, true));

        let mut other = pool();
        other.sampler_pool_maximum_id = 15;
        assert!(!spec.matches_compute(&channel, &other, &compute, true));
    }

    #[test]
    fn compute_local_size_compared_when_queried() {
        let channel = TestChannel::new();
        let recorded = GpuChannelComputeState {
            local_size_x: 64,
            local_size_y: 1,
            local_size_z: 1,
            ..Default::default()
        };
        let mut spec = ShaderSpecializationState::new_compute(recorded);
        let current = GpuChannelComputeState {
            local_size_x: 128,
            ..recorded
        };
        assert!(spec.matches_compute(&channel, &pool(), &current, true));
        spec.record_compute_local_size();
        assert!(!spec.matches_compute(&channel, &pool(), &current, true));
        assert!(spec.matches_compute(&channel, &pool(), &recorded, true));
    }

    #[test]
    fn bindings_prepared_from_stage_info() {
        let mut spec =
            ShaderSpecializationState::new_graphics(GpuChannelGraphicsState::default(), None, None);
        let descriptor = TextureDescriptor {
            coord_normalized: false,
            ..Default::default()
        };
        spec.register_texture(4, 0x10, -1, &descriptor);
        spec.record_texture_coord_normalized(4, 0x10, -1);

        let mut info = ShaderProgramInfo::new(ShaderStage::Fragment);
        info.textures.push(TextureBinding {
            handle: 0x20,
            cbuf_slot: -1,
            ..Default::default()
        });
        info.textures.push(TextureBinding {
            handle: 0x10,
            cbuf_slot: -1,
            ..Default::default()
        });
        let stage = CachedShaderStage::new(Some(info), Arc::from(&[0u8][..]), Arc::from(&[][..]));
        spec.prepare(&[None, None, None, None, None, Some(Arc::new(stage))]);

        let normalized = TextureDescriptor::default();
        // Binding 0 was never queried.
        assert!(spec.matches_texture(4, 0, &normalized));
        assert!(!spec.matches_texture(4, 1, &normalized));
        assert!(spec.matches_texture(4, 1, &descriptor));
    }

    #[test]
    fn serialization_roundtrip_preserves_recorded_state() {
        let mut tf = TransformFeedbackDescriptor {
            buffer_index: 1,
            stride: 16,
            varying_count: 4,
            ..Default::default()
        };
        tf.varying_locations[..4].copy_from_slice(&[1, 2, 3, 4]);

        let graphics = GpuChannelGraphicsState {
            topology: PrimitiveTopology::Lines,
            dual_source_blend_enable: true,
            ..Default::default()
        };
        let pipeline = ProgramPipelineState {
            samples_count: 4,
            ..Default::default()
        };
        let mut spec = ShaderSpecializationState::new_graphics(
            graphics,
            Some(pipeline),
            Some(&[tf, TransformFeedbackDescriptor::default()]),
        );
        spec.record_primitive_topology();
        spec.record_constant_buffer_use(0, 0x3);
        spec.record_constant_buffer_use(3, 0x11);
        for handle in 0..3 {
            spec.register_texture(
                4,
                handle,
                -1,
                &TextureDescriptor {
                    format: 0x40 + handle as u32,
                    srgb: handle == 1,
                    target: TextureTarget::Texture2DArray,
                    coord_normalized: handle != 2,
                },
            );
            spec.record_texture_format(4, handle, -1);
        }
        spec.register_texture_array_length_from_buffer(1, 0, 3, 12);
        spec.register_texture_array_length_from_pool(false, 64);

        let mut bytes = Vec::new();
        spec.write(&mut bytes).unwrap();
        let decoded = ShaderSpecializationState::read(&mut Cursor::new(&bytes)).unwrap();

        assert_eq!(decoded.queried_state(), spec.queried_state());
        assert_eq!(decoded.transform_feedback(), spec.transform_feedback());
        assert_eq!(
            decoded.textures().collect::<Vec<_>>(),
            spec.textures().collect::<Vec<_>>()
        );
        assert_eq!(decoded, spec);

        let mut again = Vec::new();
        decoded.write(&mut again).unwrap();
        assert_eq!(again, bytes);
    }

    #[test]
    fn truncated_state_fails_to_read() {
        let spec = ShaderSpecializationState::new_compute(GpuChannelComputeState::default());
        let mut bytes = Vec::new();
        spec.write(&mut bytes).unwrap();
        bytes.truncate(bytes.len() - 1);
        assert!(ShaderSpecializationState::read(&mut Cursor::new(&bytes)).is_err());
    }
}
