//! Snapshots of GPU engine state that shader translation may depend on.

use crate::codec::{FieldReader, FieldWriter, Section, SectionMagic};

pub const TOTAL_VERTEX_ATTRIBS: usize = 32;
pub const TOTAL_RENDER_TARGETS: usize = 8;
pub const TOTAL_TRANSFORM_FEEDBACK_BUFFERS: usize = 4;
pub const TRANSFORM_FEEDBACK_VARYING_BYTES: usize = 128;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PrimitiveTopology {
    #[default]
    Points = 0,
    Lines,
    LineLoop,
    LineStrip,
    Triangles,
    TriangleStrip,
    TriangleFan,
    Quads,
    QuadStrip,
    Polygon,
    LinesAdjacency,
    LineStripAdjacency,
    TrianglesAdjacency,
    TriangleStripAdjacency,
    Patches,
}

impl PrimitiveTopology {
    pub fn from_u8(v: u8) -> Self {
        use PrimitiveTopology::*;
        match v {
            1 => Lines,
            2 => LineLoop,
            3 => LineStrip,
            4 => Triangles,
            5 => TriangleStrip,
            6 => TriangleFan,
            7 => Quads,
            8 => QuadStrip,
            9 => Polygon,
            10 => LinesAdjacency,
            11 => LineStripAdjacency,
            12 => TrianglesAdjacency,
            13 => TriangleStripAdjacency,
            14 => Patches,
            _ => Points,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompareOp {
    Never = 1,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    #[default]
    Always,
}

impl CompareOp {
    pub fn from_u8(v: u8) -> Self {
        use CompareOp::*;
        match v {
            1 => Never,
            2 => Less,
            3 => Equal,
            4 => LessOrEqual,
            5 => Greater,
            6 => NotEqual,
            7 => GreaterOrEqual,
            _ => Always,
        }
    }
}

/// Component type of a vertex attribute or fragment output.
///
/// The low bits hold the base type, the high bits carry packing flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct AttributeType(pub u8);

impl AttributeType {
    pub const FLOAT: AttributeType = AttributeType(0);
    pub const SINT: AttributeType = AttributeType(1);
    pub const UINT: AttributeType = AttributeType(2);
    pub const SSCALED: AttributeType = AttributeType(3);
    pub const USCALED: AttributeType = AttributeType(4);

    pub const PACKED: u8 = 1 << 6;
    pub const PACKED_RGB10_A2_SIGNED: u8 = 1 << 7;
    const FLAGS_MASK: u8 = Self::PACKED | Self::PACKED_RGB10_A2_SIGNED;

    pub fn base(self) -> AttributeType {
        AttributeType(self.0 & !Self::FLAGS_MASK)
    }

    pub fn has_flag(self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    /// Type as seen by a shader that reads it through the fixed-function input path.
    pub fn filtered(self, supports_scaled_formats: bool) -> AttributeType {
        let base = self.base();
        if supports_scaled_formats && (base == Self::SSCALED || base == Self::USCALED) {
            Self::FLOAT
        } else {
            base
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TextureTarget {
    Texture1D = 0,
    #[default]
    Texture2D,
    Texture3D,
    Texture1DArray,
    Texture2DArray,
    Texture2DMultisample,
    Texture2DMultisampleArray,
    Cubemap,
    CubemapArray,
    TextureBuffer,
}

impl TextureTarget {
    pub fn from_u8(v: u8) -> Self {
        use TextureTarget::*;
        match v {
            0 => Texture1D,
            2 => Texture3D,
            3 => Texture1DArray,
            4 => Texture2DArray,
            5 => Texture2DMultisample,
            6 => Texture2DMultisampleArray,
            7 => Cubemap,
            8 => CubemapArray,
            9 => TextureBuffer,
            _ => Texture2D,
        }
    }
}

/// Compute engine state at dispatch time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GpuChannelComputeState {
    pub local_size_x: u32,
    pub local_size_y: u32,
    pub local_size_z: u32,
    pub local_memory_size: u32,
    pub shared_memory_size: u32,
    pub has_unaligned_storage_buffer: bool,
}

impl Section for GpuChannelComputeState {
    const MAGIC: SectionMagic = SectionMagic::COMPUTE_STATE;

    fn encode(&self, w: &mut FieldWriter) {
        w.u32(self.local_size_x);
        w.u32(self.local_size_y);
        w.u32(self.local_size_z);
        w.u32(self.local_memory_size);
        w.u32(self.shared_memory_size);
        w.bool(self.has_unaligned_storage_buffer);
    }

    fn decode(r: &mut FieldReader<'_>) -> Self {
        Self {
            local_size_x: r.u32(),
            local_size_y: r.u32(),
            local_size_z: r.u32(),
            local_memory_size: r.u32(),
            shared_memory_size: r.u32(),
            has_unaligned_storage_buffer: r.bool(),
        }
    }
}

/// 3D engine state at draw time that can change the generated host code.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GpuChannelGraphicsState {
    pub early_z_force: bool,
    pub topology: PrimitiveTopology,
    pub tessellation_mode: u32,
    pub alpha_to_coverage_enable: bool,
    pub alpha_to_coverage_dither_enable: bool,
    pub viewport_transform_disable: bool,
    /// Depth range is `[-1, 1]` instead of `[0, 1]`.
    pub depth_mode: bool,
    pub program_point_size_enable: bool,
    pub point_size: f32,
    pub alpha_test_enable: bool,
    pub alpha_test_compare: CompareOp,
    pub alpha_test_reference: f32,
    pub attribute_types: [AttributeType; TOTAL_VERTEX_ATTRIBS],
    pub has_constant_buffer_draw_parameters: bool,
    pub has_unaligned_storage_buffer: bool,
    pub fragment_output_types: [AttributeType; TOTAL_RENDER_TARGETS],
    pub dual_source_blend_enable: bool,
    pub y_negate_enabled: bool,
}

impl Default for GpuChannelGraphicsState {
    fn default() -> Self {
        Self {
            early_z_force: false,
            topology: PrimitiveTopology::Triangles,
            tessellation_mode: 0,
            alpha_to_coverage_enable: false,
            alpha_to_coverage_dither_enable: false,
            viewport_transform_disable: false,
            depth_mode: false,
            program_point_size_enable: false,
            point_size: 1.0,
            alpha_test_enable: false,
            alpha_test_compare: CompareOp::Always,
            alpha_test_reference: 0.0,
            attribute_types: [AttributeType::FLOAT; TOTAL_VERTEX_ATTRIBS],
            has_constant_buffer_draw_parameters: false,
            has_unaligned_storage_buffer: false,
            fragment_output_types: [AttributeType::FLOAT; TOTAL_RENDER_TARGETS],
            dual_source_blend_enable: false,
            y_negate_enabled: false,
        }
    }
}

impl Section for GpuChannelGraphicsState {
    const MAGIC: SectionMagic = SectionMagic::GRAPHICS_STATE;

    fn encode(&self, w: &mut FieldWriter) {
        w.bool(self.early_z_force);
        w.u8(self.topology as u8);
        w.u32(self.tessellation_mode);
        w.bool(self.alpha_to_coverage_enable);
        w.bool(self.alpha_to_coverage_dither_enable);
        w.bool(self.viewport_transform_disable);
        w.bool(self.depth_mode);
        w.bool(self.program_point_size_enable);
        w.f32(self.point_size);
        w.bool(self.alpha_test_enable);
        w.u8(self.alpha_test_compare as u8);
        w.f32(self.alpha_test_reference);
        for ty in &self.attribute_types {
            w.u8(ty.0);
        }
        w.bool(self.has_constant_buffer_draw_parameters);
        w.bool(self.has_unaligned_storage_buffer);
        for ty in &self.fragment_output_types {
            w.u8(ty.0);
        }
        w.bool(self.dual_source_blend_enable);
        w.bool(self.y_negate_enabled);
    }

    fn decode(r: &mut FieldReader<'_>) -> Self {
        let early_z_force = r.bool();
        let topology = PrimitiveTopology::from_u8(r.u8());
        let tessellation_mode = r.u32();
        let alpha_to_coverage_enable = r.bool();
        let alpha_to_coverage_dither_enable = r.bool();
        let viewport_transform_disable = r.bool();
        let depth_mode = r.bool();
        let program_point_size_enable = r.bool();
        let point_size = r.f32();
        let alpha_test_enable = r.bool();
        let alpha_test_compare = CompareOp::from_u8(r.u8());
        let alpha_test_reference = r.f32();
        let mut attribute_types = [AttributeType::default(); TOTAL_VERTEX_ATTRIBS];
        for ty in &mut attribute_types {
            *ty = AttributeType(r.u8());
        }
        let has_constant_buffer_draw_parameters = r.bool();
        let has_unaligned_storage_buffer = r.bool();
        let mut fragment_output_types = [AttributeType::default(); TOTAL_RENDER_TARGETS];
        for ty in &mut fragment_output_types {
            *ty = AttributeType(r.u8());
        }
        Self {
            early_z_force,
            topology,
            tessellation_mode,
            alpha_to_coverage_enable,
            alpha_to_coverage_dither_enable,
            viewport_transform_disable,
            depth_mode,
            program_point_size_enable,
            point_size,
            alpha_test_enable,
            alpha_test_compare,
            alpha_test_reference,
            attribute_types,
            has_constant_buffer_draw_parameters,
            has_unaligned_storage_buffer,
            fragment_output_types,
            dual_source_blend_enable: r.bool(),
            y_negate_enabled: r.bool(),
        }
    }
}

/// Texture and sampler pool bindings for the current draw or dispatch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct GpuChannelPoolState {
    pub texture_pool_gpu_va: u64,
    pub texture_pool_maximum_id: u32,
    pub sampler_pool_maximum_id: u32,
    pub texture_buffer_index: u32,
}

/// Host pipeline state that a backend may bake into the program.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProgramPipelineState {
    pub samples_count: u32,
    pub attachment_enable: [bool; TOTAL_RENDER_TARGETS],
    pub attachment_formats: [u32; TOTAL_RENDER_TARGETS],
    pub depth_stencil_enable: bool,
    pub depth_stencil_format: u32,
    pub vertex_buffer_count: u32,
    pub topology: PrimitiveTopology,
}

impl Section for ProgramPipelineState {
    const MAGIC: SectionMagic = SectionMagic::PIPELINE_STATE;

    fn encode(&self, w: &mut FieldWriter) {
        w.u32(self.samples_count);
        for enable in self.attachment_enable {
            w.bool(enable);
        }
        for format in self.attachment_formats {
            w.u32(format);
        }
        w.bool(self.depth_stencil_enable);
        w.u32(self.depth_stencil_format);
        w.u32(self.vertex_buffer_count);
        w.u8(self.topology as u8);
    }

    fn decode(r: &mut FieldReader<'_>) -> Self {
        let samples_count = r.u32();
        let mut attachment_enable = [false; TOTAL_RENDER_TARGETS];
        for enable in &mut attachment_enable {
            *enable = r.bool();
        }
        let mut attachment_formats = [0u32; TOTAL_RENDER_TARGETS];
        for format in &mut attachment_formats {
            *format = r.u32();
        }
        Self {
            samples_count,
            attachment_enable,
            attachment_formats,
            depth_stencil_enable: r.bool(),
            depth_stencil_format: r.u32(),
            vertex_buffer_count: r.u32(),
            topology: PrimitiveTopology::from_u8(r.u8()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransformFeedbackDescriptor {
    pub buffer_index: u32,
    pub stride: u32,
    pub varying_count: u32,
    pub varying_locations: [u8; TRANSFORM_FEEDBACK_VARYING_BYTES],
}

impl Default for TransformFeedbackDescriptor {
    fn default() -> Self {
        Self {
            buffer_index: 0,
            stride: 0,
            varying_count: 0,
            varying_locations: [0; TRANSFORM_FEEDBACK_VARYING_BYTES],
        }
    }
}

impl TransformFeedbackDescriptor {
    pub fn locations(&self) -> &[u8] {
        let len = (self.varying_count as usize).min(TRANSFORM_FEEDBACK_VARYING_BYTES);
        &self.varying_locations[..len]
    }
}

impl Section for TransformFeedbackDescriptor {
    const MAGIC: SectionMagic = SectionMagic::TRANSFORM_FEEDBACK;

    fn encode(&self, w: &mut FieldWriter) {
        w.u32(self.buffer_index);
        w.u32(self.stride);
        w.u32(self.varying_count);
        w.bytes(&self.varying_locations);
    }

    fn decode(r: &mut FieldReader<'_>) -> Self {
        Self {
            buffer_index: r.u32(),
            stride: r.u32(),
            varying_count: r.u32(),
            varying_locations: r.array(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderTargetState {
    /// Zero when the target is disabled.
    pub format: u32,
}

/// Subset of 3D engine registers the cache needs besides the graphics state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GraphicsEngineState {
    pub transform_feedback: Option<Vec<TransformFeedbackDescriptor>>,
    pub render_targets: [RenderTargetState; TOTAL_RENDER_TARGETS],
    pub render_target_count: u32,
    pub depth_stencil_enable: bool,
    pub depth_stencil_format: u32,
    pub samples_count: u32,
    pub vertex_buffer_count: u32,
}

impl GraphicsEngineState {
    pub fn transform_feedback_descriptors(&self) -> Option<&[TransformFeedbackDescriptor]> {
        self.transform_feedback.as_deref()
    }

    pub fn update_pipeline_info(&self, pipeline: &mut ProgramPipelineState) {
        let count = (self.render_target_count as usize).min(TOTAL_RENDER_TARGETS);
        for (index, rt) in self.render_targets.iter().enumerate() {
            let enabled = index < count && rt.format != 0;
            pipeline.attachment_enable[index] = enabled;
            pipeline.attachment_formats[index] = if enabled { rt.format } else { 0 };
        }
        pipeline.depth_stencil_enable = self.depth_stencil_enable;
        pipeline.depth_stencil_format = self.depth_stencil_format;
        pipeline.samples_count = self.samples_count.max(1);
        pipeline.vertex_buffer_count = self.vertex_buffer_count;
    }
}

/// Texture pool entry fields a shader can depend on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureDescriptor {
    pub format: u32,
    pub srgb: bool,
    pub target: TextureTarget,
    pub coord_normalized: bool,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            format: 0,
            srgb: false,
            target: TextureTarget::Texture2D,
            coord_normalized: true,
        }
    }
}

/// How a texture handle word refers to its sampler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureHandleType {
    Combined,
    SeparateSamplerHandle,
    SeparateSamplerId,
    SeparateConstantSamplerHandle,
}

/// Splits the constant buffer slot field of a texture reference into texture and sampler buffer indices.
pub fn unpack_texture_slots(cbuf_slot: i32, default_texture_buffer_index: u32) -> (u32, u32) {
    if cbuf_slot < 0 {
        return (default_texture_buffer_index, default_texture_buffer_index);
    }
    let slots = cbuf_slot as u32;
    let texture = slots & 0xffff;
    let high = slots >> 16;
    let sampler = if high != 0 { high - 1 } else { texture };
    (texture, sampler)
}

/// Splits a handle into texture word offset, sampler word offset and handle type.
pub fn unpack_handle_offsets(handle: i32) -> (u32, u32, TextureHandleType) {
    let handle = handle as u32;
    let handle_type = match handle >> 28 {
        1 => TextureHandleType::SeparateSamplerHandle,
        2 => TextureHandleType::SeparateSamplerId,
        3 => TextureHandleType::SeparateConstantSamplerHandle,
        _ => TextureHandleType::Combined,
    };
    (handle & 0x3fff, (handle >> 14) & 0x3fff, handle_type)
}

/// Combines the texture and sampler handle words into one packed id.
pub fn combine_packed_id(
    texture_word: u32,
    sampler_word: u32,
    sampler_word_offset: u32,
    handle_type: TextureHandleType,
) -> u32 {
    match handle_type {
        TextureHandleType::Combined => texture_word,
        TextureHandleType::SeparateSamplerHandle => texture_word | sampler_word,
        TextureHandleType::SeparateSamplerId => texture_word | (sampler_word << 20),
        TextureHandleType::SeparateConstantSamplerHandle => {
            texture_word | (sampler_word_offset << 20)
        }
    }
}

pub fn unpack_texture_id(packed_id: u32) -> u32 {
    packed_id & 0xfffff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ReadLeExt, WriteLeExt};
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    #[test]
    fn attribute_filter_strips_packing_and_scaled() {
        let packed_sscaled = AttributeType(AttributeType::SSCALED.0 | AttributeType::PACKED);
        assert_eq!(packed_sscaled.filtered(true), AttributeType::FLOAT);
        assert_eq!(packed_sscaled.filtered(false), AttributeType::SSCALED);
        assert_eq!(AttributeType::UINT.filtered(true), AttributeType::UINT);
    }

    #[test]
    fn graphics_state_section_roundtrip() {
        let mut state = GpuChannelGraphicsState {
            topology: PrimitiveTopology::TriangleStrip,
            alpha_test_enable: true,
            alpha_test_compare: CompareOp::Greater,
            alpha_test_reference: 0.5,
            y_negate_enabled: true,
            ..Default::default()
        };
        state.attribute_types[3] = AttributeType::SINT;
        state.fragment_output_types[1] = AttributeType::UINT;

        let mut bytes = Vec::new();
        bytes.write_section(&state).unwrap();
        let decoded: GpuChannelGraphicsState = Cursor::new(bytes).read_section().unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn texture_slots_unpack() {
        assert_eq!(unpack_texture_slots(-1, 2), (2, 2));
        assert_eq!(unpack_texture_slots(3, 2), (3, 3));
        assert_eq!(unpack_texture_slots((5 << 16) | 3, 2), (3, 4));
    }

    #[test]
    fn handle_offsets_unpack() {
        let handle = (2 << 28) | (7 << 14) | 9;
        assert_eq!(
            unpack_handle_offsets(handle),
            (9, 7, TextureHandleType::SeparateSamplerId)
        );
        assert_eq!(
            combine_packed_id(0x12, 0x3, 7, TextureHandleType::SeparateSamplerId),
            0x12 | (0x3 << 20)
        );
        assert_eq!(unpack_texture_id(0xABC0_0012), 0x00012);
    }

    #[test]
    fn pipeline_info_from_engine_state() {
        let mut engine = GraphicsEngineState {
            render_target_count: 2,
            depth_stencil_enable: true,
            depth_stencil_format: 0x2f,
            ..Default::default()
        };
        engine.render_targets[0].format = 0xd5;
        engine.render_targets[1].format = 0;
        engine.render_targets[2].format = 0xd5;

        let mut pipeline = ProgramPipelineState::default();
        engine.update_pipeline_info(&mut pipeline);
        assert_eq!(pipeline.attachment_enable[..3], [true, false, false]);
        assert_eq!(pipeline.attachment_formats[0], 0xd5);
        assert_eq!(pipeline.samples_count, 1);
        assert!(pipeline.depth_stencil_enable);
    }
}
