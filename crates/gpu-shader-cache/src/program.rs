//! Translated and cached shader program types.

use std::io::{Read, Write};
use std::sync::Arc;

use bitflags::bitflags;

use crate::codec::{FieldReader, FieldWriter, ReadLeExt, Section, SectionMagic, WriteLeExt};
use crate::config::TargetLanguage;
use crate::engine_state::TextureTarget;
use crate::error::{DiskCacheLoadError, DiskResult};
use crate::resources::ResourceReservations;
use crate::shader_info::ShaderInfo;
use crate::specialization::ShaderSpecializationState;

/// Number of graphics shader stages, vertex through fragment.
pub const GRAPHICS_STAGES: usize = 5;
/// Stage slots in a graphics program: vertex A followed by the five graphics stages.
pub const GRAPHICS_STAGE_SLOTS: usize = GRAPHICS_STAGES + 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ShaderStage {
    Compute = 0,
    Vertex,
    TessellationControl,
    TessellationEvaluation,
    Geometry,
    Fragment,
}

impl ShaderStage {
    pub const GRAPHICS: [ShaderStage; GRAPHICS_STAGES] = [
        ShaderStage::Vertex,
        ShaderStage::TessellationControl,
        ShaderStage::TessellationEvaluation,
        ShaderStage::Geometry,
        ShaderStage::Fragment,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Compute),
            1 => Some(Self::Vertex),
            2 => Some(Self::TessellationControl),
            3 => Some(Self::TessellationEvaluation),
            4 => Some(Self::Geometry),
            5 => Some(Self::Fragment),
            _ => None,
        }
    }

    /// Index used for per-stage engine state: 0 for compute and vertex, then one per stage.
    pub fn stage_index(self) -> usize {
        match self {
            Self::Compute | Self::Vertex => 0,
            other => other as usize - 1,
        }
    }

    pub fn from_graphics_index(stage_index: usize) -> Self {
        Self::GRAPHICS[stage_index.min(GRAPHICS_STAGES - 1)]
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BufferUsageFlags: u8 {
        const WRITE = 1 << 0;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TextureUsageFlags: u8 {
        const NEEDS_SCALE_VALUE = 1 << 0;
        const RES_SCALE_UNSUPPORTED = 1 << 1;
        const IMAGE_STORE = 1 << 2;
        const IMAGE_COHERENT = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub set: u32,
    pub binding: u32,
    /// Guest constant or storage buffer slot.
    pub slot: u32,
    pub flags: BufferUsageFlags,
}

impl Section for BufferDescriptor {
    const MAGIC: SectionMagic = SectionMagic::BUFFER_DESCRIPTOR;

    fn encode(&self, w: &mut FieldWriter) {
        w.u32(self.set);
        w.u32(self.binding);
        w.u32(self.slot);
        w.u8(self.flags.bits());
    }

    fn decode(r: &mut FieldReader<'_>) -> Self {
        Self {
            set: r.u32(),
            binding: r.u32(),
            slot: r.u32(),
            flags: BufferUsageFlags::from_bits_truncate(r.u8()),
        }
    }
}

/// A texture or image the translated shader samples from or writes to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TextureBinding {
    pub set: u32,
    pub binding: u32,
    pub target: TextureTarget,
    pub format: u32,
    pub cbuf_slot: i32,
    pub handle: i32,
    pub array_length: u32,
    pub separate: bool,
    pub flags: TextureUsageFlags,
}

impl Section for TextureBinding {
    const MAGIC: SectionMagic = SectionMagic::TEXTURE_DESCRIPTOR;

    fn encode(&self, w: &mut FieldWriter) {
        w.u32(self.set);
        w.u32(self.binding);
        w.u8(self.target as u8);
        w.u32(self.format);
        w.i32(self.cbuf_slot);
        w.i32(self.handle);
        w.u32(self.array_length);
        w.bool(self.separate);
        w.u8(self.flags.bits());
    }

    fn decode(r: &mut FieldReader<'_>) -> Self {
        Self {
            set: r.u32(),
            binding: r.u32(),
            target: TextureTarget::from_u8(r.u8()),
            format: r.u32(),
            cbuf_slot: r.i32(),
            handle: r.i32(),
            array_length: r.u32(),
            separate: r.bool(),
            flags: TextureUsageFlags::from_bits_truncate(r.u8()),
        }
    }
}

/// Resource usage and stage facts reported by the translator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderProgramInfo {
    pub stage: ShaderStage,
    pub cbuffers: Vec<BufferDescriptor>,
    pub sbuffers: Vec<BufferDescriptor>,
    pub textures: Vec<TextureBinding>,
    pub images: Vec<TextureBinding>,
    pub geometry_vertices_per_primitive: u8,
    pub geometry_max_output_vertices: u16,
    pub threads_per_input_primitive: u16,
    pub uses_frag_coord: bool,
    pub uses_instance_id: bool,
    pub uses_draw_parameters: bool,
    pub uses_rt_layer: bool,
    pub clip_distances_written: u8,
    pub fragment_output_map: i32,
}

impl ShaderProgramInfo {
    pub fn new(stage: ShaderStage) -> Self {
        Self {
            stage,
            cbuffers: Vec::new(),
            sbuffers: Vec::new(),
            textures: Vec::new(),
            images: Vec::new(),
            geometry_vertices_per_primitive: 0,
            geometry_max_output_vertices: 0,
            threads_per_input_primitive: 0,
            uses_frag_coord: false,
            uses_instance_id: false,
            uses_draw_parameters: false,
            uses_rt_layer: false,
            clip_distances_written: 0,
            fragment_output_map: -1,
        }
    }
}

/// Fixed-size part of [`ShaderProgramInfo`]; the resource lists follow it on disk.
struct ProgramInfoHeader {
    stage: u8,
    cbuffers: u16,
    sbuffers: u16,
    textures: u16,
    images: u16,
    geometry_vertices_per_primitive: u8,
    geometry_max_output_vertices: u16,
    threads_per_input_primitive: u16,
    uses_frag_coord: bool,
    uses_instance_id: bool,
    uses_draw_parameters: bool,
    uses_rt_layer: bool,
    clip_distances_written: u8,
    fragment_output_map: i32,
}

impl Section for ProgramInfoHeader {
    const MAGIC: SectionMagic = SectionMagic::SHADER_INFO;

    fn encode(&self, w: &mut FieldWriter) {
        w.u8(self.stage);
        w.u16(self.cbuffers);
        w.u16(self.sbuffers);
        w.u16(self.textures);
        w.u16(self.images);
        w.u8(self.geometry_vertices_per_primitive);
        w.u16(self.geometry_max_output_vertices);
        w.u16(self.threads_per_input_primitive);
        w.bool(self.uses_frag_coord);
        w.bool(self.uses_instance_id);
        w.bool(self.uses_draw_parameters);
        w.bool(self.uses_rt_layer);
        w.u8(self.clip_distances_written);
        w.i32(self.fragment_output_map);
    }

    fn decode(r: &mut FieldReader<'_>) -> Self {
        Self {
            stage: r.u8(),
            cbuffers: r.u16(),
            sbuffers: r.u16(),
            textures: r.u16(),
            images: r.u16(),
            geometry_vertices_per_primitive: r.u8(),
            geometry_max_output_vertices: r.u16(),
            threads_per_input_primitive: r.u16(),
            uses_frag_coord: r.bool(),
            uses_instance_id: r.bool(),
            uses_draw_parameters: r.bool(),
            uses_rt_layer: r.bool(),
            clip_distances_written: r.u8(),
            fragment_output_map: r.i32(),
        }
    }
}

fn list_len(len: usize) -> DiskResult<u16> {
    u16::try_from(len).map_err(|_| DiskCacheLoadError::Corrupt("resource list too long"))
}

pub fn write_program_info<W: Write + ?Sized>(w: &mut W, info: &ShaderProgramInfo) -> DiskResult<()> {
    w.write_section(&ProgramInfoHeader {
        stage: info.stage as u8,
        cbuffers: list_len(info.cbuffers.len())?,
        sbuffers: list_len(info.sbuffers.len())?,
        textures: list_len(info.textures.len())?,
        images: list_len(info.images.len())?,
        geometry_vertices_per_primitive: info.geometry_vertices_per_primitive,
        geometry_max_output_vertices: info.geometry_max_output_vertices,
        threads_per_input_primitive: info.threads_per_input_primitive,
        uses_frag_coord: info.uses_frag_coord,
        uses_instance_id: info.uses_instance_id,
        uses_draw_parameters: info.uses_draw_parameters,
        uses_rt_layer: info.uses_rt_layer,
        clip_distances_written: info.clip_distances_written,
        fragment_output_map: info.fragment_output_map,
    })?;
    for desc in info.cbuffers.iter().chain(&info.sbuffers) {
        w.write_section(desc)?;
    }
    for desc in info.textures.iter().chain(&info.images) {
        w.write_section(desc)?;
    }
    Ok(())
}

pub fn read_program_info<R: Read + ?Sized>(r: &mut R) -> DiskResult<ShaderProgramInfo> {
    let header: ProgramInfoHeader = r.read_section()?;
    let stage = ShaderStage::from_u8(header.stage)
        .ok_or(DiskCacheLoadError::Corrupt("invalid shader stage"))?;

    let mut read_buffers = |count: u16| -> DiskResult<Vec<BufferDescriptor>> {
        (0..count).map(|_| r.read_section()).collect()
    };
    let cbuffers = read_buffers(header.cbuffers)?;
    let sbuffers = read_buffers(header.sbuffers)?;

    let mut read_textures = |count: u16| -> DiskResult<Vec<TextureBinding>> {
        (0..count).map(|_| r.read_section()).collect()
    };
    let textures = read_textures(header.textures)?;
    let images = read_textures(header.images)?;

    Ok(ShaderProgramInfo {
        stage,
        cbuffers,
        sbuffers,
        textures,
        images,
        geometry_vertices_per_primitive: header.geometry_vertices_per_primitive,
        geometry_max_output_vertices: header.geometry_max_output_vertices,
        threads_per_input_primitive: header.threads_per_input_primitive,
        uses_frag_coord: header.uses_frag_coord,
        uses_instance_id: header.uses_instance_id,
        uses_draw_parameters: header.uses_draw_parameters,
        uses_rt_layer: header.uses_rt_layer,
        clip_distances_written: header.clip_distances_written,
        fragment_output_map: header.fragment_output_map,
    })
}

/// Output of the translator for one stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderProgram {
    pub info: ShaderProgramInfo,
    pub language: TargetLanguage,
    /// Host source text, empty for binary languages.
    pub code: String,
    /// Host binary code, empty for text languages.
    pub binary: Vec<u8>,
}

impl ShaderProgram {
    pub fn source(&self) -> ShaderSource {
        ShaderSource {
            stage: self.info.stage,
            language: self.language,
            code: self.code.clone(),
            binary: self.binary.clone(),
        }
    }
}

/// One stage handed to the host for compilation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderSource {
    pub stage: ShaderStage,
    pub language: TargetLanguage,
    pub code: String,
    pub binary: Vec<u8>,
}

/// Guest code of one stage as it was when the program was translated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedShaderStage {
    /// `None` for a vertex A stage merged into vertex B.
    pub info: Option<ShaderProgramInfo>,
    pub code: Arc<[u8]>,
    pub cb1_data: Arc<[u8]>,
}

impl CachedShaderStage {
    pub fn new(info: Option<ShaderProgramInfo>, code: Arc<[u8]>, cb1_data: Arc<[u8]>) -> Self {
        Self {
            info,
            code,
            cb1_data,
        }
    }
}

/// A vertex pipeline stage retargeted to a compute dispatch.
#[derive(Debug)]
pub struct ShaderAsCompute<P> {
    pub host_program: P,
    pub info: ShaderProgramInfo,
    pub reservations: ResourceReservations,
}

/// The unit stored in the cache.
#[derive(Debug)]
pub struct CachedShaderProgram<P> {
    pub host_program: P,
    pub vertex_as_compute: Option<ShaderAsCompute<P>>,
    pub geometry_as_compute: Option<ShaderAsCompute<P>>,
    pub specialization_state: Arc<ShaderSpecializationState>,
    /// One slot for compute, [`GRAPHICS_STAGE_SLOTS`] slots for graphics.
    pub shaders: Vec<Option<Arc<CachedShaderStage>>>,
    pub info: ShaderInfo,
}

impl<P> CachedShaderProgram<P> {
    pub fn new(
        host_program: P,
        mut specialization_state: ShaderSpecializationState,
        shaders: Vec<Option<Arc<CachedShaderStage>>>,
        info: ShaderInfo,
    ) -> Self {
        specialization_state.prepare(&shaders);
        Self {
            host_program,
            vertex_as_compute: None,
            geometry_as_compute: None,
            specialization_state: Arc::new(specialization_state),
            shaders,
            info,
        }
    }

    pub fn with_compute_stages(
        mut self,
        vertex_as_compute: Option<ShaderAsCompute<P>>,
        geometry_as_compute: Option<ShaderAsCompute<P>>,
    ) -> Self {
        self.vertex_as_compute = vertex_as_compute;
        self.geometry_as_compute = geometry_as_compute;
        self
    }

    pub fn is_compute(&self) -> bool {
        self.specialization_state.is_compute()
    }

    pub fn has_stage_as_compute(&self) -> bool {
        self.vertex_as_compute.is_some() || self.geometry_as_compute.is_some()
    }

    pub fn stage(&self, slot: usize) -> Option<&Arc<CachedShaderStage>> {
        self.shaders.get(slot).and_then(Option::as_ref)
    }
}

/// Guest addresses of each graphics stage; zero means the stage is unbound.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ShaderAddresses {
    pub vertex_a: u64,
    pub vertex_b: u64,
    pub tessellation_control: u64,
    pub tessellation_evaluation: u64,
    pub geometry: u64,
    pub fragment: u64,
}

impl ShaderAddresses {
    pub fn as_array(&self) -> [u64; GRAPHICS_STAGE_SLOTS] {
        [
            self.vertex_a,
            self.vertex_b,
            self.tessellation_control,
            self.tessellation_evaluation,
            self.geometry,
            self.fragment,
        ]
    }
}
