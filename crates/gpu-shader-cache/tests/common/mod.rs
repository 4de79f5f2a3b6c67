//! Shared helpers for `gpu-shader-cache` integration tests.
//!
//! Guest shaders in these tests use a tiny made-up format: a little endian
//! `u32` total size, a `u32` flag word (see the `FLAG_*` constants) and an
//! arbitrary payload. The scripted translator honours the flags, which lets a
//! test decide exactly which engine state a shader depends on.

#![allow(dead_code)]

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use gpu_shader_cache::engine_state::{GpuChannelPoolState, TextureDescriptor};
use gpu_shader_cache::program::{BufferDescriptor, ShaderProgramInfo};
use gpu_shader_cache::shader_info::ShaderInfo;
use gpu_shader_cache::{
    BufferBounds, DecodedShader, GpuAccessor, GpuChannel, GpuMemory, HostCapabilities, HostProgram,
    ProgramLinkStatus, Renderer, ShaderCache, ShaderCacheConfig, ShaderProgram, ShaderSource,
    ShaderStage, ShaderTranslator, TranslationError, TranslationFlags, TranslationOptions,
    VecGpuMemory,
};

pub const FLAG_QUERY_LOCAL_SIZE: u32 = 1 << 0;
pub const FLAG_QUERY_ALPHA_TEST: u32 = 1 << 1;
pub const FLAG_HAS_STORE: u32 = 1 << 2;
pub const FLAG_LAYER_OUTPUT: u32 = 1 << 3;
pub const FLAG_FAIL_TRANSLATION: u32 = 1 << 4;
pub const FLAG_READ_CB1: u32 = 1 << 5;
pub const FLAG_LINK_FAILS: u32 = 1 << 6;
pub const FLAG_QUERY_TOPOLOGY: u32 = 1 << 7;
/// Queries format and sampler type of the texture at [`TEXTURE_HANDLE`].
pub const FLAG_QUERY_TEXTURE: u32 = 1 << 8;
pub const FLAG_QUERY_CB_USE: u32 = 1 << 9;
pub const FLAG_QUERY_TRANSFORM_FEEDBACK: u32 = 1 << 10;

/// Word 0 of the pool's texture buffer, which leaves every read at texture id 0.
pub const TEXTURE_HANDLE: i32 = 0;
const TEXTURE_CBUF_SLOT: i32 = -1;

const HEADER_SIZE: usize = 8;
const CB1_READ_SIZE: usize = 16;
const LINK_FAIL_MARKER: &str = "link-fail";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Encodes a guest shader in the test format.
pub fn shader_code(flags: u32, payload: &[u8]) -> Vec<u8> {
    let size = (HEADER_SIZE + payload.len()) as u32;
    let mut code = Vec::with_capacity(size as usize);
    code.extend_from_slice(&size.to_le_bytes());
    code.extend_from_slice(&flags.to_le_bytes());
    code.extend_from_slice(payload);
    code
}

pub struct TestContext {
    stage: ShaderStage,
    code: Vec<u8>,
    flags: u32,
}

impl TestContext {
    fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

impl DecodedShader for TestContext {
    fn stage(&self) -> ShaderStage {
        self.stage
    }

    fn size(&self) -> usize {
        self.code.len()
    }

    fn cb1_data_size(&self) -> usize {
        if self.has(FLAG_READ_CB1) {
            CB1_READ_SIZE
        } else {
            0
        }
    }

    fn has_store(&self) -> bool {
        self.has(FLAG_HAS_STORE)
    }

    fn layer_output_written(&self) -> bool {
        self.has(FLAG_LAYER_OUTPUT)
    }

    fn uses_draw_parameters(&self) -> bool {
        false
    }
}

#[derive(Default)]
pub struct ScriptedTranslator {
    decodes: AtomicUsize,
    translations: AtomicUsize,
}

impl ScriptedTranslator {
    pub fn translations(&self) -> usize {
        self.translations.load(Ordering::SeqCst)
    }

    pub fn decodes(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }
}

fn program(accessor: &dyn GpuAccessor, info: ShaderProgramInfo, code: String) -> ShaderProgram {
    ShaderProgram {
        info,
        language: accessor.host_capabilities().target_language(),
        code,
        binary: Vec::new(),
    }
}

impl ShaderTranslator for ScriptedTranslator {
    type Context = TestContext;

    fn decode(
        &self,
        accessor: &mut dyn GpuAccessor,
        options: TranslationOptions,
        gpu_va: u64,
    ) -> Result<TestContext, TranslationError> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        let header = accessor.read_code(gpu_va, HEADER_SIZE);
        if header.len() < HEADER_SIZE {
            return Err(TranslationError::new("shader header is not mapped"));
        }
        let size = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let flags = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let code = accessor.read_code(gpu_va, size);
        if code.len() != size {
            return Err(TranslationError::new("shader body is not mapped"));
        }
        if flags & FLAG_FAIL_TRANSLATION != 0 {
            return Err(TranslationError::new("scripted failure"));
        }

        let stage = if options.flags.contains(TranslationFlags::COMPUTE) {
            ShaderStage::Compute
        } else {
            ShaderStage::from_graphics_index(accessor.stage_index())
        };
        Ok(TestContext { stage, code, flags })
    }

    fn translate(
        &self,
        accessor: &mut dyn GpuAccessor,
        context: &TestContext,
        vertex_a: Option<&TestContext>,
        as_compute: bool,
    ) -> Result<ShaderProgram, TranslationError> {
        self.translations.fetch_add(1, Ordering::SeqCst);

        let mut words = Vec::new();
        if context.has(FLAG_QUERY_LOCAL_SIZE) {
            let (x, y, z) = accessor.query_compute_local_size();
            words.extend([x, y, z]);
        }
        if context.has(FLAG_QUERY_ALPHA_TEST) {
            let alpha = accessor.query_alpha_test();
            words.push(u32::from(alpha.is_some()));
        }
        if context.has(FLAG_READ_CB1) {
            words.push(accessor.constant_buffer1_word(0));
        }
        if context.has(FLAG_QUERY_TOPOLOGY) {
            words.push(accessor.query_primitive_topology() as u32);
        }
        if context.has(FLAG_QUERY_TEXTURE) {
            let (format, srgb) = accessor.query_texture_format(TEXTURE_HANDLE, TEXTURE_CBUF_SLOT);
            let target = accessor.query_sampler_type(TEXTURE_HANDLE, TEXTURE_CBUF_SLOT);
            words.extend([format, u32::from(srgb), target as u32]);
        }
        if context.has(FLAG_QUERY_CB_USE) {
            words.push(accessor.query_constant_buffer_use());
        }
        if context.has(FLAG_QUERY_TRANSFORM_FEEDBACK) {
            let enabled = accessor.query_transform_feedback_enabled();
            words.push(u32::from(enabled));
            if enabled {
                words.push(accessor.query_transform_feedback_stride(0));
            }
        }

        let stage = if as_compute {
            ShaderStage::Compute
        } else {
            context.stage
        };
        let mut info = ShaderProgramInfo::new(stage);
        let binding = accessor.create_constant_buffer_binding(1);
        info.cbuffers.push(BufferDescriptor {
            set: binding.set,
            binding: binding.binding,
            slot: 1,
            ..Default::default()
        });

        let mut code = format!(
            "{:?} size={} merged={} state={:?}",
            context.stage,
            context.code.len(),
            vertex_a.map_or(0, |a| a.code.len()),
            words
        );
        if context.has(FLAG_LINK_FAILS) {
            code.push(' ');
            code.push_str(LINK_FAIL_MARKER);
        }
        Ok(program(accessor, info, code))
    }

    fn vertex_passthrough_for_compute(
        &self,
        accessor: &mut dyn GpuAccessor,
        context: &TestContext,
    ) -> Result<ShaderProgram, TranslationError> {
        let code = format!("vertex passthrough of {:?}", context.stage);
        Ok(program(accessor, ShaderProgramInfo::new(ShaderStage::Vertex), code))
    }

    fn geometry_passthrough(
        &self,
        accessor: &mut dyn GpuAccessor,
        previous: &TestContext,
    ) -> Result<ShaderProgram, TranslationError> {
        let code = format!("layer passthrough of {:?}", previous.stage);
        Ok(program(accessor, ShaderProgramInfo::new(ShaderStage::Geometry), code))
    }
}

/// Link status reported by every non-failing program that is not waited on.
#[derive(Clone, Debug)]
pub struct LinkControl(Arc<Mutex<ProgramLinkStatus>>);

impl LinkControl {
    pub fn set(&self, status: ProgramLinkStatus) {
        *self.0.lock().unwrap() = status;
    }

    fn get(&self) -> ProgramLinkStatus {
        *self.0.lock().unwrap()
    }
}

const BINARY_MAGIC: &[u8] = b"MOCKBIN\n";

#[derive(Debug)]
pub struct MockProgram {
    pub sources: Vec<ShaderSource>,
    pub from_binary: bool,
    fails: bool,
    link: LinkControl,
}

impl HostProgram for MockProgram {
    fn check_link_status(&self, blocking: bool) -> ProgramLinkStatus {
        if self.fails {
            return ProgramLinkStatus::Failure;
        }
        match self.link.get() {
            ProgramLinkStatus::Incomplete if blocking => ProgramLinkStatus::Success,
            status => status,
        }
    }

    fn binary(&self) -> Vec<u8> {
        let mut binary = BINARY_MAGIC.to_vec();
        for source in &self.sources {
            binary.push(source.stage as u8);
            binary.extend_from_slice(source.code.as_bytes());
            binary.push(0);
        }
        binary
    }
}

pub struct MockRenderer {
    caps: HostCapabilities,
    link: LinkControl,
    created: AtomicUsize,
    loaded_from_binary: AtomicUsize,
}

impl MockRenderer {
    pub fn new(caps: HostCapabilities) -> Self {
        Self {
            caps,
            link: LinkControl(Arc::new(Mutex::new(ProgramLinkStatus::Success))),
            created: AtomicUsize::new(0),
            loaded_from_binary: AtomicUsize::new(0),
        }
    }

    pub fn link_control(&self) -> LinkControl {
        self.link.clone()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn loaded_from_binary(&self) -> usize {
        self.loaded_from_binary.load(Ordering::SeqCst)
    }
}

impl Renderer for MockRenderer {
    type Program = MockProgram;

    fn capabilities(&self) -> &HostCapabilities {
        &self.caps
    }

    fn create_program(&self, sources: &[ShaderSource], _info: &ShaderInfo) -> MockProgram {
        self.created.fetch_add(1, Ordering::SeqCst);
        MockProgram {
            sources: sources.to_vec(),
            from_binary: false,
            fails: sources.iter().any(|s| s.code.contains(LINK_FAIL_MARKER)),
            link: self.link.clone(),
        }
    }

    fn load_program_binary(
        &self,
        binary: &[u8],
        _has_fragment_shader: bool,
        _info: &ShaderInfo,
    ) -> MockProgram {
        self.loaded_from_binary.fetch_add(1, Ordering::SeqCst);
        let valid = binary.starts_with(BINARY_MAGIC);
        MockProgram {
            sources: Vec::new(),
            from_binary: true,
            fails: !valid,
            link: self.link.clone(),
        }
    }
}

pub struct TestChannel {
    pub memory: VecGpuMemory,
    pub cb1: BufferBounds,
    /// Enabled uniform buffers reported for every stage.
    pub use_mask: Cell<u32>,
    /// Descriptor at texture id 0, `None` for an empty pool.
    pub texture: Cell<Option<TextureDescriptor>>,
}

impl TestChannel {
    pub fn new(size: usize) -> Self {
        Self {
            memory: VecGpuMemory::new(size),
            cb1: BufferBounds::default(),
            use_mask: Cell::new(0b10),
            texture: Cell::new(None),
        }
    }

    pub fn write(&self, gpu_va: u64, data: &[u8]) {
        self.memory.write(gpu_va, data).unwrap();
    }
}

impl GpuChannel for TestChannel {
    fn memory(&self) -> &dyn GpuMemory {
        &self.memory
    }

    fn uniform_buffer_bounds(&self, _is_compute: bool, _stage_index: usize, index: u32) -> BufferBounds {
        if index == 1 {
            self.cb1
        } else {
            BufferBounds::default()
        }
    }

    fn uniform_buffer_use_mask(&self, _is_compute: bool, _stage_index: usize) -> u32 {
        self.use_mask.get()
    }

    fn texture_descriptor(
        &self,
        _pool: &GpuChannelPoolState,
        texture_id: u32,
    ) -> Option<TextureDescriptor> {
        if texture_id == 0 {
            self.texture.get()
        } else {
            None
        }
    }
}

pub type TestCache = ShaderCache<ScriptedTranslator, MockRenderer>;

pub fn memory_cache(caps: HostCapabilities) -> TestCache {
    ShaderCache::new(
        ShaderCacheConfig::default(),
        ScriptedTranslator::default(),
        MockRenderer::new(caps),
    )
    .unwrap()
}

pub fn disk_cache(caps: HostCapabilities, dir: &std::path::Path) -> TestCache {
    ShaderCache::new(
        ShaderCacheConfig::new(true, Some(dir.to_path_buf())),
        ScriptedTranslator::default(),
        MockRenderer::new(caps),
    )
    .unwrap()
}
