//! The shader cache: resolves guest shader code plus engine state to host programs.
//!
//! Lookups go through three tiers, always in this order:
//!
//! 1. The address maps, keyed by the guest address(es) of the last program
//!    returned for them. An entry is only used after its code has been compared
//!    byte for byte against guest memory and its specialization state matched.
//! 2. The content tables, which identify each stage's code by its bytes no
//!    matter where it lives, and then scan the variants sharing that code.
//! 3. Translation and host compilation, after which the program is inserted
//!    into both previous tiers and queued for the disk cache.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use hashbrown::HashMap;
use tracing::{debug, info, warn};

use crate::accessor::{ChannelGpuAccessor, GpuAccessorBase, ProgramGpuAccessor};
use crate::cache_table::{ComputeShaderCacheHashTable, ShaderCacheHashTable};
use crate::channel::GpuChannel;
use crate::config::{HostCapabilities, ShaderCacheConfig, TargetApi};
use crate::disk::{
    binary_pack, loader, BackgroundDiskCacheWriter, CancellationToken, DiskCacheHostStorage,
    DiskLoadSummary, PersistRequest, ShaderCacheState,
};
use crate::engine_state::{
    GpuChannelComputeState, GpuChannelGraphicsState, GpuChannelPoolState, GraphicsEngineState,
    ProgramPipelineState, TransformFeedbackDescriptor,
};
use crate::error::{Result, ShaderCacheError};
use crate::hash_table::DataAccessor;
use crate::memory::{memory_matches, ShaderCodeAccessor};
use crate::program::{
    CachedShaderProgram, CachedShaderStage, ShaderAddresses, ShaderAsCompute, ShaderProgram,
    ShaderSource, ShaderStage, GRAPHICS_STAGES, GRAPHICS_STAGE_SLOTS,
};
use crate::renderer::{HostProgram, ProgramLinkStatus, Renderer};
use crate::resources::{ResourceCounts, ResourceReservations};
use crate::shader_info::{ShaderInfo, ShaderInfoBuilder};
use crate::specialization::{GraphicsMatchOptions, ShaderSpecializationState};
use crate::stats::ShaderCacheStats;
use crate::translator::{
    DecodedShader, ShaderTranslator, TranslationError, TranslationFlags, TranslationOptions,
};

const GEOMETRY_STAGE_INDEX: usize = 3;

type Program<R> = CachedShaderProgram<<R as Renderer>::Program>;

/// A stage translated for a compute dispatch, waiting for its host program.
#[derive(Debug)]
pub(crate) struct TranslatedAsCompute {
    pub program: ShaderProgram,
    pub reservations: ResourceReservations,
}

/// Everything translation produced for one program, before host compilation.
#[derive(Debug)]
pub(crate) struct ProgramTranslation {
    pub sources: Vec<ShaderSource>,
    pub shaders: Vec<Option<Arc<CachedShaderStage>>>,
    pub info: ShaderInfo,
    pub vertex_as_compute: Option<TranslatedAsCompute>,
    pub geometry_as_compute: Option<TranslatedAsCompute>,
    pub tf_enabled: bool,
}

/// Inputs of a graphics translation. `stages` holds the guest address of each
/// present stage slot, vertex A first.
#[derive(Clone, Copy, Debug)]
pub(crate) struct GraphicsTranslationRequest {
    pub stages: [Option<u64>; GRAPHICS_STAGE_SLOTS],
    pub tf_enabled: bool,
    pub pipeline: Option<ProgramPipelineState>,
    pub from_cache: bool,
}

fn translation_error(stage: ShaderStage, address: u64) -> impl FnOnce(TranslationError) -> ShaderCacheError {
    move |source| ShaderCacheError::Translation {
        stage,
        address,
        source,
    }
}

/// Which vertex pipeline stages must run as compute dispatches on this host,
/// as `(vertex, geometry)`. Emulating geometry forces vertex emulation too,
/// since the stages then exchange vertices through storage buffers.
pub(crate) fn stages_to_compute(
    caps: &HostCapabilities,
    vertex_has_store: Option<bool>,
    geometry_has_store: Option<bool>,
) -> (bool, bool) {
    let no_vertex_stores = !caps.supports_vertex_store_and_atomics;
    let geometry_to_compute = geometry_has_store
        .is_some_and(|has_store| (no_vertex_stores && has_store) || !caps.supports_geometry_shader);
    let vertex_to_compute = vertex_has_store
        .is_some_and(|has_store| (no_vertex_stores && has_store) || geometry_to_compute);
    (vertex_to_compute, geometry_to_compute)
}

pub(crate) fn translate_compute<T, A, F>(
    translator: &T,
    caps: &HostCapabilities,
    accessor: &mut A,
    gpu_va: u64,
    from_cache: bool,
    stage_code: F,
) -> Result<ProgramTranslation>
where
    T: ShaderTranslator,
    A: ProgramGpuAccessor,
    F: FnOnce(&T::Context) -> (Arc<[u8]>, Arc<[u8]>),
{
    accessor.select_stage(0);
    accessor.set_reservations(ResourceReservations::for_stages(caps, false, false));
    let options =
        TranslationOptions::new(caps.target_language(), caps.api, TranslationFlags::COMPUTE);

    let context = translator
        .decode(accessor, options, gpu_va)
        .map_err(translation_error(ShaderStage::Compute, gpu_va))?;
    let program = translator
        .translate(accessor, &context, None, false)
        .map_err(translation_error(ShaderStage::Compute, gpu_va))?;

    let (code, cb1_data) = stage_code(&context);
    let info = ShaderInfoBuilder::build_for_compute(caps, &program.info, from_cache);
    let sources = vec![program.source()];
    let stage = CachedShaderStage::new(Some(program.info), code, cb1_data);
    Ok(ProgramTranslation {
        sources,
        shaders: vec![Some(Arc::new(stage))],
        info,
        vertex_as_compute: None,
        geometry_as_compute: None,
        tf_enabled: false,
    })
}

/// Translates every present stage of a graphics program.
///
/// Stages are decoded last to first so each one can drop outputs the next never
/// reads, then translated first to last. `stage_code` supplies the guest code and
/// constant buffer 1 snapshot stored for each slot.
pub(crate) fn translate_graphics<T, A, F>(
    translator: &T,
    caps: &HostCapabilities,
    accessor: &mut A,
    request: &GraphicsTranslationRequest,
    mut stage_code: F,
) -> Result<ProgramTranslation>
where
    T: ShaderTranslator,
    A: ProgramGpuAccessor,
    F: FnMut(usize, &T::Context) -> (Arc<[u8]>, Arc<[u8]>),
{
    let tf_enabled = request.tf_enabled;
    let options =
        TranslationOptions::new(caps.target_language(), caps.api, TranslationFlags::empty());
    accessor.set_reservations(ResourceReservations::for_stages(caps, tf_enabled, false));

    let mut contexts: [Option<T::Context>; GRAPHICS_STAGE_SLOTS] = std::array::from_fn(|_| None);
    let mut next_slot: Option<usize> = None;
    for slot in (1..GRAPHICS_STAGE_SLOTS).rev() {
        let Some(address) = request.stages[slot] else {
            continue;
        };
        let stage = ShaderStage::from_graphics_index(slot - 1);
        accessor.select_stage(slot);
        let mut context = translator
            .decode(accessor, options, address)
            .map_err(translation_error(stage, address))?;
        if let Some(next) = next_slot.and_then(|s| contexts[s].as_ref()) {
            translator.link_next_stage(&mut context, next);
        }
        contexts[slot] = Some(context);
        next_slot = Some(slot);
    }

    let vertex_a = match request.stages[0] {
        Some(address) if contexts[1].is_some() => {
            accessor.select_stage(0);
            let options = TranslationOptions {
                flags: TranslationFlags::VERTEX_A,
                ..options
            };
            let context = translator
                .decode(accessor, options, address)
                .map_err(translation_error(ShaderStage::Vertex, address))?;
            Some(context)
        }
        _ => None,
    };

    let (vertex_to_compute, geometry_to_compute) = stages_to_compute(
        caps,
        contexts[1].as_ref().map(DecodedShader::has_store),
        contexts[GEOMETRY_STAGE_INDEX + 1]
            .as_ref()
            .map(DecodedShader::has_store),
    );
    let reservations = ResourceReservations::for_stages(caps, tf_enabled, vertex_to_compute);
    let compute_reservations = ResourceReservations::for_stages(caps, tf_enabled, true);
    accessor.set_reservations(reservations);

    let mut builder = ShaderInfoBuilder::new(caps, tf_enabled, vertex_to_compute, false);
    let mut sources = Vec::with_capacity(GRAPHICS_STAGES);
    let mut shaders: Vec<Option<Arc<CachedShaderStage>>> = vec![None; GRAPHICS_STAGE_SLOTS];
    let mut vertex_as_compute = None;
    let mut geometry_as_compute = None;
    let mut previous_slot: Option<usize> = None;

    for stage_index in 0..GRAPHICS_STAGES {
        let slot = stage_index + 1;
        let stage = ShaderStage::from_graphics_index(stage_index);
        let address = request.stages[slot].unwrap_or(0);

        let Some(context) = contexts[slot].as_ref() else {
            let previous = previous_slot.and_then(|s| contexts[s].as_ref());
            if let Some(previous) = previous.filter(|p| {
                stage_index == GEOMETRY_STAGE_INDEX
                    && p.layer_output_written()
                    && !caps.supports_layer_vertex_tessellation
            }) {
                accessor.select_stage(slot);
                let passthrough = translator
                    .geometry_passthrough(accessor, previous)
                    .map_err(translation_error(ShaderStage::Geometry, 0))?;
                sources.push(passthrough.source());
            }
            continue;
        };

        let as_compute = (stage_index == 0 && vertex_to_compute)
            || (stage_index == GEOMETRY_STAGE_INDEX && geometry_to_compute);
        let merged = if stage_index == 0 { vertex_a.as_ref() } else { None };

        accessor.select_stage(slot);
        let mut program = translator
            .translate(accessor, context, merged, as_compute)
            .map_err(translation_error(stage, address))?;

        if let Some(vertex_a) = merged {
            let (code, cb1_data) = stage_code(0, vertex_a);
            shaders[0] = Some(Arc::new(CachedShaderStage::new(None, code, cb1_data)));
        }
        let (code, cb1_data) = stage_code(slot, context);
        shaders[slot] = Some(Arc::new(CachedShaderStage::new(
            Some(program.info.clone()),
            code,
            cb1_data,
        )));

        if as_compute && stage_index == 0 {
            let last = if geometry_to_compute {
                contexts[GEOMETRY_STAGE_INDEX + 1].as_ref().unwrap_or(context)
            } else {
                context
            };
            let passthrough = translator
                .vertex_passthrough_for_compute(accessor, last)
                .map_err(translation_error(stage, address))?;
            vertex_as_compute = Some(TranslatedAsCompute {
                program: mem::replace(&mut program, passthrough),
                reservations: compute_reservations,
            });
        } else if as_compute {
            geometry_as_compute = Some(TranslatedAsCompute {
                program,
                reservations: compute_reservations,
            });
            previous_slot = Some(slot);
            continue;
        }

        builder.add_stage_info(&program.info, false);
        sources.push(program.source());
        previous_slot = Some(slot);
    }

    Ok(ProgramTranslation {
        sources,
        shaders,
        info: builder.build(request.pipeline, request.from_cache),
        vertex_as_compute,
        geometry_as_compute,
        tf_enabled,
    })
}

/// Hands a translation to the host and wraps the result for the cache.
pub(crate) fn create_host_program<R: Renderer>(
    renderer: &R,
    translation: ProgramTranslation,
    specialization: ShaderSpecializationState,
) -> Program<R> {
    let ProgramTranslation {
        sources,
        shaders,
        info,
        vertex_as_compute,
        geometry_as_compute,
        tf_enabled,
    } = translation;
    let caps = renderer.capabilities();

    let host_program = renderer.create_program(&sources, &info);
    let as_compute = |translated: TranslatedAsCompute| {
        let source = ShaderSource {
            stage: ShaderStage::Compute,
            ..translated.program.source()
        };
        let info = ShaderInfoBuilder::build_for_vertex_as_compute(
            caps,
            &translated.program.info,
            tf_enabled,
        );
        ShaderAsCompute {
            host_program: renderer.create_program(&[source], &info),
            info: translated.program.info,
            reservations: translated.reservations,
        }
    };
    let vertex_as_compute = vertex_as_compute.map(as_compute);
    let geometry_as_compute = geometry_as_compute.map(as_compute);

    CachedShaderProgram::new(host_program, specialization, shaders, info)
        .with_compute_stages(vertex_as_compute, geometry_as_compute)
}

/// Guest code and constant buffer 1 snapshot of one stage, read from the
/// channel unless the content tables already hold the code at that length.
fn live_stage_code(
    channel: &dyn GpuChannel,
    known_code: Option<&Arc<[u8]>>,
    is_compute: bool,
    stage_index: usize,
    address: u64,
    code_size: usize,
    cb1_size: usize,
) -> (Arc<[u8]>, Arc<[u8]>) {
    let code = match known_code {
        Some(code) if code.len() == code_size => code.clone(),
        _ => Arc::from(ShaderCodeAccessor::new(channel.memory(), address).get_span(0, code_size)),
    };

    let bounds = channel.uniform_buffer_bounds(is_compute, stage_index, 1);
    let cb1_data = if bounds.gpu_va == 0 || cb1_size == 0 {
        Arc::from(&[][..])
    } else {
        let len = (cb1_size as u64).min(bounds.size) as usize;
        Arc::from(channel.memory().get_span(bounds.gpu_va, len))
    };
    (code, cb1_data)
}

fn link_failed<P: HostProgram>(program: &CachedShaderProgram<P>) -> bool {
    let failed = |p: &P| p.check_link_status(false) == ProgramLinkStatus::Failure;
    failed(&program.host_program)
        || program
            .vertex_as_compute
            .as_ref()
            .is_some_and(|c| failed(&c.host_program))
        || program
            .geometry_as_compute
            .as_ref()
            .is_some_and(|c| failed(&c.host_program))
}

fn compute_matches<P>(
    program: &CachedShaderProgram<P>,
    channel: &dyn GpuChannel,
    pool: &GpuChannelPoolState,
    compute: &GpuChannelComputeState,
) -> bool {
    program
        .specialization_state
        .matches_compute(channel, pool, compute, true)
}

fn graphics_matches<P>(
    program: &CachedShaderProgram<P>,
    channel: &dyn GpuChannel,
    caps: &HostCapabilities,
    pool: &GpuChannelPoolState,
    graphics: &GpuChannelGraphicsState,
    transform_feedback: Option<&[TransformFeedbackDescriptor]>,
) -> bool {
    let uses_draw_parameters = program
        .stage(1)
        .and_then(|stage| stage.info.as_ref())
        .is_some_and(|info| info.uses_draw_parameters);
    let options = GraphicsMatchOptions {
        vertex_as_compute: program.vertex_as_compute.is_some(),
        uses_draw_parameters,
        check_textures: true,
    };
    program.specialization_state.matches_graphics(
        channel,
        caps,
        pool,
        graphics,
        transform_feedback,
        options,
    )
}

/// A program waiting for its host link to conclude before it is persisted.
struct ProgramToSave<P> {
    program: Arc<CachedShaderProgram<P>>,
    /// Packed sources for hosts without program binaries. `None` means the
    /// host binary is read once linking succeeded.
    binary: Option<Vec<u8>>,
}

pub struct ShaderCache<T: ShaderTranslator, R: Renderer> {
    translator: T,
    renderer: R,
    config: ShaderCacheConfig,

    compute_programs: HashMap<u64, Arc<Program<R>>>,
    graphics_programs: HashMap<ShaderAddresses, Arc<Program<R>>>,
    compute_table: ComputeShaderCacheHashTable<R::Program>,
    graphics_table: ShaderCacheHashTable<R::Program>,

    disk_enabled: bool,
    program_queue: VecDeque<ProgramToSave<R::Program>>,
    disk_storage: Option<DiskCacheHostStorage>,
    disk_writer: Option<BackgroundDiskCacheWriter>,

    stats: ShaderCacheStats,
}

impl<T: ShaderTranslator, R: Renderer> ShaderCache<T, R> {
    /// Creates the cache. With the disk cache enabled the cache directory is
    /// created here, so an unusable path is reported before any lookup.
    pub fn new(config: ShaderCacheConfig, translator: T, renderer: R) -> Result<Self> {
        let disk_storage = match config.disk_cache_path() {
            Some(path) => {
                let storage = DiskCacheHostStorage::new(path.clone(), renderer.capabilities());
                storage.create_directory()?;
                Some(storage)
            }
            None => None,
        };

        Ok(Self {
            translator,
            renderer,
            config,
            compute_programs: HashMap::new(),
            graphics_programs: HashMap::new(),
            compute_table: ComputeShaderCacheHashTable::new(),
            graphics_table: ShaderCacheHashTable::new(),
            disk_enabled: disk_storage.is_some(),
            program_queue: VecDeque::new(),
            disk_storage,
            disk_writer: None,
            stats: ShaderCacheStats::default(),
        })
    }

    pub fn translator(&self) -> &T {
        &self.translator
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn stats(&self) -> ShaderCacheStats {
        self.stats
    }

    /// Number of compute variants cached for `code`.
    pub fn compute_variants(&self, code: &[u8]) -> usize {
        self.compute_table.variants(code)
    }

    /// Number of graphics variants cached for the given per-slot code.
    pub fn graphics_variants(&self, code: &[Option<&[u8]>; GRAPHICS_STAGE_SLOTS]) -> usize {
        self.graphics_table.variants(code)
    }

    /// Programs queued for the disk cache whose host link is still pending.
    pub fn pending_disk_writes(&self) -> usize {
        self.program_queue.len()
    }

    /// Blocks until the background writer has stored everything handed to it.
    pub fn flush_disk_writes(&self) {
        if let Some(writer) = &self.disk_writer {
            writer.flush();
        }
    }

    pub fn get_compute_program(
        &mut self,
        channel: &dyn GpuChannel,
        pool: &GpuChannelPoolState,
        compute: &GpuChannelComputeState,
        gpu_va: u64,
    ) -> Result<Arc<Program<R>>> {
        if let Some(program) = self.compute_programs.get(&gpu_va).cloned() {
            let code_matches = program
                .stage(0)
                .is_some_and(|stage| memory_matches(channel.memory(), gpu_va, &stage.code));
            if code_matches
                && compute_matches(&program, channel, pool, compute)
                && self.accept(&program)
            {
                ShaderCacheStats::inc(&mut self.stats.direct_hits);
                return Ok(program);
            }
        }

        let lookup = self
            .compute_table
            .try_find(channel, gpu_va, |p| compute_matches(p, channel, pool, compute));
        if let Some(program) = lookup.program {
            if self.accept(&program) {
                ShaderCacheStats::inc(&mut self.stats.content_hits);
                self.compute_programs.insert(gpu_va, program.clone());
                return Ok(program);
            }
        }

        debug!(address = format_args!("0x{gpu_va:x}"), "translating compute shader");
        let caps = self.renderer.capabilities();
        let mut specialization = ShaderSpecializationState::new_compute(*compute);
        let mut counts = ResourceCounts::default();
        let base = GpuAccessorBase::new(
            caps,
            &mut counts,
            ResourceReservations::for_stages(caps, false, false),
            0,
            &mut specialization,
        );
        let mut accessor = ChannelGpuAccessor::new(base, channel, *pool);
        let translation =
            translate_compute(&self.translator, caps, &mut accessor, gpu_va, false, |context| {
                live_stage_code(
                    channel,
                    lookup.guest_code.as_ref(),
                    true,
                    0,
                    gpu_va,
                    context.size(),
                    context.cb1_data_size(),
                )
            })?;
        drop(accessor);

        let sources = translation.sources.clone();
        let program = Arc::new(create_host_program(
            &self.renderer,
            translation,
            specialization,
        ));
        ShaderCacheStats::inc(&mut self.stats.translations);

        self.compute_table.add(program.clone());
        self.compute_programs.insert(gpu_va, program.clone());
        self.enqueue_program_to_save(&program, &sources);
        Ok(program)
    }

    /// Returns the program for the stages bound at `addresses`. On a miss,
    /// `pipeline` is refreshed from `engine` before it is baked into the new
    /// program.
    pub fn get_graphics_program(
        &mut self,
        engine: &GraphicsEngineState,
        pipeline: &mut ProgramPipelineState,
        channel: &dyn GpuChannel,
        pool: &GpuChannelPoolState,
        graphics: &GpuChannelGraphicsState,
        addresses: ShaderAddresses,
    ) -> Result<Arc<Program<R>>> {
        let transform_feedback = engine.transform_feedback_descriptors();
        let address_array = addresses.as_array();

        if let Some(program) = self.graphics_programs.get(&addresses).cloned() {
            let code_matches = address_array.iter().enumerate().all(|(slot, &address)| {
                program
                    .stage(slot)
                    .map_or(true, |stage| memory_matches(channel.memory(), address, &stage.code))
            });
            if code_matches
                && graphics_matches(
                    &program,
                    channel,
                    self.renderer.capabilities(),
                    pool,
                    graphics,
                    transform_feedback,
                )
                && self.accept(&program)
            {
                ShaderCacheStats::inc(&mut self.stats.direct_hits);
                return Ok(program);
            }
        }

        let caps = self.renderer.capabilities();
        let lookup = self.graphics_table.try_find(channel, &addresses, |p| {
            graphics_matches(p, channel, caps, pool, graphics, transform_feedback)
        });
        if let Some(program) = lookup.program.clone() {
            if self.accept(&program) {
                ShaderCacheStats::inc(&mut self.stats.content_hits);
                self.graphics_programs.insert(addresses, program.clone());
                return Ok(program);
            }
        }

        debug!(
            vertex = format_args!("0x{:x}", addresses.vertex_b),
            fragment = format_args!("0x{:x}", addresses.fragment),
            "translating graphics shader"
        );
        engine.update_pipeline_info(pipeline);
        pipeline.topology = graphics.topology;

        let caps = self.renderer.capabilities();
        let tf_enabled = transform_feedback.is_some();
        let mut specialization =
            ShaderSpecializationState::new_graphics(*graphics, Some(*pipeline), transform_feedback);
        let mut counts = ResourceCounts::default();
        let base = GpuAccessorBase::new(
            caps,
            &mut counts,
            ResourceReservations::for_stages(caps, tf_enabled, false),
            0,
            &mut specialization,
        );
        let mut accessor = ChannelGpuAccessor::new(base, channel, *pool);
        let request = GraphicsTranslationRequest {
            stages: address_array.map(|address| (address != 0).then_some(address)),
            tf_enabled,
            pipeline: Some(*pipeline),
            from_cache: false,
        };
        let translation =
            translate_graphics(&self.translator, caps, &mut accessor, &request, |slot, context| {
                live_stage_code(
                    channel,
                    lookup.guest_code[slot].as_ref(),
                    false,
                    slot.saturating_sub(1),
                    address_array[slot],
                    context.size(),
                    context.cb1_data_size(),
                )
            })?;
        drop(accessor);

        let sources = translation.sources.clone();
        let program = Arc::new(create_host_program(
            &self.renderer,
            translation,
            specialization,
        ));
        ShaderCacheStats::inc(&mut self.stats.translations);

        self.graphics_table.add(program.clone());
        self.graphics_programs.insert(addresses, program.clone());
        self.enqueue_program_to_save(&program, &sources);
        Ok(program)
    }

    /// Applies the host compile failure policy to a cached program. Returns
    /// `false` after evicting a failed program so the caller retranslates it.
    fn accept(&mut self, program: &Arc<Program<R>>) -> bool {
        if self.config.retain_failed_programs || !link_failed(program) {
            return true;
        }

        warn!(
            compute = program.is_compute(),
            "host program failed to link, evicting it"
        );
        if program.is_compute() {
            self.compute_table.remove(program);
            self.compute_programs.retain(|_, p| !Arc::ptr_eq(p, program));
        } else {
            self.graphics_table.remove(program);
            self.graphics_programs.retain(|_, p| !Arc::ptr_eq(p, program));
        }
        ShaderCacheStats::inc(&mut self.stats.failed_program_evictions);
        false
    }

    fn enqueue_program_to_save(&mut self, program: &Arc<Program<R>>, sources: &[ShaderSource]) {
        // Programs with stages emulated as compute cannot be rebuilt from disk.
        if !self.disk_enabled || program.has_stage_as_compute() {
            return;
        }

        let binary = if self.renderer.capabilities().api == TargetApi::Vulkan {
            match binary_pack::pack(sources) {
                Ok(binary) => Some(binary),
                Err(err) => {
                    warn!(error = %err, "failed to pack shader sources for the disk cache");
                    return;
                }
            }
        } else {
            None
        };

        self.program_queue.push_back(ProgramToSave {
            program: program.clone(),
            binary,
        });
        ShaderCacheStats::inc(&mut self.stats.programs_queued_for_disk);
    }

    /// Persists queued programs whose host link has concluded, in queue order.
    ///
    /// Never blocks: draining stops at the first program still linking.
    /// Programs that failed to link are dropped.
    pub fn process_shader_cache_queue(&mut self) {
        while let Some(head) = self.program_queue.front() {
            let status = head.program.host_program.check_link_status(false);
            if status == ProgramLinkStatus::Incomplete {
                break;
            }
            let Some(entry) = self.program_queue.pop_front() else {
                break;
            };

            if status == ProgramLinkStatus::Failure {
                warn!("host program failed to link, not persisting it");
                ShaderCacheStats::inc(&mut self.stats.host_compile_failures);
                ShaderCacheStats::inc(&mut self.stats.programs_dropped_from_disk_queue);
                continue;
            }

            let host_binary = entry
                .binary
                .unwrap_or_else(|| entry.program.host_program.binary());
            let request = PersistRequest {
                stages: entry.program.shaders.clone(),
                specialization: entry.program.specialization_state.clone(),
                host_binary,
            };
            match self.writer() {
                Some(writer) => {
                    writer.add_shader(request);
                    ShaderCacheStats::inc(&mut self.stats.programs_persisted);
                }
                None => {
                    warn!("shader cache writer is unavailable, not persisting program");
                    ShaderCacheStats::inc(&mut self.stats.programs_dropped_from_disk_queue);
                }
            }
        }
    }

    /// Running writer, started on first use. The storage stays in place when
    /// the thread cannot be started, so a later drain tries again.
    fn writer(&mut self) -> Option<&BackgroundDiskCacheWriter> {
        if self.disk_writer.is_none() {
            let storage = self.disk_storage.take()?;
            match BackgroundDiskCacheWriter::spawn(storage) {
                Ok(writer) => self.disk_writer = Some(writer),
                Err((err, storage)) => {
                    warn!(error = %err, "failed to start the shader cache writer");
                    self.disk_storage = Some(storage);
                    return None;
                }
            }
        }
        self.disk_writer.as_ref()
    }

    /// Warms the cache from disk.
    ///
    /// Loaded programs go into the content tables only; the address maps fill
    /// on first use. A cancelled load keeps what was loaded so far. An
    /// unreadable cache is cleared and reported as one error in the summary.
    pub fn initialize(
        &mut self,
        cancel: &CancellationToken,
        progress: &mut dyn FnMut(ShaderCacheState, usize, usize),
    ) -> Result<DiskLoadSummary>
    where
        T: Sync,
    {
        let storage = self
            .disk_storage
            .take()
            .or_else(|| self.disk_writer.take().and_then(BackgroundDiskCacheWriter::finish));
        let Some(mut storage) = storage else {
            return Ok(DiskLoadSummary::default());
        };

        let compute_table = &mut self.compute_table;
        let graphics_table = &mut self.graphics_table;
        let result = loader::load(
            &mut storage,
            &self.translator,
            &self.renderer,
            cancel,
            progress,
            |program| {
                if program.is_compute() {
                    compute_table.add(program);
                } else {
                    graphics_table.add(program);
                }
            },
        );

        let summary = match result {
            Ok(summary) => summary,
            Err(err) => {
                warn!(
                    path = %storage.base_path().display(),
                    error = %err,
                    "shader cache is unreadable, clearing it"
                );
                storage.clear()?;
                DiskLoadSummary {
                    errors: 1,
                    ..DiskLoadSummary::default()
                }
            }
        };

        ShaderCacheStats::add(
            &mut self.stats.disk_programs_loaded,
            (summary.loaded + summary.recompiled) as u64,
        );
        ShaderCacheStats::add(&mut self.stats.disk_load_errors, summary.errors as u64);
        match BackgroundDiskCacheWriter::spawn(storage) {
            Ok(writer) => self.disk_writer = Some(writer),
            Err((err, storage)) => {
                self.disk_storage = Some(storage);
                return Err(err.into());
            }
        }

        info!(
            loaded = summary.loaded,
            recompiled = summary.recompiled,
            errors = summary.errors,
            cancelled = summary.cancelled,
            "shader cache loaded"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::ShaderProgramInfo;

    #[test]
    fn stores_in_vertex_stages_move_them_to_compute() {
        let mut caps = HostCapabilities::vulkan("test");
        assert_eq!(stages_to_compute(&caps, Some(true), Some(true)), (false, false));

        caps.supports_vertex_store_and_atomics = false;
        assert_eq!(stages_to_compute(&caps, Some(true), None), (true, false));
        assert_eq!(stages_to_compute(&caps, Some(false), None), (false, false));
        assert_eq!(stages_to_compute(&caps, Some(false), Some(true)), (true, true));
    }

    #[test]
    fn geometry_emulation_drags_vertex_along() {
        let mut caps = HostCapabilities::vulkan("test");
        caps.supports_geometry_shader = false;
        assert_eq!(stages_to_compute(&caps, Some(false), Some(false)), (true, true));
        assert_eq!(stages_to_compute(&caps, Some(false), None), (false, false));
        assert_eq!(stages_to_compute(&caps, None, Some(false)), (false, true));
    }

    #[test]
    fn failed_links_are_detected_on_any_program() {
        struct Link(ProgramLinkStatus);
        impl HostProgram for Link {
            fn check_link_status(&self, _blocking: bool) -> ProgramLinkStatus {
                self.0
            }
            fn binary(&self) -> Vec<u8> {
                Vec::new()
            }
        }

        let spec = ShaderSpecializationState::new_compute(GpuChannelComputeState::default());
        let program = CachedShaderProgram::new(
            Link(ProgramLinkStatus::Incomplete),
            spec,
            vec![None],
            ShaderInfo::default(),
        );
        assert!(!link_failed(&program));

        let program = program.with_compute_stages(
            Some(ShaderAsCompute {
                host_program: Link(ProgramLinkStatus::Failure),
                info: ShaderProgramInfo::new(ShaderStage::Compute),
                reservations: ResourceReservations::default(),
            }),
            None,
        );
        assert!(link_failed(&program));
    }
}
