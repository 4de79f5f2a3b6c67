//! Warm start: rebuilds cached programs from the disk cache.
//!
//! Entries with a usable host binary are loaded on the calling thread. The
//! rest are retranslated from their guest code on a small worker pool, with a
//! [`DiskCacheGpuAccessor`] replaying the specialization values recorded when
//! they were first translated. Host programs are always created on the calling
//! thread.

use std::num::NonZeroUsize;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::binary_pack;
use super::guest_storage::GuestCode;
use super::host_storage::{DiskCacheHostStorage, HostRecord, SharedRecord};
use super::PersistRequest;
use crate::accessor::{DiskCacheGpuAccessor, GpuAccessorBase};
use crate::config::{HostCapabilities, TargetApi};
use crate::error::{DiskCacheLoadError, DiskResult, Result};
use crate::program::{
    CachedShaderProgram, CachedShaderStage, ShaderProgramInfo, ShaderSource, GRAPHICS_STAGE_SLOTS,
};
use crate::renderer::{HostProgram, ProgramLinkStatus, Renderer};
use crate::resources::{ResourceCounts, ResourceReservations};
use crate::shader_cache::{
    create_host_program, translate_compute, translate_graphics, GraphicsTranslationRequest,
    ProgramTranslation,
};
use crate::shader_info::ShaderInfoBuilder;
use crate::specialization::ShaderSpecializationState;
use crate::translator::ShaderTranslator;

const MAX_WORKERS: usize = 8;

/// Progress of a disk cache load, reported with `(current, total)` counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderCacheState {
    Start,
    Loading,
    Packaging,
    Loaded,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiskLoadSummary {
    /// Programs created straight from a stored host binary.
    pub loaded: usize,
    /// Programs rebuilt from guest code.
    pub recompiled: usize,
    /// Entries skipped because they could not be read or rebuilt.
    pub errors: usize,
    pub cancelled: bool,
}

struct RecompileJob {
    index: usize,
    stages: Vec<Option<Arc<CachedShaderStage>>>,
    specialization: ShaderSpecializationState,
}

struct RecompileOutput {
    index: usize,
    result: Result<(ProgramTranslation, ShaderSpecializationState)>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn resolve_stages(
    record: &SharedRecord,
    guest: &[GuestCode],
    infos: Option<&[Option<ShaderProgramInfo>]>,
) -> DiskResult<Vec<Option<Arc<CachedShaderStage>>>> {
    record
        .guest_indices
        .iter()
        .enumerate()
        .map(|(slot, index)| {
            let Some(index) = index else {
                return Ok(None);
            };
            let code = guest
                .get(*index as usize)
                .ok_or(DiskCacheLoadError::Corrupt("guest code index out of range"))?;
            let info = infos.and_then(|infos| infos.get(slot).cloned().flatten());
            Ok(Some(Arc::new(CachedShaderStage::new(
                info,
                code.code.clone(),
                code.cb1_data.clone(),
            ))))
        })
        .collect()
}

/// Creates the host program of one entry from its stored binary. `None` means
/// the binary is unusable and the entry must be rebuilt.
fn load_host_binary<R: Renderer>(
    renderer: &R,
    record: &HostRecord,
    stages: Vec<Option<Arc<CachedShaderStage>>>,
    specialization: ShaderSpecializationState,
) -> Option<CachedShaderProgram<R::Program>> {
    let caps = renderer.capabilities();
    let tf_enabled = specialization.transform_feedback().is_some();
    let info = ShaderInfoBuilder::build_for_cache(
        caps,
        stages.iter().flatten().filter_map(|s| s.info.as_ref()),
        specialization.pipeline_state().copied(),
        tf_enabled,
    );

    let host_program = if caps.api == TargetApi::Vulkan {
        let sources = match binary_pack::unpack(&record.binary) {
            Ok(sources) => sources,
            Err(err) => {
                debug!(error = %err, "stored host code is unreadable");
                return None;
            }
        };
        renderer.create_program(&sources, &info)
    } else {
        let has_fragment_shader = stages
            .get(GRAPHICS_STAGE_SLOTS - 1)
            .is_some_and(|s| s.as_ref().is_some_and(|s| s.info.is_some()));
        renderer.load_program_binary(&record.binary, has_fragment_shader, &info)
    };

    if host_program.check_link_status(true) != ProgramLinkStatus::Success {
        debug!("stored host binary failed to link");
        return None;
    }
    Some(CachedShaderProgram::new(
        host_program,
        specialization,
        stages,
        info,
    ))
}

fn recompile<T: ShaderTranslator>(
    translator: &T,
    caps: &HostCapabilities,
    job: &RecompileJob,
) -> Result<(ProgramTranslation, ShaderSpecializationState)> {
    let recorded = &job.specialization;
    let tf_enabled = recorded.transform_feedback().is_some();
    let mut specialization = if recorded.is_compute() {
        ShaderSpecializationState::new_compute(*recorded.compute_state())
    } else {
        ShaderSpecializationState::new_graphics(
            *recorded.graphics_state(),
            recorded.pipeline_state().copied(),
            recorded.transform_feedback(),
        )
    };

    let mut counts = ResourceCounts::default();
    let base = GpuAccessorBase::new(
        caps,
        &mut counts,
        ResourceReservations::for_stages(caps, tf_enabled, false),
        0,
        &mut specialization,
    );
    let mut accessor = DiskCacheGpuAccessor::new(base, &job.stages, recorded);
    let stage_code = |slot: usize| {
        job.stages
            .get(slot)
            .and_then(Option::as_ref)
            .map_or_else(
                || (Arc::from(&[][..]), Arc::from(&[][..])),
                |stage| (stage.code.clone(), stage.cb1_data.clone()),
            )
    };

    let translation = if recorded.is_compute() {
        translate_compute(translator, caps, &mut accessor, 0, true, |_| stage_code(0))?
    } else {
        let mut stages = [None; GRAPHICS_STAGE_SLOTS];
        for (slot, present) in stages.iter_mut().enumerate() {
            if job.stages.get(slot).is_some_and(Option::is_some) {
                *present = Some(0);
            }
        }
        let request = GraphicsTranslationRequest {
            stages,
            tf_enabled,
            pipeline: recorded.pipeline_state().copied(),
            from_cache: true,
        };
        translate_graphics(translator, caps, &mut accessor, &request, |slot, _| {
            stage_code(slot)
        })?
    };
    drop(accessor);
    Ok((translation, specialization))
}

/// Host binary to store for a rebuilt program. Empty means rebuild next time.
fn packaged_binary<P: HostProgram>(
    caps: &HostCapabilities,
    program: &CachedShaderProgram<P>,
    sources: &[ShaderSource],
) -> Vec<u8> {
    if program.has_stage_as_compute() {
        return Vec::new();
    }
    if caps.api == TargetApi::Vulkan {
        return binary_pack::pack(sources).unwrap_or_default();
    }
    match program.host_program.check_link_status(true) {
        ProgramLinkStatus::Success => program.host_program.binary(),
        _ => Vec::new(),
    }
}

fn persist_request<P>(program: &CachedShaderProgram<P>, host_binary: Vec<u8>) -> PersistRequest {
    PersistRequest {
        stages: program.shaders.clone(),
        specialization: program.specialization_state.clone(),
        host_binary,
    }
}

/// Loads every stored program and hands it to `insert`.
///
/// Only unreadable cache files are reported as errors; they leave the cache
/// unusable and the caller is expected to clear it. Bad entries are counted in
/// the summary and dropped by the packaging pass.
pub(crate) fn load<T, R>(
    storage: &mut DiskCacheHostStorage,
    translator: &T,
    renderer: &R,
    cancel: &CancellationToken,
    progress: &mut dyn FnMut(ShaderCacheState, usize, usize),
    mut insert: impl FnMut(Arc<CachedShaderProgram<R::Program>>),
) -> DiskResult<DiskLoadSummary>
where
    T: ShaderTranslator + Sync,
    R: Renderer,
{
    let caps = renderer.capabilities();
    let mut summary = DiskLoadSummary::default();
    progress(ShaderCacheState::Start, 0, 0);

    let Some(shared) = storage.load_shared()? else {
        progress(ShaderCacheState::Loaded, 0, 0);
        return Ok(summary);
    };
    let guest = storage.guest().load_all()?;
    let host = storage.load_host(shared.header.timestamp);
    let host_in_step = host.as_ref().is_some_and(|h| h.len() == shared.len());

    let total = shared.len();
    let mut processed = 0usize;
    let mut packaged: Vec<Option<PersistRequest>> = vec![None; total];
    let mut jobs = Vec::new();
    progress(ShaderCacheState::Loading, 0, total);

    for index in 0..total {
        if cancel.is_cancelled() {
            summary.cancelled = true;
            break;
        }

        let record = match shared.shared_record(index) {
            Ok(record) => record,
            Err(err) => {
                warn!(index, error = %err, "skipping unreadable shader cache entry");
                summary.errors += 1;
                processed += 1;
                continue;
            }
        };
        let slots = record.guest_indices.len();

        let host_record = host
            .as_ref()
            .filter(|host| index < host.len())
            .and_then(|host| match host.host_record(index, slots) {
                Ok(record) => Some(record),
                Err(err) => {
                    debug!(index, error = %err, "unreadable host cache entry");
                    None
                }
            });

        let stages = match resolve_stages(
            &record,
            &guest,
            host_record.as_ref().map(|r| r.infos.as_slice()),
        ) {
            Ok(stages) => stages,
            Err(err) => {
                warn!(index, error = %err, "skipping unreadable shader cache entry");
                summary.errors += 1;
                processed += 1;
                continue;
            }
        };

        if let Some(host_record) = host_record.filter(|r| !r.binary.is_empty()) {
            if let Some(program) = load_host_binary(
                renderer,
                &host_record,
                stages.clone(),
                record.specialization.clone(),
            ) {
                packaged[index] = Some(persist_request(&program, host_record.binary));
                insert(Arc::new(program));
                summary.loaded += 1;
                processed += 1;
                progress(ShaderCacheState::Loading, processed, total);
                continue;
            }
        }

        let stages = stages
            .into_iter()
            .map(|stage| {
                stage.map(|s| {
                    Arc::new(CachedShaderStage::new(None, s.code.clone(), s.cb1_data.clone()))
                })
            })
            .collect();
        jobs.push(RecompileJob {
            index,
            stages,
            specialization: record.specialization,
        });
    }

    if !jobs.is_empty() && !summary.cancelled {
        let worker_count = thread::available_parallelism()
            .map_or(1, NonZeroUsize::get)
            .min(MAX_WORKERS)
            .min(jobs.len());
        let (job_sender, job_receiver) = mpsc::sync_channel::<RecompileJob>(worker_count);
        let job_receiver = Mutex::new(job_receiver);
        let (output_sender, output_receiver) = mpsc::channel::<RecompileOutput>();

        thread::scope(|scope| {
            for _ in 0..worker_count {
                let output_sender = output_sender.clone();
                let job_receiver = &job_receiver;
                scope.spawn(move || loop {
                    let job = lock(job_receiver).recv();
                    let Ok(job) = job else {
                        break;
                    };
                    if cancel.is_cancelled() {
                        continue;
                    }
                    let result = recompile(translator, caps, &job);
                    let output = RecompileOutput {
                        index: job.index,
                        result,
                    };
                    if output_sender.send(output).is_err() {
                        break;
                    }
                });
            }
            drop(output_sender);

            let mut handle = |output: RecompileOutput| {
                processed += 1;
                match output.result {
                    Ok((translation, specialization)) => {
                        let sources = translation.sources.clone();
                        let program = create_host_program(renderer, translation, specialization);
                        let binary = packaged_binary(caps, &program, &sources);
                        packaged[output.index] = Some(persist_request(&program, binary));
                        insert(Arc::new(program));
                        summary.recompiled += 1;
                    }
                    Err(err) => {
                        warn!(index = output.index, error = %err, "failed to rebuild cached shader");
                        summary.errors += 1;
                    }
                }
                progress(ShaderCacheState::Loading, processed, total);
            };

            for job in jobs {
                if cancel.is_cancelled() {
                    break;
                }
                if job_sender.send(job).is_err() {
                    break;
                }
                while let Ok(output) = output_receiver.try_recv() {
                    handle(output);
                }
            }
            drop(job_sender);
            for output in output_receiver {
                handle(output);
            }
        });
    }

    if cancel.is_cancelled() {
        summary.cancelled = true;
    }

    let needs_packaging = summary.recompiled > 0 || summary.errors > 0 || !host_in_step;
    if needs_packaging && !summary.cancelled {
        let requests: Vec<&PersistRequest> = packaged.iter().flatten().collect();
        progress(ShaderCacheState::Packaging, 0, requests.len());
        storage.rewrite(requests.iter().copied())?;
        progress(ShaderCacheState::Packaging, requests.len(), requests.len());
    }

    progress(ShaderCacheState::Loaded, processed, total);
    Ok(summary)
}
