mod common;

use std::fs;
use std::path::Path;

use common::{
    disk_cache, init_tracing, shader_code, TestCache, TestChannel, FLAG_LINK_FAILS,
    FLAG_QUERY_LOCAL_SIZE, FLAG_QUERY_TEXTURE,
};
use gpu_shader_cache::engine_state::{
    GpuChannelComputeState, GpuChannelGraphicsState, GpuChannelPoolState, GraphicsEngineState,
    ProgramPipelineState, TextureDescriptor, TextureTarget,
};
use gpu_shader_cache::{
    CancellationToken, DiskLoadSummary, HostCapabilities, ProgramLinkStatus, ShaderAddresses,
    ShaderCacheState,
};
use pretty_assertions::assert_eq;

const SHADER_VA: u64 = 0x1000;

fn compute_state() -> GpuChannelComputeState {
    GpuChannelComputeState {
        local_size_x: 64,
        local_size_y: 1,
        local_size_z: 1,
        ..Default::default()
    }
}

fn load_compute(cache: &mut TestCache, channel: &TestChannel, gpu_va: u64) {
    cache
        .get_compute_program(channel, &GpuChannelPoolState::default(), &compute_state(), gpu_va)
        .unwrap();
}

fn initialize(cache: &mut TestCache) -> DiskLoadSummary {
    cache
        .initialize(&CancellationToken::new(), &mut |_, _, _| {})
        .unwrap()
}

/// Translates `code` in a fresh cache and waits until it is on disk.
fn persist_compute(caps: &HostCapabilities, dir: &Path, code: &[u8]) {
    persist_compute_on(caps, dir, &TestChannel::new(0x4000), code);
}

fn persist_compute_on(caps: &HostCapabilities, dir: &Path, channel: &TestChannel, code: &[u8]) {
    let mut cache = disk_cache(caps.clone(), dir);
    channel.write(SHADER_VA, code);
    load_compute(&mut cache, channel, SHADER_VA);
    cache.process_shader_cache_queue();
    cache.flush_disk_writes();
    assert_eq!(cache.stats().programs_persisted, 1);
}

fn remove_host_cache(dir: &Path) {
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        if !name.starts_with("shared.") && !name.starts_with("guest.") {
            fs::remove_file(&path).unwrap();
        }
    }
}

#[test]
fn vulkan_programs_are_restored_from_packed_sources() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let caps = HostCapabilities::vulkan("test");
    let code = shader_code(FLAG_QUERY_LOCAL_SIZE, b"persisted");
    persist_compute(&caps, dir.path(), &code);

    let mut cache = disk_cache(caps, dir.path());
    let summary = initialize(&mut cache);
    assert_eq!(
        summary,
        DiskLoadSummary {
            loaded: 1,
            ..Default::default()
        }
    );
    assert_eq!(cache.compute_variants(&code), 1);
    assert_eq!(cache.stats().disk_programs_loaded, 1);

    let channel = TestChannel::new(0x4000);
    channel.write(0x2000, &code);
    load_compute(&mut cache, &channel, 0x2000);
    assert_eq!(cache.translator().translations(), 0);
    assert_eq!(cache.stats().content_hits, 1);
    assert_eq!(cache.renderer().loaded_from_binary(), 0);
}

#[test]
fn opengl_programs_are_restored_from_host_binaries() {
    let dir = tempfile::tempdir().unwrap();
    let caps = HostCapabilities::opengl("test");
    let code = shader_code(0, b"persisted");
    persist_compute(&caps, dir.path(), &code);

    let mut cache = disk_cache(caps, dir.path());
    let summary = initialize(&mut cache);
    assert_eq!(summary.loaded, 1);
    assert_eq!(cache.renderer().loaded_from_binary(), 1);

    let channel = TestChannel::new(0x4000);
    channel.write(SHADER_VA, &code);
    let program = cache
        .get_compute_program(
            &channel,
            &GpuChannelPoolState::default(),
            &compute_state(),
            SHADER_VA,
        )
        .unwrap();
    assert!(program.host_program.from_binary);
    assert_eq!(cache.translator().translations(), 0);
}

#[test]
fn missing_host_cache_rebuilds_from_guest_code() {
    let dir = tempfile::tempdir().unwrap();
    let caps = HostCapabilities::vulkan("test");
    let code = shader_code(FLAG_QUERY_LOCAL_SIZE, b"rebuild me");
    persist_compute(&caps, dir.path(), &code);
    remove_host_cache(dir.path());

    let mut cache = disk_cache(caps.clone(), dir.path());
    let summary = initialize(&mut cache);
    assert_eq!(summary.recompiled, 1);
    assert_eq!(summary.loaded, 0);
    assert_eq!(cache.translator().translations(), 1);

    // The replayed local size must match the one recorded at first translation.
    let channel = TestChannel::new(0x4000);
    channel.write(SHADER_VA, &code);
    load_compute(&mut cache, &channel, SHADER_VA);
    assert_eq!(cache.translator().translations(), 1);
    assert_eq!(cache.stats().content_hits, 1);
    drop(cache);

    // Packaging wrote a fresh host cache, so the next start loads directly.
    let mut cache = disk_cache(caps, dir.path());
    let summary = initialize(&mut cache);
    assert_eq!(summary.loaded, 1);
    assert_eq!(summary.recompiled, 0);
}

#[test]
fn graphics_programs_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let caps = HostCapabilities::vulkan("test");
    let vertex = shader_code(0, b"vertex");
    let fragment = shader_code(0, b"fragment");
    let channel = TestChannel::new(0x4000);
    channel.write(0x200, &vertex);
    channel.write(0x2000, &fragment);
    let addresses = ShaderAddresses {
        vertex_b: 0x200,
        fragment: 0x2000,
        ..Default::default()
    };
    let engine = GraphicsEngineState::default();
    let graphics = GpuChannelGraphicsState::default();
    let pool = GpuChannelPoolState::default();

    {
        let mut cache = disk_cache(caps.clone(), dir.path());
        let mut pipeline = ProgramPipelineState::default();
        cache
            .get_graphics_program(&engine, &mut pipeline, &channel, &pool, &graphics, addresses)
            .unwrap();
        cache.process_shader_cache_queue();
        cache.flush_disk_writes();
    }

    let mut cache = disk_cache(caps, dir.path());
    assert_eq!(initialize(&mut cache).loaded, 1);

    let mut pipeline = ProgramPipelineState::default();
    let program = cache
        .get_graphics_program(&engine, &mut pipeline, &channel, &pool, &graphics, addresses)
        .unwrap();
    assert_eq!(cache.translator().translations(), 0);
    assert!(program.info.from_cache);
    assert!(program.stage(1).unwrap().info.is_some());
    assert_eq!(&program.stage(5).unwrap().code[..], &fragment[..]);
}

#[test]
fn cancelled_load_reports_cancellation() {
    let dir = tempfile::tempdir().unwrap();
    let caps = HostCapabilities::vulkan("test");
    persist_compute(&caps, dir.path(), &shader_code(0, b"never loaded"));

    let mut cache = disk_cache(caps, dir.path());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut states = Vec::new();
    let summary = cache
        .initialize(&cancel, &mut |state, _, _| states.push(state))
        .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.loaded + summary.recompiled, 0);
    assert_eq!(states.first(), Some(&ShaderCacheState::Start));
    assert_eq!(states.last(), Some(&ShaderCacheState::Loaded));
    assert!(!states.contains(&ShaderCacheState::Packaging));
}

#[test]
fn cancelling_a_parent_token_stops_the_load() {
    let dir = tempfile::tempdir().unwrap();
    let caps = HostCapabilities::vulkan("test");
    persist_compute(&caps, dir.path(), &shader_code(0, b"never loaded"));

    let mut cache = disk_cache(caps, dir.path());
    let parent = CancellationToken::new();
    let cancel = parent.child_token();
    parent.cancel();
    let summary = cache.initialize(&cancel, &mut |_, _, _| {}).unwrap();

    assert!(summary.cancelled);
    assert_eq!(cache.compute_variants(&shader_code(0, b"never loaded")), 0);
}

#[test]
fn unreadable_cache_is_cleared_and_reported() {
    let dir = tempfile::tempdir().unwrap();
    let caps = HostCapabilities::vulkan("test");
    let code = shader_code(0, b"soon corrupt");
    persist_compute(&caps, dir.path(), &code);
    fs::write(dir.path().join("shared.toc"), b"not a table of contents").unwrap();

    let mut cache = disk_cache(caps, dir.path());
    let summary = initialize(&mut cache);
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.loaded, 0);
    assert_eq!(cache.stats().disk_load_errors, 1);
    assert!(!dir.path().join("guest.data").exists());

    let channel = TestChannel::new(0x4000);
    channel.write(SHADER_VA, &code);
    load_compute(&mut cache, &channel, SHADER_VA);
    assert_eq!(cache.translator().translations(), 1);
}

#[test]
fn queue_drains_in_order_once_links_complete() {
    let dir = tempfile::tempdir().unwrap();
    let mut cache = disk_cache(HostCapabilities::vulkan("test"), dir.path());
    let link = cache.renderer().link_control();
    link.set(ProgramLinkStatus::Incomplete);

    let channel = TestChannel::new(0x4000);
    channel.write(SHADER_VA, &shader_code(0, b"first"));
    channel.write(0x2000, &shader_code(0, b"second"));
    load_compute(&mut cache, &channel, SHADER_VA);
    load_compute(&mut cache, &channel, 0x2000);
    assert_eq!(cache.pending_disk_writes(), 2);

    cache.process_shader_cache_queue();
    assert_eq!(cache.pending_disk_writes(), 2);
    assert_eq!(cache.stats().programs_persisted, 0);

    link.set(ProgramLinkStatus::Success);
    cache.process_shader_cache_queue();
    cache.flush_disk_writes();
    assert_eq!(cache.pending_disk_writes(), 0);
    assert_eq!(cache.stats().programs_persisted, 2);
    drop(cache);

    let mut cache = disk_cache(HostCapabilities::vulkan("test"), dir.path());
    assert_eq!(initialize(&mut cache).loaded, 2);
}

#[test]
fn failed_links_are_not_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let mut cache = disk_cache(HostCapabilities::vulkan("test"), dir.path());
    let channel = TestChannel::new(0x4000);
    channel.write(SHADER_VA, &shader_code(FLAG_LINK_FAILS, b"bad link"));
    load_compute(&mut cache, &channel, SHADER_VA);
    assert_eq!(cache.pending_disk_writes(), 1);

    cache.process_shader_cache_queue();
    let stats = cache.stats();
    assert_eq!(cache.pending_disk_writes(), 0);
    assert_eq!(stats.host_compile_failures, 1);
    assert_eq!(stats.programs_dropped_from_disk_queue, 1);
    assert_eq!(stats.programs_persisted, 0);
    drop(cache);

    let mut cache = disk_cache(HostCapabilities::vulkan("test"), dir.path());
    assert_eq!(initialize(&mut cache), DiskLoadSummary::default());
}

const SAMPLED: TextureDescriptor = TextureDescriptor {
    format: 0x25,
    srgb: false,
    target: TextureTarget::Texture2D,
    coord_normalized: true,
};

/// Checks a restarted cache against the texture its program was built for.
fn assert_texture_specialization_holds(cache: &mut TestCache, code: &[u8]) {
    let channel = TestChannel::new(0x4000);
    channel.texture.set(Some(SAMPLED));
    channel.write(0x2000, code);
    let translations = cache.translator().translations();

    load_compute(cache, &channel, 0x2000);
    assert_eq!(cache.translator().translations(), translations);
    assert_eq!(cache.compute_variants(code), 1);

    channel.texture.set(Some(TextureDescriptor {
        target: TextureTarget::Texture2DArray,
        ..SAMPLED
    }));
    load_compute(cache, &channel, 0x2000);
    assert_eq!(cache.translator().translations(), translations + 1);
    assert_eq!(cache.compute_variants(code), 2);

    // An empty pool slot cannot contradict the recorded descriptor.
    channel.texture.set(None);
    load_compute(cache, &channel, 0x2000);
    assert_eq!(cache.translator().translations(), translations + 1);
}

#[test]
fn texture_specialization_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let caps = HostCapabilities::vulkan("test");
    let code = shader_code(FLAG_QUERY_TEXTURE, b"samples a texture");
    let channel = TestChannel::new(0x4000);
    channel.texture.set(Some(SAMPLED));
    persist_compute_on(&caps, dir.path(), &channel, &code);

    let mut cache = disk_cache(caps, dir.path());
    assert_eq!(initialize(&mut cache).loaded, 1);
    assert_texture_specialization_holds(&mut cache, &code);
}

#[test]
fn rebuilt_programs_replay_recorded_textures() {
    let dir = tempfile::tempdir().unwrap();
    let caps = HostCapabilities::vulkan("test");
    let code = shader_code(FLAG_QUERY_TEXTURE, b"samples a texture");
    let channel = TestChannel::new(0x4000);
    channel.texture.set(Some(SAMPLED));
    persist_compute_on(&caps, dir.path(), &channel, &code);
    remove_host_cache(dir.path());

    let mut cache = disk_cache(caps, dir.path());
    assert_eq!(initialize(&mut cache).recompiled, 1);
    assert_eq!(cache.translator().translations(), 1);
    assert_texture_specialization_holds(&mut cache, &code);
}

#[test]
fn repeated_initialize_does_not_duplicate_variants() {
    let dir = tempfile::tempdir().unwrap();
    let caps = HostCapabilities::vulkan("test");
    let code = shader_code(FLAG_QUERY_LOCAL_SIZE, b"loaded twice");
    persist_compute(&caps, dir.path(), &code);

    let mut cache = disk_cache(caps, dir.path());
    assert_eq!(initialize(&mut cache).loaded, 1);
    assert_eq!(initialize(&mut cache).loaded, 1);
    assert_eq!(cache.compute_variants(&code), 1);
    assert_eq!(cache.stats().disk_programs_loaded, 2);

    let channel = TestChannel::new(0x4000);
    channel.write(SHADER_VA, &code);
    load_compute(&mut cache, &channel, SHADER_VA);
    assert_eq!(cache.translator().translations(), 0);
    assert_eq!(cache.stats().content_hits, 1);
}
