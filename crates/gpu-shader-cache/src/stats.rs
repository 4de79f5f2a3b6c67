/// Snapshot of shader cache counters, suitable for profiling/telemetry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShaderCacheStats {
    /// Lookups answered by the address map after revalidating guest memory.
    pub direct_hits: u64,
    /// Lookups answered by the content tables.
    pub content_hits: u64,
    pub translations: u64,
    pub host_compile_failures: u64,
    /// Failed programs dropped from the in-memory tables to be rebuilt.
    pub failed_program_evictions: u64,

    pub programs_queued_for_disk: u64,
    pub programs_persisted: u64,
    pub programs_dropped_from_disk_queue: u64,

    pub disk_programs_loaded: u64,
    pub disk_load_errors: u64,
}

impl ShaderCacheStats {
    pub(crate) fn inc(counter: &mut u64) {
        *counter = counter.saturating_add(1);
    }

    pub(crate) fn add(counter: &mut u64, n: u64) {
        *counter = counter.saturating_add(n);
    }
}
