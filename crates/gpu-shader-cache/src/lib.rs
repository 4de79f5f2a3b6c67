//! `gpu-shader-cache` maps guest GPU shader code to host shader programs.
//!
//! The crate provides:
//! - A three-tier in-memory cache (see [`ShaderCache`]) keyed by guest address,
//!   by guest code content and by the engine state each translation depended on.
//! - Specialization tracking (see [`specialization::ShaderSpecializationState`]),
//!   so state a shader never queried cannot cause a cache miss.
//! - A persistent disk cache with a background writer and a parallel warm start
//!   loader (see [`disk`]).
//!
//! Translation and host compilation are external: callers plug them in through
//! [`ShaderTranslator`] and [`Renderer`].

mod shader_cache;
mod stats;

pub mod accessor;
pub mod cache_table;
pub mod channel;
pub mod codec;
pub mod config;
pub mod disk;
pub mod engine_state;
pub mod error;
pub mod hash_table;
pub mod memory;
pub mod program;
pub mod renderer;
pub mod resources;
pub mod shader_info;
pub mod specialization;
pub mod translator;

pub use accessor::{GpuAccessor, ProgramGpuAccessor};
pub use channel::{BufferBounds, GpuChannel};
pub use config::{HostCapabilities, ShaderCacheConfig, TargetApi, TargetLanguage};
pub use disk::{CancellationToken, DiskLoadSummary, ShaderCacheState};
pub use error::{DiskCacheLoadError, Result, ShaderCacheError};
pub use memory::{GpuMemory, GpuMemoryError, VecGpuMemory};
pub use program::{CachedShaderProgram, ShaderAddresses, ShaderProgram, ShaderSource, ShaderStage};
pub use renderer::{HostProgram, ProgramLinkStatus, Renderer};
pub use shader_cache::ShaderCache;
pub use stats::ShaderCacheStats;
pub use translator::{
    DecodedShader, ShaderTranslator, TranslationError, TranslationFlags, TranslationOptions,
};
