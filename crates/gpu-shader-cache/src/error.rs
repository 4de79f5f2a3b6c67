use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::program::ShaderStage;
use crate::translator::TranslationError;

pub type Result<T> = std::result::Result<T, ShaderCacheError>;

#[derive(Debug, Error)]
pub enum ShaderCacheError {
    #[error("failed to translate {stage:?} shader at 0x{address:x}: {source}")]
    Translation {
        stage: ShaderStage,
        address: u64,
        #[source]
        source: TranslationError,
    },

    #[error("shader cache directory {path} is not accessible: {source}")]
    CacheDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("disk cache load failed: {0}")]
    DiskLoad(#[from] DiskCacheLoadError),
}

/// Errors raised while decoding the on-disk cache files.
#[derive(Debug, Error)]
pub enum DiskCacheLoadError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("out of memory allocating {len} bytes")]
    OutOfMemory { len: usize },

    #[error("invalid magic {found:#010x} (expected {expected:#010x})")]
    InvalidMagic { expected: u32, found: u32 },

    #[error("incompatible disk cache version {found:#x} (expected {expected:#x})")]
    IncompatibleVersion { expected: u32, found: u32 },

    #[error("corrupt disk cache: {0}")]
    Corrupt(&'static str),

    #[error("lz4 decompression failed: {0}")]
    Lz4Decompress(#[from] lz4_flex::block::DecompressError),
}

pub type DiskResult<T> = std::result::Result<T, DiskCacheLoadError>;
