//! Persistent shader cache.
//!
//! Three file pairs live in the cache directory:
//!
//! - `guest.toc`/`guest.data`: guest code and constant buffer 1 snapshots,
//!   deduplicated by content hash.
//! - `shared.toc`/`shared.data`: one record per program naming its guest code
//!   and holding its specialization state. Valid on any host.
//! - `{api}_{vendor}.toc`/`.data`: host binaries indexed in parallel to the
//!   shared records. Only valid for the host that wrote them.

pub mod binary_pack;
pub mod guest_storage;
pub mod host_storage;
pub mod loader;
pub mod writer;

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::codec::{ReadLeExt, SectionMagic, WriteLeExt};
use crate::error::{DiskCacheLoadError, DiskResult};
use crate::program::CachedShaderStage;
use crate::specialization::ShaderSpecializationState;

pub use guest_storage::{DiskCacheGuestStorage, GuestCode};
pub use host_storage::DiskCacheHostStorage;
pub use loader::{DiskLoadSummary, ShaderCacheState};
pub use tokio_util::sync::CancellationToken;
pub use writer::BackgroundDiskCacheWriter;

/// Layout version of every cache file, major in the high half.
pub const FORMAT_VERSION: u32 = (1 << 16) | 2;

/// Version of the host code generator. A change invalidates host binaries only.
pub const CODEGEN_VERSION: u32 = 1;

pub(crate) const GUEST_TOC_MAGIC: SectionMagic = SectionMagic::from_tag(*b"GTOC");
pub(crate) const SHARED_TOC_MAGIC: SectionMagic = SectionMagic::from_tag(*b"STOC");
pub(crate) const HOST_TOC_MAGIC: SectionMagic = SectionMagic::from_tag(*b"HTOC");

/// Common header of every table of contents file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TocHeader {
    pub magic: u32,
    pub format_version: u32,
    pub codegen_version: u32,
    pub timestamp: u64,
}

impl TocHeader {
    pub const SIZE: u64 = 20;

    pub fn new(magic: SectionMagic, timestamp: u64) -> Self {
        Self {
            magic: magic.0,
            format_version: FORMAT_VERSION,
            codegen_version: CODEGEN_VERSION,
            timestamp,
        }
    }

    pub fn write<W: Write + ?Sized>(&self, w: &mut W) -> DiskResult<()> {
        w.write_u32_le(self.magic)?;
        w.write_u32_le(self.format_version)?;
        w.write_u32_le(self.codegen_version)?;
        w.write_u64_le(self.timestamp)
    }

    pub fn read<R: Read + ?Sized>(r: &mut R, magic: SectionMagic) -> DiskResult<Self> {
        let header = Self {
            magic: r.read_u32_le()?,
            format_version: r.read_u32_le()?,
            codegen_version: r.read_u32_le()?,
            timestamp: r.read_u64_le()?,
        };
        if header.magic != magic.0 {
            return Err(DiskCacheLoadError::InvalidMagic {
                expected: magic.0,
                found: header.magic,
            });
        }
        if header.format_version != FORMAT_VERSION {
            return Err(DiskCacheLoadError::IncompatibleVersion {
                expected: FORMAT_VERSION,
                found: header.format_version,
            });
        }
        Ok(header)
    }
}

/// Seconds since the unix epoch, stamped into new shared caches.
pub(crate) fn now_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Appends `bytes` and returns the offset they were written at.
pub(crate) fn append_file(path: &Path, bytes: &[u8]) -> io::Result<u64> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let offset = file.metadata()?.len();
    file.write_all(bytes)?;
    Ok(offset)
}

/// Reads a whole file, `None` when it does not exist.
pub(crate) fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

pub(crate) fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Everything the disk cache stores about one program.
#[derive(Clone, Debug)]
pub struct PersistRequest {
    /// One slot for compute, six for graphics.
    pub stages: Vec<Option<Arc<CachedShaderStage>>>,
    pub specialization: Arc<ShaderSpecializationState>,
    /// Host binary, empty when the program must be rebuilt from guest code.
    pub host_binary: Vec<u8>,
}
