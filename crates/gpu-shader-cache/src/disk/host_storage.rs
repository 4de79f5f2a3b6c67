//! Shared program records and host binaries.
//!
//! `shared.toc` and `{api}_{vendor}.toc` hold a [`TocHeader`] followed by one
//! `u64` data offset per program. Both data files hold `u32 size` prefixed
//! lz4 blocks. The host files are indexed in parallel to the shared ones: host
//! entry `i` belongs to shared entry `i`.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::guest_storage::DiskCacheGuestStorage;
use super::{
    append_file, now_timestamp, read_optional, remove_if_exists, PersistRequest, TocHeader,
    CODEGEN_VERSION, HOST_TOC_MAGIC, SHARED_TOC_MAGIC,
};
use crate::codec::{ReadLeExt, SectionMagic, WriteLeExt};
use crate::config::HostCapabilities;
use crate::error::{DiskCacheLoadError, DiskResult, Result, ShaderCacheError};
use crate::program::{read_program_info, write_program_info, ShaderProgramInfo, GRAPHICS_STAGE_SLOTS};
use crate::specialization::ShaderSpecializationState;

/// Upper bound on one compressed record.
const MAX_RECORD_SIZE: u32 = 64 << 20;
const GRAPHICS_STAGE_MASK: u8 = (1 << GRAPHICS_STAGE_SLOTS) - 1;

/// One program as stored in the shared data file.
#[derive(Debug)]
pub(crate) struct SharedRecord {
    /// One entry for compute, [`GRAPHICS_STAGE_SLOTS`] entries for graphics.
    pub guest_indices: Vec<Option<u32>>,
    pub specialization: ShaderSpecializationState,
}

/// One program as stored in the host data file.
#[derive(Debug)]
pub(crate) struct HostRecord {
    /// Empty when the program has to be rebuilt from guest code.
    pub binary: Vec<u8>,
    pub infos: Vec<Option<ShaderProgramInfo>>,
}

/// A table of contents together with its data file, read fully into memory.
#[derive(Debug)]
pub(crate) struct LoadedToc {
    pub header: TocHeader,
    offsets: Vec<u64>,
    data: Vec<u8>,
}

impl LoadedToc {
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    fn payload(&self, index: usize) -> DiskResult<Vec<u8>> {
        let offset = *self
            .offsets
            .get(index)
            .ok_or(DiskCacheLoadError::Corrupt("record index out of range"))?;
        let start = usize::try_from(offset)
            .map_err(|_| DiskCacheLoadError::Corrupt("record offset out of range"))?;
        let bytes = self
            .data
            .get(start..)
            .ok_or(DiskCacheLoadError::Corrupt("record offset past end of data"))?;
        let compressed = Cursor::new(bytes).read_len_prefixed_bytes_u32(MAX_RECORD_SIZE)?;
        let uncompressed_size = compressed
            .get(..4)
            .map_or(0, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
        if uncompressed_size > MAX_RECORD_SIZE {
            return Err(DiskCacheLoadError::Corrupt("record too large"));
        }
        Ok(lz4_flex::decompress_size_prepended(&compressed)?)
    }

    pub fn shared_record(&self, index: usize) -> DiskResult<SharedRecord> {
        let payload = self.payload(index)?;
        let mut r = Cursor::new(&payload[..]);
        let stage_mask = r.read_u8()?;
        if stage_mask & !GRAPHICS_STAGE_MASK != 0 {
            return Err(DiskCacheLoadError::Corrupt("invalid stage mask"));
        }

        let guest_indices = if stage_mask == 0 {
            vec![Some(r.read_u32_le()?)]
        } else {
            (0..GRAPHICS_STAGE_SLOTS)
                .map(|slot| {
                    if stage_mask & (1 << slot) != 0 {
                        r.read_u32_le().map(Some)
                    } else {
                        Ok(None)
                    }
                })
                .collect::<DiskResult<_>>()?
        };

        let specialization = ShaderSpecializationState::read(&mut r)?;
        if specialization.is_compute() != (stage_mask == 0) {
            return Err(DiskCacheLoadError::Corrupt(
                "stage mask does not match specialization kind",
            ));
        }
        Ok(SharedRecord {
            guest_indices,
            specialization,
        })
    }

    pub fn host_record(&self, index: usize, slots: usize) -> DiskResult<HostRecord> {
        let payload = self.payload(index)?;
        let mut r = Cursor::new(&payload[..]);
        let binary = r.read_len_prefixed_bytes_u32(MAX_RECORD_SIZE)?;
        let info_mask = r.read_u8()?;
        if u32::from(info_mask) >> slots != 0 {
            return Err(DiskCacheLoadError::Corrupt("invalid program info mask"));
        }
        let infos = (0..slots)
            .map(|slot| {
                if info_mask & (1 << slot) != 0 {
                    read_program_info(&mut r).map(Some)
                } else {
                    Ok(None)
                }
            })
            .collect::<DiskResult<_>>()?;
        Ok(HostRecord { binary, infos })
    }
}

fn read_toc(toc_path: &Path, data_path: &Path, magic: SectionMagic) -> DiskResult<Option<LoadedToc>> {
    let Some(toc) = read_optional(toc_path)? else {
        return Ok(None);
    };
    let mut r = Cursor::new(&toc[..]);
    let header = TocHeader::read(&mut r, magic)?;
    let remaining = toc.len() - r.position() as usize;
    if remaining % 8 != 0 {
        return Err(DiskCacheLoadError::Corrupt("toc has a partial entry"));
    }
    let offsets = (0..remaining / 8)
        .map(|_| r.read_u64_le())
        .collect::<DiskResult<Vec<_>>>()?;
    let data = read_optional(data_path)?.unwrap_or_default();
    Ok(Some(LoadedToc {
        header,
        offsets,
        data,
    }))
}

fn compressed_record(payload: &[u8]) -> DiskResult<Vec<u8>> {
    let compressed = lz4_flex::compress_prepend_size(payload);
    let mut out = Vec::with_capacity(compressed.len() + 4);
    out.write_len_prefixed_bytes_u32(&compressed)?;
    Ok(out)
}

fn toc_entry_count(toc_path: &Path) -> DiskResult<u64> {
    let len = fs::metadata(toc_path)?.len();
    Ok(len.saturating_sub(TocHeader::SIZE) / 8)
}

pub struct DiskCacheHostStorage {
    base_path: PathBuf,
    host_name: String,
    guest: DiskCacheGuestStorage,
    /// Timestamp of the shared cache, once its header has been validated or written.
    shared_timestamp: Option<u64>,
}

impl DiskCacheHostStorage {
    pub fn new(base_path: impl Into<PathBuf>, caps: &HostCapabilities) -> Self {
        let base_path = base_path.into();
        Self {
            guest: DiskCacheGuestStorage::new(&base_path),
            host_name: caps.host_cache_file_name(),
            base_path,
            shared_timestamp: None,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn create_directory(&self) -> Result<()> {
        fs::create_dir_all(&self.base_path).map_err(|source| ShaderCacheError::CacheDirectory {
            path: self.base_path.clone(),
            source,
        })
    }

    fn shared_toc_path(&self) -> PathBuf {
        self.base_path.join("shared.toc")
    }

    fn shared_data_path(&self) -> PathBuf {
        self.base_path.join("shared.data")
    }

    fn host_toc_path(&self) -> PathBuf {
        self.base_path.join(format!("{}.toc", self.host_name))
    }

    fn host_data_path(&self) -> PathBuf {
        self.base_path.join(format!("{}.data", self.host_name))
    }

    pub fn guest(&self) -> &DiskCacheGuestStorage {
        &self.guest
    }

    pub(crate) fn load_shared(&self) -> DiskResult<Option<LoadedToc>> {
        read_toc(&self.shared_toc_path(), &self.shared_data_path(), SHARED_TOC_MAGIC)
    }

    /// Host cache matching the shared cache stamped with `shared_timestamp`.
    /// Anything unusable yields `None`; the shared cache stays valid.
    pub(crate) fn load_host(&self, shared_timestamp: u64) -> Option<LoadedToc> {
        match read_toc(&self.host_toc_path(), &self.host_data_path(), HOST_TOC_MAGIC) {
            Ok(Some(toc))
                if toc.header.codegen_version == CODEGEN_VERSION
                    && toc.header.timestamp == shared_timestamp =>
            {
                Some(toc)
            }
            Ok(Some(toc)) => {
                debug!(
                    codegen_version = toc.header.codegen_version,
                    timestamp = toc.header.timestamp,
                    "host shader cache is stale"
                );
                None
            }
            Ok(None) => None,
            Err(err) => {
                debug!(error = %err, "host shader cache is unreadable");
                None
            }
        }
    }

    /// Header of the shared cache, starting a fresh one when the existing
    /// files are missing or unusable.
    fn ensure_shared_header(&mut self) -> DiskResult<u64> {
        if let Some(timestamp) = self.shared_timestamp {
            return Ok(timestamp);
        }
        let toc_path = self.shared_toc_path();
        let existing = read_optional(&toc_path)?
            .and_then(|toc| TocHeader::read(&mut Cursor::new(&toc[..]), SHARED_TOC_MAGIC).ok());
        let timestamp = match existing {
            Some(header) => header.timestamp,
            None => {
                let header = TocHeader::new(SHARED_TOC_MAGIC, now_timestamp());
                self.reset_pair(&toc_path, &self.shared_data_path(), header)?;
                header.timestamp
            }
        };
        self.shared_timestamp = Some(timestamp);
        Ok(timestamp)
    }

    fn ensure_host_header(&self, shared_timestamp: u64) -> DiskResult<()> {
        let toc_path = self.host_toc_path();
        let valid = read_optional(&toc_path)?
            .and_then(|toc| TocHeader::read(&mut Cursor::new(&toc[..]), HOST_TOC_MAGIC).ok())
            .is_some_and(|header| {
                header.codegen_version == CODEGEN_VERSION && header.timestamp == shared_timestamp
            });
        if !valid {
            let header = TocHeader::new(HOST_TOC_MAGIC, shared_timestamp);
            self.reset_pair(&toc_path, &self.host_data_path(), header)?;
        }
        Ok(())
    }

    fn reset_pair(&self, toc_path: &Path, data_path: &Path, header: TocHeader) -> DiskResult<()> {
        remove_if_exists(toc_path)?;
        remove_if_exists(data_path)?;
        let mut bytes = Vec::with_capacity(TocHeader::SIZE as usize);
        header.write(&mut bytes)?;
        append_file(toc_path, &bytes)?;
        Ok(())
    }

    /// Appends one program to the shared cache, and to the host cache when the
    /// host cache is in step with the shared one.
    pub fn add_program(&mut self, request: &PersistRequest) -> DiskResult<()> {
        let mut shared = Vec::new();
        let stage_mask = if request.specialization.is_compute() {
            0
        } else {
            request
                .stages
                .iter()
                .enumerate()
                .filter(|(_, stage)| stage.is_some())
                .fold(0u8, |mask, (slot, _)| mask | (1 << slot))
        };
        if stage_mask & !GRAPHICS_STAGE_MASK != 0
            || (stage_mask == 0 && !request.specialization.is_compute())
        {
            return Err(DiskCacheLoadError::Corrupt("program has no valid stages"));
        }
        shared.write_u8(stage_mask)?;
        for stage in request.stages.iter().flatten() {
            let index = self.guest.add(&stage.code, &stage.cb1_data)?;
            shared.write_u32_le(index)?;
        }
        request.specialization.write(&mut shared)?;

        let timestamp = self.ensure_shared_header()?;
        let shared_toc = self.shared_toc_path();
        let shared_count = toc_entry_count(&shared_toc)?;
        let offset = append_file(&self.shared_data_path(), &compressed_record(&shared)?)?;
        append_file(&shared_toc, &offset.to_le_bytes())?;

        self.ensure_host_header(timestamp)?;
        let host_toc = self.host_toc_path();
        if toc_entry_count(&host_toc)? != shared_count {
            debug!(
                shared_count,
                "host shader cache is out of step, skipping host binary"
            );
            return Ok(());
        }

        let mut host = Vec::new();
        host.write_len_prefixed_bytes_u32(&request.host_binary)?;
        let info_mask = request
            .stages
            .iter()
            .enumerate()
            .filter(|(_, stage)| stage.as_ref().is_some_and(|s| s.info.is_some()))
            .fold(0u8, |mask, (slot, _)| mask | (1 << slot));
        host.write_u8(info_mask)?;
        for info in request.stages.iter().flatten().filter_map(|s| s.info.as_ref()) {
            write_program_info(&mut host, info)?;
        }
        let offset = append_file(&self.host_data_path(), &compressed_record(&host)?)?;
        append_file(&host_toc, &offset.to_le_bytes())?;
        Ok(())
    }

    /// Removes every cache file for this title and host.
    pub fn clear(&mut self) -> DiskResult<()> {
        self.shared_timestamp = None;
        self.guest.clear()?;
        remove_if_exists(&self.shared_toc_path())?;
        remove_if_exists(&self.shared_data_path())?;
        remove_if_exists(&self.host_toc_path())?;
        remove_if_exists(&self.host_data_path())?;
        Ok(())
    }

    /// Replaces the cache contents with `programs`, in order.
    pub fn rewrite<'a>(&mut self, programs: impl IntoIterator<Item = &'a PersistRequest>) -> DiskResult<()> {
        self.clear()?;
        for program in programs {
            self.add_program(program)?;
        }
        Ok(())
    }
}
