//! Deduplicated guest code storage (`guest.toc` / `guest.data`).
//!
//! Each TOC entry is `offset: u64`, `code_size: u32`, `cb1_size: u32` and the
//! blake3 hash of both. The data file holds the code followed by the constant
//! buffer 1 snapshot.

use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hashbrown::HashMap;

use super::{append_file, read_optional, remove_if_exists, TocHeader, GUEST_TOC_MAGIC};
use crate::codec::{ReadLeExt, WriteLeExt};
use crate::error::{DiskCacheLoadError, DiskResult};

const TOC_ENTRY_SIZE: usize = 8 + 4 + 4 + 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuestCode {
    pub code: Arc<[u8]>,
    pub cb1_data: Arc<[u8]>,
}

struct TocEntry {
    offset: u64,
    code_size: u32,
    cb1_size: u32,
    hash: [u8; 32],
}

fn content_hash(code: &[u8], cb1_data: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(code.len() as u64).to_le_bytes());
    hasher.update(code);
    hasher.update(cb1_data);
    *hasher.finalize().as_bytes()
}

pub struct DiskCacheGuestStorage {
    toc_path: PathBuf,
    data_path: PathBuf,
    index: Option<HashMap<[u8; 32], u32>>,
}

impl DiskCacheGuestStorage {
    pub fn new(base_path: &Path) -> Self {
        Self {
            toc_path: base_path.join("guest.toc"),
            data_path: base_path.join("guest.data"),
            index: None,
        }
    }

    fn read_toc(&self) -> DiskResult<Vec<TocEntry>> {
        let Some(toc) = read_optional(&self.toc_path)? else {
            return Ok(Vec::new());
        };
        let mut r = Cursor::new(&toc[..]);
        TocHeader::read(&mut r, GUEST_TOC_MAGIC)?;
        let remaining = toc.len() - r.position() as usize;
        if remaining % TOC_ENTRY_SIZE != 0 {
            return Err(DiskCacheLoadError::Corrupt("guest toc has a partial entry"));
        }

        let mut entries = Vec::with_capacity(remaining / TOC_ENTRY_SIZE);
        for _ in 0..remaining / TOC_ENTRY_SIZE {
            let offset = r.read_u64_le()?;
            let code_size = r.read_u32_le()?;
            let cb1_size = r.read_u32_le()?;
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&r.read_exact_vec(32)?);
            entries.push(TocEntry {
                offset,
                code_size,
                cb1_size,
                hash,
            });
        }
        Ok(entries)
    }

    /// Loads every stored guest code entry, in index order.
    pub fn load_all(&self) -> DiskResult<Vec<GuestCode>> {
        let entries = self.read_toc()?;
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let data = read_optional(&self.data_path)?
            .ok_or(DiskCacheLoadError::Corrupt("guest data file is missing"))?;

        entries
            .iter()
            .map(|entry| {
                let start = usize::try_from(entry.offset)
                    .map_err(|_| DiskCacheLoadError::Corrupt("guest offset out of range"))?;
                let code_end = start
                    .checked_add(entry.code_size as usize)
                    .ok_or(DiskCacheLoadError::Corrupt("guest entry out of range"))?;
                let end = code_end
                    .checked_add(entry.cb1_size as usize)
                    .ok_or(DiskCacheLoadError::Corrupt("guest entry out of range"))?;
                let bytes = data
                    .get(start..end)
                    .ok_or(DiskCacheLoadError::Corrupt("guest entry past end of data"))?;
                let (code, cb1_data) = bytes.split_at(entry.code_size as usize);
                if content_hash(code, cb1_data) != entry.hash {
                    return Err(DiskCacheLoadError::Corrupt("guest entry hash mismatch"));
                }
                Ok(GuestCode {
                    code: Arc::from(code),
                    cb1_data: Arc::from(cb1_data),
                })
            })
            .collect()
    }

    fn ensure_index(&mut self) -> DiskResult<&mut HashMap<[u8; 32], u32>> {
        if self.index.is_none() {
            let entries = self.read_toc()?;
            if entries.is_empty() {
                let mut header = Vec::new();
                TocHeader::new(GUEST_TOC_MAGIC, 0).write(&mut header)?;
                remove_if_exists(&self.toc_path)?;
                remove_if_exists(&self.data_path)?;
                append_file(&self.toc_path, &header)?;
            }
            let index = entries
                .iter()
                .enumerate()
                .map(|(i, entry)| (entry.hash, i as u32))
                .collect();
            self.index = Some(index);
        }
        Ok(self.index.get_or_insert_with(HashMap::new))
    }

    /// Stores one stage's code, returning the index of the existing entry when
    /// identical content is already stored.
    pub fn add(&mut self, code: &[u8], cb1_data: &[u8]) -> DiskResult<u32> {
        let hash = content_hash(code, cb1_data);
        let data_path = self.data_path.clone();
        let toc_path = self.toc_path.clone();
        let index = self.ensure_index()?;
        if let Some(existing) = index.get(&hash) {
            return Ok(*existing);
        }

        let code_size = u32::try_from(code.len())
            .map_err(|_| DiskCacheLoadError::Corrupt("guest code too large"))?;
        let cb1_size = u32::try_from(cb1_data.len())
            .map_err(|_| DiskCacheLoadError::Corrupt("cb1 data too large"))?;

        let mut blob = Vec::with_capacity(code.len() + cb1_data.len());
        blob.extend_from_slice(code);
        blob.extend_from_slice(cb1_data);
        let offset = append_file(&data_path, &blob)?;

        let mut entry = Vec::with_capacity(TOC_ENTRY_SIZE);
        entry.write_u64_le(offset)?;
        entry.write_u32_le(code_size)?;
        entry.write_u32_le(cb1_size)?;
        entry.write_bytes(&hash)?;
        append_file(&toc_path, &entry)?;

        let id = index.len() as u32;
        index.insert(hash, id);
        Ok(id)
    }

    pub fn clear(&mut self) -> io::Result<()> {
        self.index = None;
        remove_if_exists(&self.toc_path)?;
        remove_if_exists(&self.data_path)
    }
}
