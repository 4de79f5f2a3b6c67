//! Packs the per-stage host code of a program into one host binary blob.
//!
//! Hosts without a native program binary format (SPIR-V targets) store this
//! blob in the host cache and rebuild the program from it on load.

use std::io::Cursor;

use crate::codec::{ReadLeExt, WriteLeExt};
use crate::config::TargetLanguage;
use crate::error::{DiskCacheLoadError, DiskResult};
use crate::program::{ShaderSource, ShaderStage};

const MAX_STAGE_CODE: u32 = 16 << 20;

pub fn pack(sources: &[ShaderSource]) -> DiskResult<Vec<u8>> {
    let mut out = Vec::new();
    let count = u8::try_from(sources.len())
        .map_err(|_| DiskCacheLoadError::Corrupt("too many program stages"))?;
    out.write_u8(count)?;
    for source in sources {
        out.write_u8(source.stage as u8)?;
        out.write_u8(source.language as u8)?;
        if source.binary.is_empty() {
            out.write_len_prefixed_bytes_u32(source.code.as_bytes())?;
        } else {
            out.write_len_prefixed_bytes_u32(&source.binary)?;
        }
    }
    Ok(out)
}

pub fn unpack(data: &[u8]) -> DiskResult<Vec<ShaderSource>> {
    let mut r = Cursor::new(data);
    let count = r.read_u8()?;
    let mut sources = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let stage = ShaderStage::from_u8(r.read_u8()?)
            .ok_or(DiskCacheLoadError::Corrupt("invalid shader stage"))?;
        let language = TargetLanguage::from_u8(r.read_u8()?)
            .ok_or(DiskCacheLoadError::Corrupt("invalid target language"))?;
        let bytes = r.read_len_prefixed_bytes_u32(MAX_STAGE_CODE)?;
        let (code, binary) = match language {
            TargetLanguage::Glsl => (
                String::from_utf8(bytes)
                    .map_err(|_| DiskCacheLoadError::Corrupt("host source is not utf-8"))?,
                Vec::new(),
            ),
            TargetLanguage::Spirv => (String::new(), bytes),
        };
        sources.push(ShaderSource {
            stage,
            language,
            code,
            binary,
        });
    }
    Ok(sources)
}
