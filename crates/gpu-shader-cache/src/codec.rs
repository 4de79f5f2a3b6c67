//! Little-endian binary helpers and the magic-tagged section format.
//!
//! A section is `magic: u32`, `size: u32`, then `size` payload bytes. Readers
//! decode fields from the payload in order; fields past the end of a short
//! payload read as zero, and bytes left after the last known field are ignored.

use core::fmt;
use std::io::{Read, Write};

use crate::error::{DiskCacheLoadError, DiskResult};

/// Upper bound on a single section payload.
pub const MAX_SECTION_SIZE: u32 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionMagic(pub u32);

impl SectionMagic {
    pub const COMPUTE_STATE: SectionMagic = SectionMagic::from_tag(*b"COMS");
    pub const GRAPHICS_STATE: SectionMagic = SectionMagic::from_tag(*b"GFXS");
    pub const TRANSFORM_FEEDBACK: SectionMagic = SectionMagic::from_tag(*b"TFBD");
    pub const TEXTURE_KEY: SectionMagic = SectionMagic::from_tag(*b"TEXK");
    pub const TEXTURE_STATE: SectionMagic = SectionMagic::from_tag(*b"TEXS");
    pub const PIPELINE_STATE: SectionMagic = SectionMagic::from_tag(*b"PGPS");
    pub const SHADER_INFO: SectionMagic = SectionMagic::from_tag(*b"SHDI");
    pub const BUFFER_DESCRIPTOR: SectionMagic = SectionMagic::from_tag(*b"BUFD");
    pub const TEXTURE_DESCRIPTOR: SectionMagic = SectionMagic::from_tag(*b"TEXD");

    pub const fn from_tag(tag: [u8; 4]) -> Self {
        SectionMagic(u32::from_le_bytes(tag))
    }

    pub fn tag(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for SectionMagic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.tag() {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

pub trait WriteLeExt: Write {
    fn write_u8(&mut self, v: u8) -> DiskResult<()> {
        self.write_all(&[v])?;
        Ok(())
    }

    fn write_bool(&mut self, v: bool) -> DiskResult<()> {
        self.write_u8(v as u8)
    }

    fn write_u16_le(&mut self, v: u16) -> DiskResult<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_u32_le(&mut self, v: u32) -> DiskResult<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_i32_le(&mut self, v: i32) -> DiskResult<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_u64_le(&mut self, v: u64) -> DiskResult<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> DiskResult<()> {
        self.write_all(bytes)?;
        Ok(())
    }

    fn write_len_prefixed_bytes_u32(&mut self, bytes: &[u8]) -> DiskResult<()> {
        let len: u32 = bytes
            .len()
            .try_into()
            .map_err(|_| DiskCacheLoadError::Corrupt("length does not fit in u32"))?;
        self.write_u32_le(len)?;
        self.write_bytes(bytes)
    }

    fn write_section<S: Section>(&mut self, section: &S) -> DiskResult<()> {
        let mut payload = FieldWriter::default();
        section.encode(&mut payload);
        self.write_u32_le(S::MAGIC.0)?;
        self.write_len_prefixed_bytes_u32(&payload.into_inner())
    }
}

impl<T: Write + ?Sized> WriteLeExt for T {}

pub trait ReadLeExt: Read {
    fn read_u8(&mut self) -> DiskResult<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_bool(&mut self) -> DiskResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    fn read_u16_le(&mut self) -> DiskResult<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32_le(&mut self) -> DiskResult<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_i32_le(&mut self) -> DiskResult<i32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    fn read_u64_le(&mut self) -> DiskResult<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_exact_vec(&mut self, len: usize) -> DiskResult<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| DiskCacheLoadError::OutOfMemory { len })?;
        buf.resize(len, 0);
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_len_prefixed_bytes_u32(&mut self, max_len: u32) -> DiskResult<Vec<u8>> {
        let len = self.read_u32_le()?;
        if len > max_len {
            return Err(DiskCacheLoadError::Corrupt("length prefix too large"));
        }
        self.read_exact_vec(len as usize)
    }

    fn read_section<S: Section>(&mut self) -> DiskResult<S> {
        let magic = self.read_u32_le()?;
        if magic != S::MAGIC.0 {
            return Err(DiskCacheLoadError::InvalidMagic {
                expected: S::MAGIC.0,
                found: magic,
            });
        }
        let payload = self.read_len_prefixed_bytes_u32(MAX_SECTION_SIZE)?;
        Ok(S::decode(&mut FieldReader::new(&payload)))
    }
}

impl<T: Read + ?Sized> ReadLeExt for T {}

/// A record stored as one magic-tagged section.
pub trait Section: Sized {
    const MAGIC: SectionMagic;

    fn encode(&self, w: &mut FieldWriter);

    fn decode(r: &mut FieldReader<'_>) -> Self;
}

#[derive(Debug, Default)]
pub struct FieldWriter {
    buf: Vec<u8>,
}

impl FieldWriter {
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn f32(&mut self, v: f32) {
        self.u32(v.to_bits());
    }

    pub fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }
}

/// Cursor over a section payload. Reads past the end yield zeros.
#[derive(Debug)]
pub struct FieldReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        let start = self.pos.min(self.data.len());
        let end = self.pos.saturating_add(N).min(self.data.len());
        out[..end - start].copy_from_slice(&self.data[start..end]);
        self.pos = self.pos.saturating_add(N);
        out
    }

    pub fn u8(&mut self) -> u8 {
        self.array::<1>()[0]
    }

    pub fn bool(&mut self) -> bool {
        self.u8() != 0
    }

    pub fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.array())
    }

    pub fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.array())
    }

    pub fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.array())
    }

    pub fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.array())
    }

    pub fn f32(&mut self) -> f32 {
        f32::from_bits(self.u32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[derive(Debug, PartialEq)]
    struct Pair {
        a: u32,
        b: u16,
    }

    impl Section for Pair {
        const MAGIC: SectionMagic = SectionMagic::from_tag(*b"PAIR");

        fn encode(&self, w: &mut FieldWriter) {
            w.u32(self.a);
            w.u16(self.b);
        }

        fn decode(r: &mut FieldReader<'_>) -> Self {
            Self {
                a: r.u32(),
                b: r.u16(),
            }
        }
    }

    #[test]
    fn magic_is_little_endian_ascii() {
        assert_eq!(SectionMagic::COMPUTE_STATE.0, u32::from_le_bytes(*b"COMS"));
        assert_eq!(SectionMagic::GRAPHICS_STATE.to_string(), "GFXS");
    }

    #[test]
    fn short_section_zero_fills_trailing_fields() {
        let mut bytes = Vec::new();
        bytes.write_u32_le(Pair::MAGIC.0).unwrap();
        bytes.write_u32_le(4).unwrap();
        bytes.write_u32_le(0xdead_beef).unwrap();
        bytes.write_u8(0xAA).unwrap();

        let mut cursor = Cursor::new(bytes);
        let pair: Pair = cursor.read_section().unwrap();
        assert_eq!(pair, Pair { a: 0xdead_beef, b: 0 });
        // The byte after the section is untouched.
        assert_eq!(cursor.read_u8().unwrap(), 0xAA);
    }

    #[test]
    fn long_section_skips_unknown_trailing_bytes() {
        let mut bytes = Vec::new();
        bytes.write_u32_le(Pair::MAGIC.0).unwrap();
        bytes.write_u32_le(10).unwrap();
        bytes.write_u32_le(1).unwrap();
        bytes.write_u16_le(2).unwrap();
        bytes.write_u32_le(0xFFFF_FFFF).unwrap();
        bytes.write_u8(0x55).unwrap();

        let mut cursor = Cursor::new(bytes);
        let pair: Pair = cursor.read_section().unwrap();
        assert_eq!(pair, Pair { a: 1, b: 2 });
        assert_eq!(cursor.read_u8().unwrap(), 0x55);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut bytes = Vec::new();
        bytes.write_section(&Pair { a: 1, b: 2 }).unwrap();
        bytes[0] = b'X';
        let err = Cursor::new(bytes).read_section::<Pair>().unwrap_err();
        assert!(matches!(err, DiskCacheLoadError::InvalidMagic { .. }));
    }

    #[test]
    fn oversized_section_is_corrupt() {
        let mut bytes = Vec::new();
        bytes.write_u32_le(Pair::MAGIC.0).unwrap();
        bytes.write_u32_le(MAX_SECTION_SIZE + 1).unwrap();
        let err = Cursor::new(bytes).read_section::<Pair>().unwrap_err();
        assert!(matches!(err, DiskCacheLoadError::Corrupt(_)));
    }
}
