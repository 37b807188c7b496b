//! Host-side byte sources: flat memory images and ELF/PE files.

use std::fmt;
use std::fs;
use std::path::Path;

use goblin::{elf, pe, Object};

use crate::space::Address;
use crate::{ByteSource, ByteSourceError};

/// Largest zero-filled section accepted from a file header.
pub const MAX_SEGMENT_SIZE: u64 = 1 << 30;

/// Errors raised while loading an image.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse binary format
    #[error("Failed to parse binary format: {0}")]
    Parse(#[from] goblin::error::Error),

    #[error("Unsupported file format: {0}")]
    Unsupported(String),

    /// A section points past the end of the file
    #[error("Section '{0}' extends past the end of the file")]
    Truncated(String),

    /// A section claims more memory than [`MAX_SEGMENT_SIZE`]
    #[error("Section '{name}' is too large ({size:#x} bytes)")]
    TooLarge { name: String, size: u64 },

    /// A section or entry point does not fit in the 64-bit address range
    #[error("Section '{0}' wraps past the end of the address range")]
    AddressOverflow(String),
}

/// A flat byte buffer mapped at `base`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryImage {
    base: u64,
    bytes: Vec<u8>,
}

impl MemoryImage {
    pub fn new(base: u64, bytes: Vec<u8>) -> Self {
        Self { base, bytes }
    }

    /// Map the whole contents of a file at `base`.
    pub fn from_file(path: impl AsRef<Path>, base: u64) -> Result<Self, ImageError> {
        Ok(Self::new(base, fs::read(path)?))
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// One past the last mapped address.
    pub fn end(&self) -> u64 {
        self.base.wrapping_add(self.bytes.len() as u64)
    }
}

impl ByteSource for MemoryImage {
    fn load_fill(&mut self, buf: &mut [u8], addr: &Address<'_>) -> Result<(), ByteSourceError> {
        let out_of_range = || ByteSourceError::OutOfRange {
            offset: addr.offset(),
            size: buf.len(),
        };
        let start = addr
            .offset()
            .checked_sub(self.base)
            .and_then(|rel| usize::try_from(rel).ok())
            .ok_or_else(out_of_range)?;
        let src = start
            .checked_add(buf.len())
            .and_then(|end| self.bytes.get(start..end))
            .ok_or_else(out_of_range)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn adjust_vma(&mut self, adjust: i64) {
        self.base = self.base.wrapping_add_signed(adjust);
    }
}

/// One loaded section of an executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    pub address: u64,
    pub data: Vec<u8>,
    pub executable: bool,
}

impl Segment {
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.address && offset - self.address < self.data.len() as u64
    }

    pub fn end_address(&self) -> u64 {
        self.address.wrapping_add(self.data.len() as u64)
    }
}

/// The allocated sections of an ELF or PE file, addressed by virtual address.
#[derive(Debug, Clone, Default)]
pub struct SegmentedImage {
    segments: Vec<Segment>,
    entry: Option<u64>,
}

impl SegmentedImage {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        let data = fs::read(path)?;
        Self::parse(&data)
    }

    /// Parse an ELF or PE image.
    pub fn parse(data: &[u8]) -> Result<Self, ImageError> {
        let image = match Object::parse(data)? {
            Object::Elf(elf) => Self::parse_elf(&elf, data)?,
            Object::PE(pe) => Self::parse_pe(&pe, data)?,
            _ => return Err(ImageError::Unsupported("expected ELF or PE".into())),
        };
        log::debug!("Loaded {} segments, entry {:?}", image.segments.len(), image.entry);
        Ok(image)
    }

    fn parse_elf(elf: &elf::Elf<'_>, data: &[u8]) -> Result<Self, ImageError> {
        let mut segments = Vec::new();
        for sh in &elf.section_headers {
            if sh.sh_flags & u64::from(elf::section_header::SHF_ALLOC) == 0 || sh.sh_size == 0 {
                continue;
            }
            let name = elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("").to_string();
            let contents = if sh.sh_type == elf::section_header::SHT_NOBITS {
                vec![0; zero_fill_size(&name, sh.sh_size)?]
            } else {
                file_range(data, sh.sh_offset, sh.sh_size)
                    .ok_or_else(|| ImageError::Truncated(name.clone()))?
                    .to_vec()
            };
            if sh.sh_addr.checked_add(sh.sh_size).is_none() {
                return Err(ImageError::AddressOverflow(name));
            }
            segments.push(Segment {
                name,
                address: sh.sh_addr,
                data: contents,
                executable: sh.is_executable(),
            });
        }

        Ok(Self {
            segments,
            entry: Some(elf.entry),
        })
    }

    fn parse_pe(pe: &pe::PE<'_>, data: &[u8]) -> Result<Self, ImageError> {
        let image_base = pe.image_base as u64;
        let mut segments = Vec::new();
        for sect in &pe.sections {
            let name = sect.name().unwrap_or("").to_string();
            let mut contents = file_range(
                data,
                u64::from(sect.pointer_to_raw_data),
                u64::from(sect.size_of_raw_data),
            )
            .ok_or_else(|| ImageError::Truncated(name.clone()))?
            .to_vec();
            // Raw data is file-aligned; the mapped size is the virtual size.
            if sect.virtual_size != 0 {
                contents.resize(zero_fill_size(&name, u64::from(sect.virtual_size))?, 0);
            }
            let address = image_base
                .checked_add(u64::from(sect.virtual_address))
                .filter(|a| a.checked_add(contents.len() as u64).is_some())
                .ok_or_else(|| ImageError::AddressOverflow(name.clone()))?;
            segments.push(Segment {
                name,
                address,
                data: contents,
                executable: sect.characteristics & pe::section_table::IMAGE_SCN_MEM_EXECUTE != 0,
            });
        }

        let entry = image_base
            .checked_add(pe.entry as u64)
            .ok_or_else(|| ImageError::AddressOverflow("entry".into()))?;
        Ok(Self {
            segments,
            entry: Some(entry),
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn entry(&self) -> Option<u64> {
        self.entry
    }

    pub fn executable_segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(|s| s.executable)
    }

    pub fn find_segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == name)
    }

    fn segment_at(&self, offset: u64) -> Option<&Segment> {
        self.segments.iter().find(|s| s.contains(offset))
    }
}

impl From<Vec<Segment>> for SegmentedImage {
    fn from(segments: Vec<Segment>) -> Self {
        Self { segments, entry: None }
    }
}

impl ByteSource for SegmentedImage {
    /// Requests may span adjacent segments.
    fn load_fill(&mut self, buf: &mut [u8], addr: &Address<'_>) -> Result<(), ByteSourceError> {
        let mut filled = 0;
        while filled < buf.len() {
            let offset = addr.offset().wrapping_add(filled as u64);
            let seg = self.segment_at(offset).ok_or(ByteSourceError::OutOfRange {
                offset: addr.offset(),
                size: buf.len(),
            })?;
            let from = (offset - seg.address) as usize;
            let n = (seg.data.len() - from).min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&seg.data[from..from + n]);
            filled += n;
        }
        Ok(())
    }

    fn adjust_vma(&mut self, adjust: i64) {
        for seg in &mut self.segments {
            seg.address = seg.address.wrapping_add_signed(adjust);
        }
        self.entry = self.entry.map(|e| e.wrapping_add_signed(adjust));
    }
}

impl fmt::Display for SegmentedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for seg in &self.segments {
            writeln!(
                f,
                "{:<16} {:#010x}..{:#010x}{}",
                seg.name,
                seg.address,
                seg.end_address(),
                if seg.executable { " x" } else { "" }
            )?;
        }
        Ok(())
    }
}

fn zero_fill_size(name: &str, size: u64) -> Result<usize, ImageError> {
    let too_large = || ImageError::TooLarge {
        name: name.to_string(),
        size,
    };
    if size > MAX_SEGMENT_SIZE {
        return Err(too_large());
    }
    usize::try_from(size).map_err(|_| too_large())
}

fn file_range(data: &[u8], offset: u64, size: u64) -> Option<&[u8]> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(usize::try_from(size).ok()?)?;
    data.get(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::{AddressSpace, SpaceId, SpaceKind};
    use std::io::Write;

    fn ram() -> AddressSpace {
        AddressSpace::new(SpaceId(1), "ram", SpaceKind::Processor, 4, 1, false)
    }

    #[test]
    fn test_memory_image_fill() {
        let space = ram();
        let mut image = MemoryImage::new(0x1000, vec![1, 2, 3, 4]);
        let mut buf = [0u8; 2];

        image.load_fill(&mut buf, &Address::new(&space, 0x1002)).unwrap();
        assert_eq!(buf, [3, 4]);

        let err = image.load_fill(&mut buf, &Address::new(&space, 0x1003)).unwrap_err();
        assert_eq!(err, ByteSourceError::OutOfRange { offset: 0x1003, size: 2 });
        assert!(image.load_fill(&mut buf, &Address::new(&space, 0xfff)).is_err());
    }

    #[test]
    fn test_memory_image_adjust_vma() {
        let space = ram();
        let mut image = MemoryImage::new(0x1000, vec![9]);
        image.adjust_vma(-0x1000);
        assert_eq!(image.base(), 0);
        assert_eq!(image.end(), 1);

        let mut buf = [0u8; 1];
        image.load_fill(&mut buf, &Address::new(&space, 0)).unwrap();
        assert_eq!(buf, [9]);
    }

    #[test]
    fn test_memory_image_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0xde, 0xad]).unwrap();

        let image = MemoryImage::from_file(file.path(), 0x40).unwrap();
        assert_eq!(image.bytes(), &[0xde, 0xad]);
        assert_eq!(image.base(), 0x40);
    }

    #[test]
    fn test_segments_span_and_gap() {
        let space = ram();
        let mut image = SegmentedImage::from(vec![
            Segment { name: "a".into(), address: 0x10, data: vec![1, 2], executable: true },
            Segment { name: "b".into(), address: 0x12, data: vec![3, 4], executable: false },
            Segment { name: "c".into(), address: 0x20, data: vec![5], executable: true },
        ]);
        let mut buf = [0u8; 3];

        image.load_fill(&mut buf, &Address::new(&space, 0x11)).unwrap();
        assert_eq!(buf, [2, 3, 4]);

        assert!(image.load_fill(&mut buf, &Address::new(&space, 0x13)).is_err());
        assert_eq!(image.executable_segments().count(), 2);
        assert_eq!(image.find_segment("c").unwrap().end_address(), 0x21);

        image.adjust_vma(0x100);
        let mut one = [0u8; 1];
        image.load_fill(&mut one, &Address::new(&space, 0x120)).unwrap();
        assert_eq!(one, [5]);
    }

    /// Minimal little-endian ELF64 with a `.shstrtab` and one allocated
    /// `.bss` section at `bss_addr`.
    fn elf_with_bss(bss_addr: u64, bss_size: u64) -> Vec<u8> {
        const STRTAB: &[u8] = b"\0.shstrtab\0.bss\0";
        let strtab_offset = 64 + 3 * 64;

        let mut out = vec![0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        out.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        out.extend_from_slice(&0x3eu16.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&0x1000u64.to_le_bytes()); // entry
        out.extend_from_slice(&0u64.to_le_bytes()); // phoff
        out.extend_from_slice(&64u64.to_le_bytes()); // shoff
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&64u16.to_le_bytes());
        out.extend_from_slice(&56u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&64u16.to_le_bytes());
        out.extend_from_slice(&3u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes()); // shstrndx

        let mut section = |name: u32, kind: u32, flags: u64, addr: u64, offset: u64, size: u64| {
            out.extend_from_slice(&name.to_le_bytes());
            out.extend_from_slice(&kind.to_le_bytes());
            out.extend_from_slice(&flags.to_le_bytes());
            out.extend_from_slice(&addr.to_le_bytes());
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&size.to_le_bytes());
            out.extend_from_slice(&[0; 8]);
            out.extend_from_slice(&1u64.to_le_bytes());
            out.extend_from_slice(&0u64.to_le_bytes());
        };
        section(0, 0, 0, 0, 0, 0);
        section(1, 3, 0, 0, strtab_offset, STRTAB.len() as u64);
        section(11, 8, 3, bss_addr, strtab_offset, bss_size);

        out.extend_from_slice(STRTAB);
        out
    }

    #[test]
    fn test_elf_bss_is_zero_filled() {
        let image = SegmentedImage::parse(&elf_with_bss(0x2000, 0x10)).unwrap();
        let bss = image.find_segment(".bss").unwrap();

        assert_eq!(bss.address, 0x2000);
        assert_eq!(bss.data, vec![0; 0x10]);
        assert_eq!(image.entry(), Some(0x1000));
    }

    #[test]
    fn test_elf_oversized_bss_rejected() {
        let err = SegmentedImage::parse(&elf_with_bss(0x2000, 0x7fff_ffff_ffff_0000)).unwrap_err();
        assert!(matches!(err, ImageError::TooLarge { size: 0x7fff_ffff_ffff_0000, .. }));
    }

    #[test]
    fn test_elf_section_past_address_range_rejected() {
        let err = SegmentedImage::parse(&elf_with_bss(u64::MAX - 7, 0x10)).unwrap_err();
        assert!(matches!(err, ImageError::AddressOverflow(name) if name == ".bss"));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(SegmentedImage::parse(b"definitely not an executable").is_err());
    }
}
