//! CAWSF container: sectioned file with table of contents and per-section
//! compression.
//!
//! A container holds up to one section per [`SectionType`]. Payloads begin
//! at offsets aligned up to 4096 bytes; gaps are zero-padded. Each TOC
//! record stores the stored (possibly compressed) size; compression is
//! signalled per section through the flag bits.

use std::fs::File;
use std::io::Write as _;
use std::path::Path;

use vassago_core::{Error, Result};

use crate::codec;

/// Magic bytes at the start of every container.
pub const MAGIC: [u8; 8] = *b"CAWSF\0\0\0";

/// Container format version.
pub const FORMAT_VERSION: u32 = 1;

/// Section payload alignment.
pub const SECTION_ALIGN: u64 = 4096;

/// Flag: section payload is a Zstandard frame.
pub const FLAG_COMP_ZSTD: u32 = 1 << 0;

/// Flag: section payload is an LZ4 frame.
pub const FLAG_COMP_LZ4: u32 = 1 << 1;

/// Section type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SectionType {
    Meta = 1,
    Codebooks = 2,
    ShardBank = 3,
    Routing = 4,
}

impl SectionType {
    /// Numeric id as stored in the TOC.
    pub fn id(self) -> u32 {
        self as u32
    }

    /// Sections covered by the checksum index, in id order.
    pub const CHECKSUMMED: [SectionType; 3] = [
        SectionType::Codebooks,
        SectionType::ShardBank,
        SectionType::Routing,
    ];
}

impl TryFrom<u32> for SectionType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(SectionType::Meta),
            2 => Ok(SectionType::Codebooks),
            3 => Ok(SectionType::ShardBank),
            4 => Ok(SectionType::Routing),
            _ => Err(Error::format(format!("unknown section type: {value}"))),
        }
    }
}

/// One table-of-contents record.
#[derive(Debug, Clone, Copy)]
pub struct TocEntry {
    pub type_id: u32,
    pub offset: u64,
    pub size: u64,
    pub flags: u32,
}

impl TocEntry {
    /// Size of a TOC record in bytes.
    pub const SIZE: usize = 24;

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.type_id.to_le_bytes());
        buf[4..12].copy_from_slice(&self.offset.to_le_bytes());
        buf[12..20].copy_from_slice(&self.size.to_le_bytes());
        buf[20..24].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }

    /// Parse from bytes.
    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            type_id: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            offset: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
            size: u64::from_le_bytes(buf[12..20].try_into().unwrap()),
            flags: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
        }
    }
}

fn align_up(x: u64, a: u64) -> u64 {
    let r = x % a;
    if r == 0 {
        x
    } else {
        x + (a - r)
    }
}

struct PendingSection {
    type_id: u32,
    data: Vec<u8>,
    flags: u32,
}

/// Container writer. Sections are written in the order they were added.
#[derive(Default)]
pub struct Writer {
    sections: Vec<PendingSection>,
}

impl Writer {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a section payload with compression flags.
    pub fn add_section(&mut self, ty: SectionType, data: Vec<u8>, flags: u32) {
        self.sections.push(PendingSection {
            type_id: ty.id(),
            data,
            flags,
        });
    }

    /// Write the container to `path`.
    pub fn write(self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path.as_ref())?;
        self.write_to(&mut file)?;
        file.flush()?;
        Ok(())
    }

    /// Write the container to any sink.
    pub fn write_to(self, out: &mut impl std::io::Write) -> Result<()> {
        // compress payloads up front so the TOC can carry stored sizes
        let mut payloads = Vec::with_capacity(self.sections.len());
        for s in &self.sections {
            if s.flags & FLAG_COMP_ZSTD != 0 && s.flags & FLAG_COMP_LZ4 != 0 {
                return Err(Error::format(format!(
                    "section {}: conflicting compression flags {:#x}",
                    s.type_id, s.flags
                )));
            }
            let data = if s.flags & FLAG_COMP_ZSTD != 0 {
                codec::zstd_encode(&s.data)?
            } else if s.flags & FLAG_COMP_LZ4 != 0 {
                codec::lz4_encode(&s.data)?
            } else {
                s.data.clone()
            };
            payloads.push(data);
        }

        out.write_all(&MAGIC)?;
        out.write_all(&FORMAT_VERSION.to_le_bytes())?;
        out.write_all(&(self.sections.len() as u32).to_le_bytes())?;
        out.write_all(&0u32.to_le_bytes())?;

        let base = 8 + 12 + (TocEntry::SIZE * self.sections.len()) as u64;
        let mut offset = align_up(base, SECTION_ALIGN);
        let mut toc = Vec::with_capacity(self.sections.len());
        for (s, data) in self.sections.iter().zip(&payloads) {
            toc.push(TocEntry {
                type_id: s.type_id,
                offset,
                size: data.len() as u64,
                flags: s.flags,
            });
            offset = align_up(offset + data.len() as u64, SECTION_ALIGN);
        }
        for entry in &toc {
            out.write_all(&entry.to_bytes())?;
        }

        // zero-pad up to each payload offset, then the payload itself
        let mut pos = base;
        for (entry, data) in toc.iter().zip(&payloads) {
            let pad = entry.offset - pos;
            if pad > 0 {
                out.write_all(&vec![0u8; pad as usize])?;
            }
            out.write_all(data)?;
            pos = entry.offset + data.len() as u64;
        }
        tracing::debug!(sections = toc.len(), bytes = pos, "container written");
        Ok(())
    }
}

/// Container reader. Holds the file open and serves positioned reads.
#[derive(Debug)]
pub struct Reader {
    file: File,
    toc: Vec<TocEntry>,
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "short read",
            ));
        }
        buf = &mut std::mem::take(&mut buf)[n..];
        offset += n as u64;
    }
    Ok(())
}

impl Reader {
    /// Open a container, validating the magic and reading the TOC.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;

        let mut head = [0u8; 20];
        read_exact_at(&file, &mut head, 0)
            .map_err(|_| Error::format("truncated container header"))?;
        if head[0..8] != MAGIC {
            return Err(Error::format("not a CAWSF container: bad magic"));
        }
        let ver = u32::from_le_bytes(head[8..12].try_into().unwrap());
        if ver != FORMAT_VERSION {
            return Err(Error::format(format!(
                "unsupported container version: {ver} (expected {FORMAT_VERSION})"
            )));
        }
        let num = u32::from_le_bytes(head[12..16].try_into().unwrap()) as usize;

        let mut toc_bytes = vec![0u8; num * TocEntry::SIZE];
        read_exact_at(&file, &mut toc_bytes, 20)
            .map_err(|_| Error::format_at("truncated TOC", 20))?;
        let toc = toc_bytes
            .chunks_exact(TocEntry::SIZE)
            .map(|c| TocEntry::from_bytes(c.try_into().unwrap()))
            .collect();

        Ok(Self { file, toc })
    }

    /// Table of contents as read from the file.
    #[must_use]
    pub fn toc(&self) -> &[TocEntry] {
        &self.toc
    }

    fn entry(&self, ty: SectionType) -> Result<&TocEntry> {
        self.toc
            .iter()
            .find(|e| e.type_id == ty.id())
            .ok_or_else(|| Error::not_found(format!("section {}", ty.id())))
    }

    /// Read the stored bytes of a section (compressed if flagged).
    pub fn section(&self, ty: SectionType) -> Result<Vec<u8>> {
        let entry = self.entry(ty)?;
        let mut buf = vec![0u8; entry.size as usize];
        read_exact_at(&self.file, &mut buf, entry.offset).map_err(|_| {
            Error::format_at(
                format!("short section {} payload", entry.type_id),
                entry.offset as usize,
            )
        })?;
        Ok(buf)
    }

    /// Read a section, transparently decompressing according to its flags.
    pub fn section_uncompressed(&self, ty: SectionType) -> Result<Vec<u8>> {
        let flags = self.entry(ty)?.flags;
        let raw = self.section(ty)?;
        if flags & FLAG_COMP_ZSTD != 0 {
            codec::zstd_decode(&raw)
        } else if flags & FLAG_COMP_LZ4 != 0 {
            codec::lz4_decode(&raw)
        } else {
            Ok(raw)
        }
    }
}
