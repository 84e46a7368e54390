//! Firmware image loading.
//!
//! An image is reduced to the list of contiguous address ranges it actually
//! populates. Intel HEX and ELF (`PT_LOAD` segments at their physical
//! address) are supported.

use crate::{Error, Result};
use goblin::elf::Elf;
use goblin::elf::program_header::PT_LOAD;
use ihex::Record;
use std::path::Path;

const ELF_MAGIC: &[u8] = b"\x7FELF";
const FILL_BYTE: u8 = 0xFF;

/// A contiguous occupied address range `[start, end)` and its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySegment {
    start: u32,
    data: Vec<u8>,
}

impl MemorySegment {
    pub fn new(start: u32, data: Vec<u8>) -> Self {
        Self { start, data }
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    /// Exclusive end address. A segment ending at the top of the address
    /// space ends at `1 << 32`.
    pub fn end(&self) -> u64 {
        self.start as u64 + self.data.len() as u64
    }

    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageFormat {
    IntelHex,
    Elf,
}

/// A parsed firmware image, shared read-only between all device sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareImage {
    segments: Vec<MemorySegment>,
}

impl FirmwareImage {
    /// Loads an image file, picking the format from its extension or content.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Self::load_inner(path).map_err(|source| Error::ImageLoad {
            path: path.to_path_buf(),
            source: Box::new(source),
        })
    }

    fn load_inner(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let format = Self::detect_format(path, &bytes)?;
        tracing::debug!("Loading {:?} image from {}", format, path.display());

        let image = match format {
            ImageFormat::IntelHex => {
                let text = std::str::from_utf8(&bytes)
                    .map_err(|e| Error::image(format!("Intel HEX file is not text: {}", e)))?;
                Self::from_ihex(text)?
            }
            ImageFormat::Elf => Self::from_elf(&bytes)?,
        };

        tracing::info!(
            "Loaded {}: {} segment(s), {} bytes",
            path.display(),
            image.segments.len(),
            image.total_size()
        );
        Ok(image)
    }

    fn detect_format(path: &Path, bytes: &[u8]) -> Result<ImageFormat> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());

        match extension.as_deref() {
            Some("hex") | Some("ihex") => return Ok(ImageFormat::IntelHex),
            Some("elf") | Some("axf") | Some("out") => return Ok(ImageFormat::Elf),
            _ => {}
        }

        if bytes.starts_with(ELF_MAGIC) {
            Ok(ImageFormat::Elf)
        } else if bytes.first() == Some(&b':') {
            Ok(ImageFormat::IntelHex)
        } else {
            Err(Error::image(
                "unrecognized image format, expected Intel HEX or ELF",
            ))
        }
    }

    /// Parses Intel HEX text.
    pub fn from_ihex(text: &str) -> Result<Self> {
        let mut chunks = Vec::new();
        let mut base: u64 = 0;

        for record in ihex::Reader::new(text) {
            match record? {
                Record::Data { offset, value } => {
                    chunks.push((base + offset as u64, value));
                }
                Record::ExtendedSegmentAddress(segment) => {
                    base = (segment as u64) << 4;
                }
                Record::ExtendedLinearAddress(upper) => {
                    base = (upper as u64) << 16;
                }
                Record::EndOfFile => break,
                Record::StartSegmentAddress { .. } | Record::StartLinearAddress(_) => {}
            }
        }

        Self::from_chunks(chunks)
    }

    /// Extracts the loadable contents of an ELF file.
    pub fn from_elf(bytes: &[u8]) -> Result<Self> {
        let elf = Elf::parse(bytes)?;
        let mut chunks = Vec::new();

        for header in elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == PT_LOAD && ph.p_filesz > 0)
        {
            let offset = header.p_offset as usize;
            let size = header.p_filesz as usize;
            let data = offset
                .checked_add(size)
                .and_then(|end| bytes.get(offset..end))
                .ok_or_else(|| {
                    Error::image(format!(
                        "program header at offset 0x{:X} runs past end of file",
                        header.p_offset
                    ))
                })?;
            tracing::trace!(
                "PT_LOAD paddr=0x{:08X} filesz=0x{:X}",
                header.p_paddr,
                header.p_filesz
            );
            chunks.push((header.p_paddr, data.to_vec()));
        }

        Self::from_chunks(chunks)
    }

    /// Builds the segment list from possibly unordered data chunks, merging
    /// chunks that touch.
    fn from_chunks(mut chunks: Vec<(u64, Vec<u8>)>) -> Result<Self> {
        chunks.retain(|(_, data)| !data.is_empty());
        chunks.sort_by_key(|(address, _)| *address);

        let mut segments: Vec<MemorySegment> = Vec::new();
        for (address, data) in chunks {
            let end = address + data.len() as u64;
            if end > u32::MAX as u64 {
                return Err(Error::image(format!(
                    "data at 0x{:X} extends beyond the 32-bit address space",
                    address
                )));
            }
            let address = address as u32;

            if let Some(last) = segments.last_mut() {
                let last_end = last.start as u64 + last.data.len() as u64;
                if (address as u64) < last_end {
                    return Err(Error::image(format!(
                        "overlapping data at 0x{:08X}",
                        address
                    )));
                }
                if address as u64 == last_end {
                    last.data.extend_from_slice(&data);
                    continue;
                }
            }
            segments.push(MemorySegment::new(address, data));
        }

        Ok(Self { segments })
    }

    /// Occupied segments. Loaded images list them ascending by address.
    pub fn segments(&self) -> &[MemorySegment] {
        &self.segments
    }

    /// Bytes in `[start, start + size)`; addresses with no data read as `0xFF`.
    pub fn bytes(&self, start: u32, size: u32) -> Vec<u8> {
        let mut out = vec![FILL_BYTE; size as usize];
        let window_end = start as u64 + size as u64;

        for segment in &self.segments {
            let seg_start = segment.start as u64;
            let seg_end = seg_start + segment.data.len() as u64;
            let from = seg_start.max(start as u64);
            let to = seg_end.min(window_end);
            if from >= to {
                continue;
            }
            let dst = (from - start as u64) as usize..(to - start as u64) as usize;
            let src = (from - seg_start) as usize..(to - seg_start) as usize;
            out[dst].copy_from_slice(&segment.data[src]);
        }

        out
    }

    pub fn total_size(&self) -> u64 {
        self.segments.iter().map(|s| s.data.len() as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl From<Vec<MemorySegment>> for FirmwareImage {
    fn from(segments: Vec<MemorySegment>) -> Self {
        Self { segments }
    }
}
