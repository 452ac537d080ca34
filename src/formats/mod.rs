//! Object file abstraction over the supported container formats.
//!
//! `open` probes the registered backends in a fixed order (ELF, then PE) and
//! returns the first one whose magic and headers validate. The resulting
//! `Object` is an immutable, `Send + Sync` view: cloning is cheap and any
//! number of analysis requests may read it concurrently.

pub mod common;
pub mod elf;
pub mod pe;

use std::path::Path;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info};

use crate::core::address::Address;
use crate::core::arch::Arch;
use crate::core::mem::Mem;
use crate::core::symbol::Symbol;
use crate::error::{ObjlensError, Result};

pub use common::SectionInfo;

/// Reader type of the DWARF handle returned by `Object::dwarf`.
pub type DwarfReader = gimli::EndianArcSlice<gimli::RunTimeEndian>;

/// Container formats with a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Format {
    Elf,
    Pe,
}

/// Immutable description of an opened object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectInfo {
    pub format: Format,
    /// Registered architecture, `None` for machines without a descriptor.
    pub arch: Option<&'static Arch>,
    /// Machine name as reported by the container.
    pub machine: String,
    pub big_endian: bool,
    pub entry: Address,
}

/// An opened object file.
#[derive(Debug, Clone)]
pub enum Object {
    Elf(elf::ElfObject),
    Pe(pe::PeObject),
}

type Probe = fn(&Bytes) -> Option<Object>;

fn probe_elf(data: &Bytes) -> Option<Object> {
    elf::ElfObject::probe(data).map(Object::Elf)
}

fn probe_pe(data: &Bytes) -> Option<Object> {
    pe::PeObject::probe(data).map(Object::Pe)
}

/// Backends in probe order.
const BACKENDS: [(Format, Probe); 2] = [(Format::Elf, probe_elf), (Format::Pe, probe_pe)];

/// Open `data` as the first format whose backend accepts it.
pub fn open(data: impl Into<Bytes>) -> Result<Object> {
    let data = data.into();
    for (format, probe) in BACKENDS {
        if let Some(obj) = probe(&data) {
            debug!(?format, "backend accepted input");
            return Ok(obj);
        }
        debug!(?format, "backend rejected input");
    }
    Err(ObjlensError::UnrecognizedFormat)
}

/// Memory-map the file at `path` and open it.
pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Object> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)?;
    let size = file.metadata()?.len();
    if size == 0 {
        // memmap cannot map empty files, and no format accepts them anyway.
        return Err(ObjlensError::UnrecognizedFormat);
    }
    // Safety: read-only map of a regular file; the object never writes through it.
    let mmap = unsafe { memmap2::Mmap::map(&file)? };
    let obj = open(Bytes::from_owner(mmap))?;
    info!(path = %path.display(), size, format = ?obj.format(), "opened object");
    Ok(obj)
}

impl Object {
    fn image(&self) -> &common::Image {
        match self {
            Object::Elf(o) => &o.image,
            Object::Pe(o) => &o.image,
        }
    }

    pub fn info(&self) -> &ObjectInfo {
        &self.image().info
    }

    pub fn format(&self) -> Format {
        self.image().info.format
    }

    /// Sections as listed by the container.
    pub fn sections(&self) -> &[SectionInfo] {
        &self.image().sections
    }

    pub fn section_by_name(&self, name: &str) -> Option<&SectionInfo> {
        self.sections().iter().find(|s| s.name == name)
    }

    /// Symbols sorted by address, with zero sizes synthesized.
    pub fn symbols(&self) -> Result<Vec<Symbol>> {
        match self {
            Object::Elf(o) => o.symbols(),
            Object::Pe(o) => o.symbols(),
        }
    }

    /// Raw bytes backing a symbol's range.
    pub fn symbol_data(&self, sym: &Symbol) -> Result<Bytes> {
        self.image().symbol_data(sym)
    }

    /// Contents of a section, if it occupies file space.
    pub fn section_data(&self, section: &SectionInfo) -> Result<Bytes> {
        let out_of_range = || ObjlensError::OutOfRange {
            start: section.address,
            end: section.address.saturating_add(section.size),
        };
        let (off, size) = section.file_range.ok_or_else(out_of_range)?;
        let start = usize::try_from(off).map_err(|_| out_of_range())?;
        let end = usize::try_from(off.saturating_add(size)).map_err(|_| out_of_range())?;
        let data = &self.image().data;
        if end > data.len() {
            return Err(out_of_range());
        }
        Ok(data.slice(start..end))
    }

    /// Embedded DWARF debug info.
    pub fn dwarf(&self) -> Result<gimli::Dwarf<DwarfReader>> {
        self.image().dwarf()
    }
}

impl Mem for Object {
    fn data(&self, addr: Address, max: u64) -> &[u8] {
        self.image().data(addr, max)
    }
}
