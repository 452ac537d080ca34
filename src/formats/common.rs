//! Format-independent parts of an opened image.
//!
//! Both backends validate their container with a format-specific parser and
//! then hand the file to `Image::from_file`, which snapshots everything the
//! browser needs (sections, the file-backed memory map, architecture) so
//! later reads never reparse headers. Symbols are parsed on demand.

use std::borrow::Cow;
use std::sync::Arc;

use bytes::Bytes;
use object::{Object as ObjectTrait, ObjectSection, ObjectSegment, ObjectSymbol, SectionKind};
use serde::Serialize;
use tracing::{debug, trace};

use super::{DwarfReader, Format, ObjectInfo};
use crate::core::address::{Address, AddressRange};
use crate::core::arch::Arch;
use crate::core::mem::{read_regions, Mem, Region};
use crate::core::symbol::{synthesize_sizes, Symbol, SymbolKind};
use crate::error::{ObjlensError, Result};

/// Zero-filled symbol data beyond this size is refused.
const MAX_ZERO_FILL: u64 = 1 << 30;

/// A section as listed by the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionInfo {
    pub index: usize,
    pub name: String,
    pub address: Address,
    pub size: u64,
    /// Contains executable code.
    pub code: bool,
    /// Occupies no file space (`.bss`).
    pub zero_fill: bool,
    #[serde(skip)]
    pub(crate) file_range: Option<(u64, u64)>,
    #[serde(skip)]
    pub(crate) kind: Option<SymbolKind>,
}

/// Snapshot of an opened container.
#[derive(Debug, Clone)]
pub(crate) struct Image {
    pub data: Bytes,
    pub info: ObjectInfo,
    pub sections: Vec<SectionInfo>,
    pub regions: Vec<Region>,
}

fn section_symbol_kind(kind: SectionKind) -> Option<SymbolKind> {
    Some(match kind {
        SectionKind::Text => SymbolKind::Text,
        SectionKind::Data | SectionKind::Tls | SectionKind::ReadOnlyDataWithRel => {
            SymbolKind::Data
        }
        SectionKind::ReadOnlyData | SectionKind::ReadOnlyString => SymbolKind::ROData,
        SectionKind::UninitializedData | SectionKind::UninitializedTls | SectionKind::Common => {
            SymbolKind::Bss
        }
        _ => return None,
    })
}

impl Image {
    pub fn from_file<'data, O: ObjectTrait<'data>>(data: &Bytes, file: &O, format: Format) -> Self {
        let sections: Vec<SectionInfo> = file
            .sections()
            .map(|s| {
                let kind = section_symbol_kind(s.kind());
                SectionInfo {
                    index: s.index().0,
                    name: s.name().unwrap_or("").to_string(),
                    address: s.address(),
                    size: s.size(),
                    code: s.kind() == SectionKind::Text,
                    zero_fill: matches!(kind, Some(SymbolKind::Bss)),
                    file_range: s.file_range(),
                    kind,
                }
            })
            .collect();

        let mut regions: Vec<Region> = file
            .segments()
            .filter_map(|seg| {
                let (off, fsize) = seg.file_range();
                let size = fsize.min(seg.size());
                if size == 0 {
                    return None;
                }
                Some(Region {
                    range: AddressRange::new(seg.address(), size)?,
                    offset: usize::try_from(off).ok()?,
                })
            })
            .collect();
        if regions.is_empty() {
            // Relocatable objects have no segments; map allocated sections.
            regions = sections
                .iter()
                .filter(|s| s.kind.is_some() && !s.zero_fill)
                .filter_map(|s| {
                    let (off, fsize) = s.file_range?;
                    Some(Region {
                        range: AddressRange::new(s.address, fsize.min(s.size))?,
                        offset: usize::try_from(off).ok()?,
                    })
                })
                .filter(|r| !r.range.is_empty())
                .collect();
        }
        regions.sort_by_key(|r| (r.range.start, r.range.end));
        // Drop overlapping regions so lookups stay a single binary search.
        let mut disjoint: Vec<Region> = Vec::with_capacity(regions.len());
        for r in regions {
            match disjoint.last() {
                Some(prev) if prev.range.end > r.range.start => {
                    trace!(region = %r.range, "skipping overlapping region");
                }
                _ => disjoint.push(r),
            }
        }

        let info = ObjectInfo {
            format,
            arch: Arch::from_object(file.architecture()),
            machine: format!("{:?}", file.architecture()),
            big_endian: !file.is_little_endian(),
            entry: file.entry(),
        };
        debug!(
            format = ?format,
            machine = %info.machine,
            sections = sections.len(),
            regions = disjoint.len(),
            "image mapped"
        );

        Self {
            data: data.clone(),
            info,
            sections,
            regions: disjoint,
        }
    }

    /// Reparse the container for symbol or debug-info access.
    pub fn parse(&self) -> Result<object::File<'_>> {
        object::File::parse(&*self.data).map_err(|e| ObjlensError::MalformedSymbolTable(e.to_string()))
    }

    /// Convert every named, non-section symbol from `iter`.
    pub fn convert_symbols<'data, S, I>(&self, iter: I) -> Result<Vec<Symbol>>
    where
        S: ObjectSymbol<'data>,
        I: Iterator<Item = S>,
    {
        let mut out = Vec::new();
        for sym in iter {
            match sym.kind() {
                object::SymbolKind::Section | object::SymbolKind::File => continue,
                _ => {}
            }
            let name = sym
                .name()
                .map_err(|e| ObjlensError::MalformedSymbolTable(e.to_string()))?;
            if name.is_empty() {
                continue;
            }
            let (kind, section) = match sym.section() {
                object::SymbolSection::Undefined => (SymbolKind::Undef, None),
                object::SymbolSection::Absolute => (SymbolKind::Absolute, None),
                object::SymbolSection::Common => (SymbolKind::Bss, None),
                object::SymbolSection::Section(idx) => {
                    let kind = self
                        .section(idx.0)
                        .and_then(|s| s.kind)
                        .unwrap_or(match sym.kind() {
                            object::SymbolKind::Text => SymbolKind::Text,
                            object::SymbolKind::Data => SymbolKind::Data,
                            _ => SymbolKind::Unknown,
                        });
                    (kind, Some(idx.0))
                }
                _ => (SymbolKind::Unknown, None),
            };
            let mut s = Symbol::new(name, sym.address(), sym.size(), kind)
                .with_local(sym.is_local())
                .with_section(section);
            s.has_addr = section.is_some();
            out.push(s);
        }
        Ok(out)
    }

    /// Final normalisation shared by every backend.
    pub fn finish_symbols(mut syms: Vec<Symbol>) -> Vec<Symbol> {
        synthesize_sizes(&mut syms);
        syms
    }

    pub fn section(&self, index: usize) -> Option<&SectionInfo> {
        self.sections.iter().find(|s| s.index == index)
    }

    pub fn section_containing(&self, addr: Address) -> Option<&SectionInfo> {
        self.sections.iter().find(|s| {
            s.kind.is_some()
                && AddressRange::new(s.address, s.size).is_some_and(|r| r.contains(addr))
        })
    }

    pub fn symbol_data(&self, sym: &Symbol) -> Result<Bytes> {
        let out_of_range = || ObjlensError::OutOfRange {
            start: sym.value,
            end: sym.value.saturating_add(sym.size),
        };
        let section = sym.section.and_then(|i| self.section(i));
        if sym.kind == SymbolKind::Bss || section.is_some_and(|s| s.zero_fill) {
            if sym.size > MAX_ZERO_FILL {
                return Err(out_of_range());
            }
            return Ok(Bytes::from(vec![0u8; sym.size as usize]));
        }

        let mapped = self.data(sym.value, sym.size);
        if mapped.len() as u64 == sym.size {
            return Ok(self.data.slice_ref(mapped));
        }

        // Fall back to the section's file bytes (relocatable objects).
        let (off, fsize) = section.and_then(|s| s.file_range).ok_or_else(out_of_range)?;
        let section = section.ok_or_else(out_of_range)?;
        let rel = sym.value.checked_sub(section.address).ok_or_else(out_of_range)?;
        let end = rel.checked_add(sym.size).ok_or_else(out_of_range)?;
        if end > fsize {
            return Err(out_of_range());
        }
        let start = usize::try_from(off + rel).map_err(|_| out_of_range())?;
        let stop = usize::try_from(off + end).map_err(|_| out_of_range())?;
        if stop > self.data.len() {
            return Err(out_of_range());
        }
        Ok(self.data.slice(start..stop))
    }

    pub fn dwarf(&self) -> Result<gimli::Dwarf<DwarfReader>> {
        let file = self.parse()?;
        if file.section_by_name(".debug_info").is_none() {
            return Err(ObjlensError::NotPresent("DWARF"));
        }
        let endian = if file.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };
        let load = |id: gimli::SectionId| -> Result<DwarfReader> {
            let data = file
                .section_by_name(id.name())
                .and_then(|s| s.uncompressed_data().ok())
                .unwrap_or(Cow::Borrowed(&[]));
            Ok(gimli::EndianArcSlice::new(Arc::from(&*data), endian))
        };
        gimli::Dwarf::load(load)
    }
}

impl Mem for Image {
    fn data(&self, addr: Address, max: u64) -> &[u8] {
        read_regions(&self.regions, &self.data, addr, max)
    }
}
