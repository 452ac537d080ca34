//! PE backend.
//!
//! Accepts PE32 and PE32+ images. Symbols come from the COFF symbol table
//! (which Go and MinGW toolchains emit), falling back to the export table.

use bytes::Bytes;
use object::read::pe::{PeFile32, PeFile64};
use object::Object as ObjectTrait;
use tracing::debug;

use super::common::Image;
use super::Format;
use crate::core::symbol::{Symbol, SymbolKind};
use crate::error::{ObjlensError, Result};

/// `MZ`
pub const DOS_MAGIC: [u8; 2] = [b'M', b'Z'];
/// `PE\0\0`
pub const PE_SIGNATURE: [u8; 4] = [b'P', b'E', 0, 0];

const E_LFANEW: usize = 0x3c;
const OPTIONAL_MAGIC_PE32: u16 = 0x10b;
const OPTIONAL_MAGIC_PE32_PLUS: u16 = 0x20b;
/// Offset of the optional header magic from the PE signature.
const OPTIONAL_HEADER_OFFSET: usize = 4 + 20;

/// An opened PE image.
#[derive(Debug, Clone)]
pub struct PeObject {
    pub(crate) image: Image,
}

fn read_u16(data: &[u8], off: usize) -> Option<u16> {
    let b = data.get(off..off.checked_add(2)?)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(data: &[u8], off: usize) -> Option<u32> {
    let b = data.get(off..off.checked_add(4)?)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

impl PeObject {
    /// Accept `data` if it has DOS and PE signatures and its headers parse.
    pub fn probe(data: &Bytes) -> Option<Self> {
        if !data.starts_with(&DOS_MAGIC) {
            return None;
        }
        let nt = read_u32(data, E_LFANEW)? as usize;
        if data.get(nt..nt.checked_add(4)?)? != PE_SIGNATURE.as_slice() {
            return None;
        }
        let image = match read_u16(data, nt.checked_add(OPTIONAL_HEADER_OFFSET)?)? {
            OPTIONAL_MAGIC_PE32_PLUS => {
                let file = PeFile64::parse(&**data).ok()?;
                Image::from_file(data, &file, Format::Pe)
            }
            OPTIONAL_MAGIC_PE32 => {
                let file = PeFile32::parse(&**data).ok()?;
                Image::from_file(data, &file, Format::Pe)
            }
            _ => return None,
        };
        Some(Self { image })
    }

    pub fn symbols(&self) -> Result<Vec<Symbol>> {
        let file = self.image.parse()?;
        let mut syms = self.image.convert_symbols(file.symbols())?;
        if syms.is_empty() {
            let exports = file
                .exports()
                .map_err(|e| ObjlensError::MalformedSymbolTable(e.to_string()))?;
            for export in exports {
                let name = String::from_utf8_lossy(export.name()).into_owned();
                if name.is_empty() {
                    continue;
                }
                let addr = export.address();
                let section = self.image.section_containing(addr);
                let kind = section.and_then(|s| s.kind).unwrap_or(SymbolKind::Unknown);
                let mut sym = Symbol::new(name, addr, 0, kind).with_section(section.map(|s| s.index));
                sym.has_addr = section.is_some();
                syms.push(sym);
            }
            debug!(count = syms.len(), "no COFF symbols, using exports");
        }
        Ok(Image::finish_symbols(syms))
    }

    /// Preferred load address from the optional header.
    pub fn image_base(&self) -> u64 {
        self.image
            .parse()
            .map(|f| f.relative_address_base())
            .unwrap_or(0)
    }
}
