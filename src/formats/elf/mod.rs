//! ELF backend.
//!
//! Accepts 32- and 64-bit ELF files of either byte order. Symbols come from
//! `.symtab`, falling back to `.dynsym` for stripped binaries.

use bytes::Bytes;
use object::read::elf::{ElfFile32, ElfFile64};
use object::{Endianness, Object as ObjectTrait};
use tracing::debug;

use super::common::Image;
use super::Format;
use crate::core::symbol::Symbol;
use crate::error::Result;

/// `\x7fELF`
pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

const EI_CLASS: usize = 4;
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;

/// An opened ELF file.
#[derive(Debug, Clone)]
pub struct ElfObject {
    pub(crate) image: Image,
}

impl ElfObject {
    /// Accept `data` if it carries the ELF magic and its headers parse.
    pub fn probe(data: &Bytes) -> Option<Self> {
        if !data.starts_with(&ELF_MAGIC) {
            return None;
        }
        let image = match *data.get(EI_CLASS)? {
            ELFCLASS64 => {
                let file = ElfFile64::<Endianness>::parse(&**data).ok()?;
                Image::from_file(data, &file, Format::Elf)
            }
            ELFCLASS32 => {
                let file = ElfFile32::<Endianness>::parse(&**data).ok()?;
                Image::from_file(data, &file, Format::Elf)
            }
            _ => return None,
        };
        Some(Self { image })
    }

    pub fn symbols(&self) -> Result<Vec<Symbol>> {
        let file = self.image.parse()?;
        let mut syms = self.image.convert_symbols(file.symbols())?;
        if syms.is_empty() {
            syms = self.image.convert_symbols(file.dynamic_symbols())?;
            debug!(count = syms.len(), "no .symtab, using dynamic symbols");
        }
        Ok(Image::finish_symbols(syms))
    }
}
