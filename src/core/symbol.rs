//! Symbol type shared by every format backend.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::address::{Address, AddressRange};

/// Symbol kinds, rendered with the single-letter codes used by `nm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymbolKind {
    /// Unknown kind
    Unknown,
    /// Executable code
    Text,
    /// Initialized data
    Data,
    /// Read-only data
    ROData,
    /// Zero-initialized data
    Bss,
    /// Undefined / external reference
    Undef,
    /// Absolute value, not an address in a section
    Absolute,
}

impl SymbolKind {
    /// The `nm`-style letter for this kind.
    pub fn code(&self) -> char {
        match self {
            SymbolKind::Unknown => '?',
            SymbolKind::Text => 'T',
            SymbolKind::Data => 'D',
            SymbolKind::ROData => 'R',
            SymbolKind::Bss => 'B',
            SymbolKind::Undef => 'U',
            SymbolKind::Absolute => 'A',
        }
    }

    pub fn from_code(c: char) -> Option<Self> {
        Some(match c.to_ascii_uppercase() {
            '?' => SymbolKind::Unknown,
            'T' => SymbolKind::Text,
            'D' => SymbolKind::Data,
            'R' => SymbolKind::ROData,
            'B' => SymbolKind::Bss,
            'U' => SymbolKind::Undef,
            'A' => SymbolKind::Absolute,
            _ => return None,
        })
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A named entity from an object's symbol table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub value: Address,
    /// Size in bytes; synthesized from the next symbol when the format reports 0.
    pub size: u64,
    pub kind: SymbolKind,
    /// The name is only meaningful within its compilation unit.
    pub local: bool,
    /// `value` is a meaningful address in the loaded object.
    pub has_addr: bool,
    /// Backend section index, if the symbol lives in a section.
    #[serde(skip)]
    pub(crate) section: Option<usize>,
}

impl Symbol {
    pub fn new(name: impl Into<String>, value: Address, size: u64, kind: SymbolKind) -> Self {
        Self {
            name: name.into(),
            value,
            size,
            kind,
            local: false,
            has_addr: !matches!(kind, SymbolKind::Undef | SymbolKind::Absolute),
            section: None,
        }
    }

    pub fn with_local(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    pub fn with_section(mut self, section: Option<usize>) -> Self {
        self.section = section;
        self
    }

    /// Address range covered by the symbol, `None` on overflow.
    pub fn range(&self) -> Option<AddressRange> {
        AddressRange::new(self.value, self.size)
    }

    pub fn is_text(&self) -> bool {
        self.kind == SymbolKind::Text
    }

    /// Backend section index the symbol was defined in.
    pub fn section(&self) -> Option<usize> {
        self.section
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.local {
            self.kind.code().to_ascii_lowercase()
        } else {
            self.kind.code()
        };
        write!(f, "{:016x} {} {}", self.value, kind, self.name)
    }
}

/// Assign sizes to zero-sized symbols from the gap to the next symbol.
///
/// Sorts `syms` by address (stable, so equal addresses keep backend order).
/// Undefined symbols and the last symbol keep size 0.
pub fn synthesize_sizes(syms: &mut [Symbol]) {
    syms.sort_by_key(|s| s.value);
    let mut next: Option<Address> = None;
    for s in syms.iter_mut().rev() {
        if s.kind == SymbolKind::Undef {
            continue;
        }
        if s.size == 0 {
            if let Some(n) = next {
                s.size = n - s.value;
            }
        }
        next = Some(s.value);
    }
}
