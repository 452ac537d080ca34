//! Static instruction-set descriptors.
//!
//! An `Arch` parametrizes every other component: the disassembler backend,
//! the function table decoder (pointer size, pc quantum) and the stack frame
//! model used to align liveness bitmaps.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Instruction set family; selects the disassembler backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ArchFamily {
    X86,
    AArch64,
}

/// Description of one instruction set.
#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct Arch {
    /// Canonical name ("amd64", "386", "arm64").
    pub name: &'static str,
    pub family: ArchFamily,
    /// Size of a general purpose register in bytes.
    pub word_size: u8,
    /// Size of a pointer in bytes.
    pub ptr_size: u8,
    /// Smallest instruction length; also the function table pc quantum.
    pub min_inst_len: u8,
    pub max_inst_len: u8,
    /// Calls store the return address in a register instead of pushing it.
    pub uses_link_register: bool,
    /// Bytes reserved at the bottom of every frame for the callee.
    pub min_frame_size: u8,
    /// Frames save the caller's frame pointer below the return address.
    pub frame_pointer: bool,
}

pub static AMD64: Arch = Arch {
    name: "amd64",
    family: ArchFamily::X86,
    word_size: 8,
    ptr_size: 8,
    min_inst_len: 1,
    max_inst_len: 15,
    uses_link_register: false,
    min_frame_size: 0,
    frame_pointer: true,
};

pub static I386: Arch = Arch {
    name: "386",
    family: ArchFamily::X86,
    word_size: 4,
    ptr_size: 4,
    min_inst_len: 1,
    max_inst_len: 15,
    uses_link_register: false,
    min_frame_size: 0,
    frame_pointer: false,
};

pub static ARM64: Arch = Arch {
    name: "arm64",
    family: ArchFamily::AArch64,
    word_size: 8,
    ptr_size: 8,
    min_inst_len: 4,
    max_inst_len: 4,
    uses_link_register: true,
    min_frame_size: 8,
    frame_pointer: false,
};

static REGISTRY: Lazy<HashMap<&'static str, &'static Arch>> = Lazy::new(|| {
    let mut m = HashMap::new();
    for a in [&AMD64, &I386, &ARM64] {
        m.insert(a.name, a);
    }
    m.insert("x86_64", &AMD64);
    m.insert("x86", &I386);
    m.insert("aarch64", &ARM64);
    m
});

impl Arch {
    /// Look up an architecture by canonical name or common alias.
    pub fn by_name(name: &str) -> Option<&'static Arch> {
        REGISTRY.get(name.to_ascii_lowercase().as_str()).copied()
    }

    /// Map an `object` machine to a registered architecture.
    pub fn from_object(arch: object::Architecture) -> Option<&'static Arch> {
        match arch {
            object::Architecture::X86_64 => Some(&AMD64),
            object::Architecture::I386 => Some(&I386),
            object::Architecture::Aarch64 => Some(&ARM64),
            _ => None,
        }
    }

    pub fn is_64_bit(&self) -> bool {
        self.ptr_size == 8
    }

    /// Frame layout deltas relative to `SP + spdelta`.
    pub fn frame_layout(&self) -> FrameLayout {
        let word = self.word_size as i64;
        // fp = SP + S (+ return address pushed by CALL).
        let fp = if self.uses_link_register { 0 } else { word };
        let mut varp = if self.uses_link_register { fp } else { fp - word };
        if self.frame_pointer {
            varp -= word;
        }
        FrameLayout {
            varp_delta: varp,
            argp_delta: fp + self.min_frame_size as i64,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Offsets of the locals and arguments pointer regions of a frame.
///
/// Both are relative to `SP + spdelta` at a given instruction, where
/// `spdelta` is the number of bytes the function has pushed since entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameLayout {
    /// Top (exclusive) of the locals region.
    pub varp_delta: i64,
    /// Bottom of the arguments region.
    pub argp_delta: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        assert_eq!(Arch::by_name("amd64"), Some(&AMD64));
        assert_eq!(Arch::by_name("X86_64"), Some(&AMD64));
        assert_eq!(Arch::by_name("aarch64").map(|a| a.name), Some("arm64"));
        assert!(Arch::by_name("mips").is_none());
    }

    #[test]
    fn test_amd64_frame_layout() {
        let fl = AMD64.frame_layout();
        assert_eq!(fl.varp_delta, -8);
        assert_eq!(fl.argp_delta, 8);
    }

    #[test]
    fn test_link_register_frame_layout() {
        let fl = ARM64.frame_layout();
        assert_eq!(fl.varp_delta, 0);
        assert_eq!(fl.argp_delta, 8);
        let fl = I386.frame_layout();
        assert_eq!(fl.varp_delta, 0);
        assert_eq!(fl.argp_delta, 4);
    }
}
