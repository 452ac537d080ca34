use std::sync::Arc;

use super::capstone::CapstoneDisassembler;
use super::iced::IcedDisassembler;
use super::{Disassembler, InstructionSeq};
use crate::budget::Budget;
use crate::config::DecodePolicy;
use crate::core::address::Address;
use crate::core::arch::{Arch, ArchFamily};
use crate::core::instruction::Instruction;
use crate::error::{ObjlensError, Result};
use crate::symbols::SymbolTable;

pub enum Backend {
    Iced(IcedDisassembler),
    Cap(CapstoneDisassembler),
}

impl Disassembler for Backend {
    fn arch(&self) -> &'static Arch {
        match self {
            Backend::Iced(d) => d.arch(),
            Backend::Cap(d) => d.arch(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Backend::Iced(d) => d.name(),
            Backend::Cap(d) => d.name(),
        }
    }

    fn decode_one(&self, bytes: &[u8], pc: Address) -> Result<Instruction> {
        match self {
            Backend::Iced(d) => d.decode_one(bytes, pc),
            Backend::Cap(d) => d.decode_one(bytes, pc),
        }
    }

    fn decode(
        &self,
        bytes: &[u8],
        base: Address,
        policy: DecodePolicy,
        budget: &Budget,
    ) -> Result<InstructionSeq> {
        match self {
            Backend::Iced(d) => d.decode(bytes, base, policy, budget),
            Backend::Cap(d) => d.decode(bytes, base, policy, budget),
        }
    }
}

/// Select a disassembler backend for the given architecture.
pub fn for_arch(arch: &'static Arch) -> Result<Backend> {
    match arch.family {
        ArchFamily::X86 => Ok(Backend::Iced(IcedDisassembler::new(arch))),
        ArchFamily::AArch64 => Ok(Backend::Cap(CapstoneDisassembler::new(arch))),
    }
}

/// Like `for_arch`, rendering operand addresses through `symbols` where the
/// backend supports it.
pub fn for_arch_with_symbols(arch: &'static Arch, symbols: Arc<SymbolTable>) -> Result<Backend> {
    Ok(match for_arch(arch)? {
        Backend::Iced(d) => Backend::Iced(d.with_symbols(symbols)),
        other => other,
    })
}

/// Select by architecture name ("amd64", "arm64", ...).
pub fn for_arch_name(name: &str) -> Result<Backend> {
    let arch = Arch::by_name(name)
        .ok_or_else(|| ObjlensError::UnsupportedArchitecture(name.to_string()))?;
    for_arch(arch)
}
