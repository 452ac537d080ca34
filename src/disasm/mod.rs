//! Disassembly engines and registry.
//!
//! Backends:
//! - iced-x86 for x86/x64 (full fidelity: operands, effects, symbolisation)
//! - capstone for AArch64
//!
//! A backend only has to decode one instruction; `decode` drives it over a
//! byte range, applying the caller's policy for undecodable bytes and
//! charging every instruction to the request's budget.

pub mod capstone;
pub mod iced;
pub mod registry;

use serde::Serialize;
use tracing::trace;

use crate::budget::Budget;
use crate::config::DecodePolicy;
use crate::core::address::Address;
use crate::core::arch::Arch;
use crate::core::instruction::Instruction;
use crate::error::{ObjlensError, Result};

pub use registry::{for_arch, Backend};

/// Bytes skipped under `DecodePolicy::Skip`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DecodeError {
    /// Offset from the start of the decoded range.
    pub offset: usize,
    pub pc: Address,
}

/// Instructions decoded from one byte range, in address order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstructionSeq {
    pub insts: Vec<Instruction>,
    /// Undecodable positions that were replaced by `(bad)` placeholders.
    pub errors: Vec<DecodeError>,
}

impl InstructionSeq {
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&Instruction> {
        self.insts.get(i)
    }

    /// Index of the instruction starting exactly at `pc`.
    pub fn index_of(&self, pc: Address) -> Option<usize> {
        self.insts.binary_search_by_key(&pc, |i| i.pc).ok()
    }
}

/// An instruction decoder for one architecture.
pub trait Disassembler: Send + Sync {
    fn arch(&self) -> &'static Arch;

    fn name(&self) -> &'static str;

    /// Decode the instruction at the start of `bytes`, located at `pc`.
    ///
    /// Fails with `UndecodableInstruction { offset: 0, .. }` when the bytes
    /// are not a valid (or complete) instruction.
    fn decode_one(&self, bytes: &[u8], pc: Address) -> Result<Instruction>;

    /// Decode all of `bytes`, loaded at `base`.
    fn decode(
        &self,
        bytes: &[u8],
        base: Address,
        policy: DecodePolicy,
        budget: &Budget,
    ) -> Result<InstructionSeq> {
        decode_with(self.arch(), bytes, base, policy, budget, |b, pc| {
            self.decode_one(b, pc)
        })
    }
}

/// Drive `decode_one` over `bytes`.
///
/// Decoding resumes right after each decoded instruction, so every boundary
/// it reports is one a later call can restart from.
pub fn decode_with<F>(
    arch: &Arch,
    bytes: &[u8],
    base: Address,
    policy: DecodePolicy,
    budget: &Budget,
    mut decode_one: F,
) -> Result<InstructionSeq>
where
    F: FnMut(&[u8], Address) -> Result<Instruction>,
{
    let mut seq = InstructionSeq::default();
    let mut off = 0usize;
    while off < bytes.len() {
        budget.tick()?;
        let pc = base
            .checked_add(off as u64)
            .ok_or(ObjlensError::OutOfRange {
                start: base,
                end: u64::MAX,
            })?;
        match decode_one(&bytes[off..], pc) {
            Ok(inst) if inst.len > 0 => {
                off += inst.len as usize;
                seq.insts.push(inst);
            }
            Ok(_) | Err(ObjlensError::UndecodableInstruction { .. }) => match policy {
                DecodePolicy::Abort => {
                    return Err(ObjlensError::UndecodableInstruction { offset: off, pc });
                }
                DecodePolicy::Skip => {
                    trace!(offset = off, pc = format_args!("{:#x}", pc), "skipping undecodable bytes");
                    let step = (arch.min_inst_len as usize).clamp(1, bytes.len() - off);
                    seq.errors.push(DecodeError { offset: off, pc });
                    seq.insts.push(Instruction::bad(pc, &bytes[off..off + step]));
                    off += step;
                }
            },
            Err(e) => return Err(e),
        }
    }
    Ok(seq)
}

/// Split a capstone-style operand string on top-level commas.
pub(crate) fn split_operands(ops: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut cur = String::new();
    for c in ops.chars() {
        match c {
            '[' | '{' | '(' => depth += 1,
            ']' | '}' | ')' => depth -= 1,
            ',' if depth == 0 => {
                out.push(cur.trim().to_string());
                cur.clear();
                continue;
            }
            _ => {}
        }
        cur.push(c);
    }
    if !cur.trim().is_empty() {
        out.push(cur.trim().to_string());
    }
    out
}
