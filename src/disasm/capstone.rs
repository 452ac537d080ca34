//! AArch64 backend on capstone.
//!
//! Control flow is classified from the mnemonic; branch targets come from
//! the instruction's immediate operand. Register effects are approximated
//! from operand positions (the first register operand of a data-processing
//! instruction is its destination).

use capstone::arch::arm64::Arm64OperandType;
use capstone::prelude::*;
use capstone::{Arch as CsArch, Capstone, Endian, Mode, NO_EXTRA_MODE};

use super::{decode_with, split_operands, Disassembler, InstructionSeq};
use crate::budget::Budget;
use crate::config::DecodePolicy;
use crate::core::address::Address;
use crate::core::arch::{Arch, ARM64};
use crate::core::instruction::{
    Control, ControlKind, Effects, Instruction, Location, Operand,
};
use crate::error::{ObjlensError, Result};

pub struct CapstoneDisassembler {
    arch: &'static Arch,
}

/// Control-flow class of an AArch64 mnemonic.
fn classify_ctrl_flow(m: &str) -> ControlKind {
    match m {
        "ret" | "retaa" | "retab" | "eret" => ControlKind::Return,
        "bl" | "blr" | "blraa" | "blrab" => ControlKind::Call,
        "b" | "br" | "braa" | "brab" => ControlKind::Jump,
        "cbz" | "cbnz" | "tbz" | "tbnz" => ControlKind::CondJump,
        "brk" | "udf" | "hlt" => ControlKind::Exit,
        _ if m.starts_with("b.") => ControlKind::CondJump,
        _ => ControlKind::None,
    }
}

/// Non-branch mnemonics whose register operands are all sources.
fn writes_no_register(m: &str) -> bool {
    matches!(m, "cmp" | "cmn" | "tst" | "ccmp" | "ccmn" | "fcmp" | "prfm") || m.starts_with("st")
}

fn sets_flags(m: &str) -> bool {
    matches!(
        m,
        "cmp" | "cmn" | "tst" | "ccmp" | "ccmn" | "fcmp" | "adds" | "subs" | "ands" | "bics"
            | "adcs" | "sbcs" | "negs"
    )
}

fn reads_flags(m: &str) -> bool {
    m.starts_with("b.")
        || matches!(
            m,
            "csel" | "csinc" | "csinv" | "csneg" | "cset" | "csetm" | "cinc" | "cinv" | "cneg"
                | "adc" | "adcs" | "sbc" | "sbcs" | "ccmp" | "ccmn" | "fcsel"
        )
}

/// `w3` -> `x3`, `wsp` -> `sp`; zero registers have no location.
fn canonical_reg(name: &str) -> Option<String> {
    match name {
        "xzr" | "wzr" => None,
        "wsp" | "sp" => Some("sp".to_string()),
        _ => match name.strip_prefix('w') {
            Some(n) if n.chars().all(|c| c.is_ascii_digit()) => Some(format!("x{}", n)),
            _ => Some(name.to_string()),
        },
    }
}

fn new_capstone() -> Result<Capstone> {
    let mut cs = Capstone::new_raw(CsArch::ARM64, Mode::Arm, NO_EXTRA_MODE, Some(Endian::Little))
        .map_err(|e| ObjlensError::UnsupportedArchitecture(e.to_string()))?;
    cs.set_detail(true)
        .map_err(|e| ObjlensError::UnsupportedArchitecture(e.to_string()))?;
    Ok(cs)
}

impl CapstoneDisassembler {
    pub fn new(arch: &'static Arch) -> Self {
        Self { arch }
    }

    pub fn arm64() -> Self {
        Self::new(&ARM64)
    }

    fn decode_with_cs(cs: &Capstone, bytes: &[u8], pc: Address) -> Result<Instruction> {
        let undecodable = || ObjlensError::UndecodableInstruction { offset: 0, pc };
        let window = &bytes[..bytes.len().min(4)];
        let insns = cs.disasm_count(window, pc, 1).map_err(|_| undecodable())?;
        let insn = insns.iter().next().ok_or_else(undecodable)?;
        let op = insn.mnemonic().unwrap_or("").to_string();
        let args = split_operands(insn.op_str().unwrap_or(""));

        let mut operands = Vec::new();
        let mut imm_target = None;
        let mut regs = Vec::new();
        let mut mem_base = Vec::new();
        let mut has_mem = false;
        if let Ok(detail) = cs.insn_detail(insn) {
            if let Some(ad) = detail.arch_detail().arm64() {
                for opnd in ad.operands() {
                    match opnd.op_type {
                        Arm64OperandType::Reg(r) => {
                            let name = cs.reg_name(r).unwrap_or_default();
                            regs.push(name.clone());
                            operands.push(Operand::register(name));
                        }
                        Arm64OperandType::Imm(i) => {
                            imm_target = Some(i as u64);
                            operands.push(Operand::immediate(i));
                        }
                        Arm64OperandType::Mem(m) => {
                            has_mem = true;
                            let base = (m.base().0 != 0).then(|| cs.reg_name(m.base()).unwrap_or_default());
                            let index = (m.index().0 != 0).then(|| cs.reg_name(m.index()).unwrap_or_default());
                            mem_base.extend(base.iter().cloned());
                            mem_base.extend(index.iter().cloned());
                            operands.push(Operand::memory(Some(m.disp() as i64), base, index, None));
                        }
                        _ => {}
                    }
                }
            }
        }
        // Pair the capstone operand text with the structured operand where they line up.
        if operands.len() == args.len() {
            for (o, text) in operands.iter_mut().zip(&args) {
                o.text = text.clone();
            }
        }

        let kind = classify_ctrl_flow(&op);
        let target = match kind {
            ControlKind::Jump | ControlKind::CondJump | ControlKind::Call => imm_target,
            _ => None,
        };
        let control = if kind == ControlKind::None {
            Control::NONE
        } else {
            Control::new(kind, target)
        };

        let mut fx = Effects::default();
        let mut rest = regs.iter();
        if kind == ControlKind::None && !writes_no_register(&op) {
            if let Some(dst) = rest.next().and_then(|r| canonical_reg(r)) {
                fx.write(Location::Reg(dst));
            }
        }
        for r in rest.chain(mem_base.iter()).filter_map(|r| canonical_reg(r)) {
            fx.read(Location::Reg(r));
        }
        if has_mem {
            if op.starts_with("st") {
                fx.write(Location::Mem);
            } else if op.starts_with("ld") {
                fx.read(Location::Mem);
            }
        }
        if kind == ControlKind::Call {
            fx.write(Location::Reg("x30".to_string()));
        }
        if kind == ControlKind::Return && regs.is_empty() {
            fx.read(Location::Reg("x30".to_string()));
        }
        if reads_flags(&op) {
            fx.read(Location::Flags);
        }
        if sets_flags(&op) {
            fx.write(Location::Flags);
        }

        let bytes = insn.bytes().to_vec();
        Ok(Instruction {
            pc,
            len: bytes.len() as u8,
            bytes,
            op,
            args,
            operands,
            control,
            effects: fx,
        })
    }
}

impl Disassembler for CapstoneDisassembler {
    fn arch(&self) -> &'static Arch {
        self.arch
    }

    fn name(&self) -> &'static str {
        "capstone"
    }

    fn decode_one(&self, bytes: &[u8], pc: Address) -> Result<Instruction> {
        Self::decode_with_cs(&new_capstone()?, bytes, pc)
    }

    /// One capstone handle per sequence; handles are not shareable across threads.
    fn decode(
        &self,
        bytes: &[u8],
        base: Address,
        policy: DecodePolicy,
        budget: &Budget,
    ) -> Result<InstructionSeq> {
        let cs = new_capstone()?;
        decode_with(self.arch, bytes, base, policy, budget, |b, pc| {
            Self::decode_with_cs(&cs, b, pc)
        })
    }
}
