//! Instruction and Operand types for decoded machine instructions.
//!
//! An `Instruction` is architecture-agnostic: the backend fills in the
//! mnemonic, rendered operand strings, structured operands, a control-flow
//! classification and the register/flags/memory locations it reads and writes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::address::Address;

/// Types of operands that can appear in instructions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperandKind {
    /// Register operand
    Register,
    /// Immediate value operand
    Immediate,
    /// Memory reference operand
    Memory,
    /// PC-relative branch target
    Relative,
}

/// Structured operand representation for instructions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operand {
    pub kind: OperandKind,
    /// Rendered operand text as shown in the listing
    pub text: String,
    /// Register name (for Register operands)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub register: Option<String>,
    /// Immediate value or branch target
    #[serde(skip_serializing_if = "Option::is_none")]
    pub immediate: Option<i64>,
    /// Memory base register
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    /// Memory index register
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub displacement: Option<i64>,
}

impl Operand {
    pub fn register(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind: OperandKind::Register,
            text: name.clone(),
            register: Some(name),
            immediate: None,
            base: None,
            index: None,
            scale: None,
            displacement: None,
        }
    }

    pub fn immediate(value: i64) -> Self {
        Self {
            kind: OperandKind::Immediate,
            text: format!("{:#x}", value),
            register: None,
            immediate: Some(value),
            base: None,
            index: None,
            scale: None,
            displacement: None,
        }
    }

    pub fn relative(target: Address) -> Self {
        Self {
            kind: OperandKind::Relative,
            text: format!("{:#x}", target),
            immediate: Some(target as i64),
            ..Self::immediate(0)
        }
    }

    pub fn memory(
        displacement: Option<i64>,
        base: Option<String>,
        index: Option<String>,
        scale: Option<u8>,
    ) -> Self {
        let mut parts = Vec::new();
        if let Some(b) = &base {
            parts.push(b.clone());
        }
        if let Some(i) = &index {
            match scale {
                Some(s) if s > 1 => parts.push(format!("{}*{}", i, s)),
                _ => parts.push(i.clone()),
            }
        }
        match displacement {
            Some(d) if d < 0 => parts.push(format!("-{:#x}", d.unsigned_abs())),
            Some(d) if d > 0 || parts.is_empty() => parts.push(format!("{:#x}", d)),
            _ => {}
        }
        Self {
            kind: OperandKind::Memory,
            text: format!("[{}]", parts.join("+").replace("+-", "-")),
            register: None,
            immediate: None,
            base,
            index,
            scale,
            displacement,
        }
    }

    /// Replace the rendered text (backends with their own formatter).
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Control-flow effect of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlKind {
    /// Execution continues at the next instruction.
    None,
    /// Unconditional jump.
    Jump,
    /// Conditional branch; falls through when not taken.
    CondJump,
    /// Call; returns to the next instruction.
    Call,
    /// Return from the function.
    Return,
    /// Trap or halt; execution does not continue.
    Exit,
}

/// Control-flow classification plus the statically known target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Control {
    pub kind: ControlKind,
    /// Target of a jump/branch/call when it is an immediate or pc-relative operand.
    pub target: Option<Address>,
}

impl Control {
    pub const NONE: Control = Control {
        kind: ControlKind::None,
        target: None,
    };

    pub fn new(kind: ControlKind, target: Option<Address>) -> Self {
        Self { kind, target }
    }

    /// True if the instruction transfers control anywhere but the next instruction.
    pub fn is_transfer(&self) -> bool {
        self.kind != ControlKind::None
    }

    /// A jump, branch or call whose target is computed at run time.
    pub fn is_indirect(&self) -> bool {
        matches!(
            self.kind,
            ControlKind::Jump | ControlKind::CondJump | ControlKind::Call
        ) && self.target.is_none()
    }

    /// Execution may continue at the next instruction.
    pub fn falls_through(&self) -> bool {
        matches!(
            self.kind,
            ControlKind::None | ControlKind::CondJump | ControlKind::Call
        )
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.kind {
            ControlKind::None => "none",
            ControlKind::Jump => "jump",
            ControlKind::CondJump => "cond",
            ControlKind::Call => "call",
            ControlKind::Return => "ret",
            ControlKind::Exit => "exit",
        };
        match self.target {
            Some(t) => write!(f, "{} {:#x}", name, t),
            None if self.is_indirect() => write!(f, "{} *", name),
            None => f.write_str(name),
        }
    }
}

/// A storage location tracked by SSA construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Location {
    /// Full-width architectural register.
    Reg(String),
    /// Condition flags.
    Flags,
    /// All of memory, as one location.
    Mem,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Reg(r) => f.write_str(r),
            Location::Flags => f.write_str("flags"),
            Location::Mem => f.write_str("mem"),
        }
    }
}

/// Locations an instruction reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Effects {
    pub reads: Vec<Location>,
    pub writes: Vec<Location>,
}

impl Effects {
    pub fn read(&mut self, loc: Location) {
        if !self.reads.contains(&loc) {
            self.reads.push(loc);
        }
    }

    pub fn write(&mut self, loc: Location) {
        if !self.writes.contains(&loc) {
            self.writes.push(loc);
        }
    }
}

/// A decoded machine instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    /// Program counter of the first byte.
    pub pc: Address,
    /// Encoded length in bytes.
    pub len: u8,
    pub bytes: Vec<u8>,
    /// Mnemonic, including any prefixes ("lock add").
    pub op: String,
    /// Rendered operands in listing order.
    pub args: Vec<String>,
    pub operands: Vec<Operand>,
    pub control: Control,
    pub effects: Effects,
}

impl Instruction {
    /// Address of the next instruction.
    pub fn next_pc(&self) -> Address {
        self.pc.saturating_add(self.len as u64)
    }

    /// Placeholder for bytes that could not be decoded.
    pub fn bad(pc: Address, bytes: &[u8]) -> Self {
        Self {
            pc,
            len: bytes.len() as u8,
            bytes: bytes.to_vec(),
            op: "(bad)".to_string(),
            args: Vec::new(),
            operands: Vec::new(),
            control: Control::NONE,
            effects: Effects::default(),
        }
    }

    pub fn is_bad(&self) -> bool {
        self.op == "(bad)"
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            write!(f, "{:#x}: {}", self.pc, self.op)
        } else {
            write!(f, "{:#x}: {} {}", self.pc, self.op, self.args.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_operand_text() {
        let op = Operand::memory(Some(-8), Some("rbp".into()), None, None);
        assert_eq!(op.text, "[rbp-0x8]");
        let op = Operand::memory(Some(0x10), Some("rax".into()), Some("rcx".into()), Some(8));
        assert_eq!(op.text, "[rax+rcx*8+0x10]");
        let op = Operand::memory(Some(0), None, None, None);
        assert_eq!(op.text, "[0x0]");
    }

    #[test]
    fn test_control_classification() {
        let c = Control::new(ControlKind::Jump, None);
        assert!(c.is_indirect());
        assert!(!c.falls_through());
        let c = Control::new(ControlKind::CondJump, Some(0x10));
        assert!(!c.is_indirect());
        assert!(c.falls_through());
        assert_eq!(c.to_string(), "cond 0x10");
        assert!(!Control::NONE.is_transfer());
        assert!(!Control::new(ControlKind::Return, None).is_indirect());
    }
}
