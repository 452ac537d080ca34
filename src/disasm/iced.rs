//! x86 / x86-64 backend on iced-x86.

use std::sync::Arc;

use iced_x86::{
    Decoder, DecoderOptions, FlowControl, Formatter, InstructionInfoFactory, IntelFormatter,
    OpAccess, OpKind, Register as IReg, SymbolResolver, SymbolResult,
};

use super::Disassembler;
use crate::core::address::Address;
use crate::core::arch::{Arch, AMD64, I386};
use crate::core::instruction::{
    Control, ControlKind, Effects, Instruction, Location, Operand,
};
use crate::error::{ObjlensError, Result};
use crate::symbols::SymbolTable;

pub struct IcedDisassembler {
    arch: &'static Arch,
    bitness: u32,
    symbols: Option<Arc<SymbolTable>>,
}

/// Renders addresses that fall inside a symbol as `name+off`.
struct TableResolver(Arc<SymbolTable>);

impl SymbolResolver for TableResolver {
    fn symbol(
        &mut self,
        _instruction: &iced_x86::Instruction,
        _operand: u32,
        _instruction_operand: Option<u32>,
        address: u64,
        _address_size: u32,
    ) -> Option<SymbolResult<'_>> {
        let (name, base) = self.0.sym_name(address)?;
        Some(SymbolResult::with_str(base, name))
    }
}

fn reg_name(r: IReg) -> String {
    format!("{:?}", r).to_ascii_lowercase()
}

fn opt_reg(r: IReg) -> Option<String> {
    (r != IReg::None).then(|| reg_name(r))
}

fn branch_target(instr: &iced_x86::Instruction) -> Option<Address> {
    match instr.op0_kind() {
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
            Some(instr.near_branch_target())
        }
        _ => None,
    }
}

/// Control-flow classification from iced's flow-control class.
fn classify(instr: &iced_x86::Instruction) -> Control {
    match instr.flow_control() {
        FlowControl::Next | FlowControl::Interrupt | FlowControl::XbeginXabortXend => Control::NONE,
        FlowControl::UnconditionalBranch => Control::new(ControlKind::Jump, branch_target(instr)),
        FlowControl::IndirectBranch => Control::new(ControlKind::Jump, None),
        FlowControl::ConditionalBranch => {
            Control::new(ControlKind::CondJump, branch_target(instr))
        }
        FlowControl::Call => Control::new(ControlKind::Call, branch_target(instr)),
        FlowControl::IndirectCall => Control::new(ControlKind::Call, None),
        FlowControl::Return => Control::new(ControlKind::Return, None),
        FlowControl::Exception => Control::new(ControlKind::Exit, None),
    }
}

impl IcedDisassembler {
    pub fn new(arch: &'static Arch) -> Self {
        let bitness = if arch.is_64_bit() { 64 } else { 32 };
        Self {
            arch,
            bitness,
            symbols: None,
        }
    }

    pub fn amd64() -> Self {
        Self::new(&AMD64)
    }

    pub fn i386() -> Self {
        Self::new(&I386)
    }

    /// Symbolise operand addresses through `symbols`.
    pub fn with_symbols(mut self, symbols: Arc<SymbolTable>) -> Self {
        self.symbols = Some(symbols);
        self
    }

    fn formatter(&self) -> IntelFormatter {
        let resolver = self
            .symbols
            .as_ref()
            .map(|s| Box::new(TableResolver(Arc::clone(s))) as Box<dyn SymbolResolver>);
        let mut fmt = IntelFormatter::with_options(resolver, None);
        let opts = fmt.options_mut();
        opts.set_hex_prefix("0x");
        opts.set_hex_suffix("");
        opts.set_uppercase_hex(false);
        opts.set_space_after_operand_separator(true);
        opts.set_show_branch_size(false);
        fmt
    }

    fn full_register(&self, r: IReg) -> IReg {
        if self.bitness == 64 {
            r.full_register()
        } else {
            r.full_register32()
        }
    }

    fn operands(&self, instr: &iced_x86::Instruction) -> Vec<Operand> {
        let mut out = Vec::with_capacity(instr.op_count() as usize);
        for i in 0..instr.op_count() {
            let op = match instr.op_kind(i) {
                OpKind::Register => Operand::register(reg_name(instr.op_register(i))),
                OpKind::Memory => {
                    let scale = instr.memory_index_scale();
                    Operand::memory(
                        Some(instr.memory_displacement64() as i64),
                        opt_reg(instr.memory_base()),
                        opt_reg(instr.memory_index()),
                        (instr.memory_index() != IReg::None).then_some(scale as u8),
                    )
                }
                OpKind::Immediate8 => Operand::immediate(instr.immediate8() as i8 as i64),
                OpKind::Immediate16 => Operand::immediate(instr.immediate16() as i16 as i64),
                OpKind::Immediate32 => Operand::immediate(instr.immediate32() as i32 as i64),
                OpKind::Immediate64 => Operand::immediate(instr.immediate64() as i64),
                OpKind::Immediate8to16
                | OpKind::Immediate8to32
                | OpKind::Immediate8to64
                | OpKind::Immediate32to64
                | OpKind::Immediate8_2nd => Operand::immediate(instr.immediate(i) as i64),
                OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                    Operand::relative(instr.near_branch_target())
                }
                // String operands and far pointers have no structured form.
                _ => continue,
            };
            out.push(op);
        }
        out
    }

    fn effects(&self, instr: &iced_x86::Instruction) -> Effects {
        let mut fx = Effects::default();
        let mut factory = InstructionInfoFactory::new();
        let info = factory.info(instr);
        for used in info.used_registers() {
            let reg = self.full_register(used.register());
            if reg == IReg::None || reg.is_segment_register() || reg.is_ip() {
                continue;
            }
            let loc = Location::Reg(reg_name(reg));
            match used.access() {
                OpAccess::Read | OpAccess::CondRead => fx.read(loc),
                OpAccess::Write | OpAccess::CondWrite => fx.write(loc),
                OpAccess::ReadWrite | OpAccess::ReadCondWrite => {
                    fx.read(loc.clone());
                    fx.write(loc);
                }
                OpAccess::None | OpAccess::NoMemAccess => {}
            }
        }
        for mem in info.used_memory() {
            match mem.access() {
                OpAccess::Read | OpAccess::CondRead => fx.read(Location::Mem),
                OpAccess::Write | OpAccess::CondWrite => fx.write(Location::Mem),
                OpAccess::ReadWrite | OpAccess::ReadCondWrite => {
                    fx.read(Location::Mem);
                    fx.write(Location::Mem);
                }
                OpAccess::None | OpAccess::NoMemAccess => {}
            }
        }
        if instr.rflags_read() != 0 {
            fx.read(Location::Flags);
        }
        if instr.rflags_modified() != 0 {
            fx.write(Location::Flags);
        }
        fx
    }
}

impl Disassembler for IcedDisassembler {
    fn arch(&self) -> &'static Arch {
        self.arch
    }

    fn name(&self) -> &'static str {
        "iced-x86"
    }

    fn decode_one(&self, bytes: &[u8], pc: Address) -> Result<Instruction> {
        let window = &bytes[..bytes.len().min(self.arch.max_inst_len as usize)];
        let mut decoder = Decoder::with_ip(self.bitness, window, pc, DecoderOptions::NONE);
        let instr = decoder.decode();
        if instr.is_invalid() {
            return Err(ObjlensError::UndecodableInstruction { offset: 0, pc });
        }
        let len = instr.len();

        let mut fmt = self.formatter();
        let mut op = String::new();
        fmt.format_mnemonic(&instr, &mut op);
        let mut operands = self.operands(&instr);
        let mut args = Vec::new();
        for i in 0..fmt.operand_count(&instr) {
            let mut text = String::new();
            if fmt.format_operand(&instr, &mut text, i).is_err() {
                continue;
            }
            // Show the formatter's (possibly symbolised) text on the structured operand too.
            if let Ok(Some(j)) = fmt.get_instruction_operand(&instr, i) {
                let idx = (0..j).filter(|&k| is_structured(instr.op_kind(k))).count();
                if is_structured(instr.op_kind(j)) {
                    if let Some(o) = operands.get_mut(idx) {
                        o.text = text.clone();
                    }
                }
            }
            args.push(text);
        }

        Ok(Instruction {
            pc,
            len: len as u8,
            bytes: window[..len].to_vec(),
            op,
            args,
            operands,
            control: classify(&instr),
            effects: self.effects(&instr),
        })
    }
}

fn is_structured(kind: OpKind) -> bool {
    matches!(
        kind,
        OpKind::Register
            | OpKind::Memory
            | OpKind::Immediate8
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64
            | OpKind::Immediate8_2nd
            | OpKind::NearBranch16
            | OpKind::NearBranch32
            | OpKind::NearBranch64
    )
}
