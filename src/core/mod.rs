//! Core data types shared by every analysis stage.
//!
//! Addresses, architectures, symbols, instructions and the sparse memory
//! map abstraction live here; the stages themselves live in sibling modules.

pub mod address;
pub mod arch;
pub mod instruction;
pub mod mem;
pub mod symbol;

pub use address::{Address, AddressRange};
pub use arch::{Arch, ArchFamily, FrameLayout};
pub use instruction::{Control, ControlKind, Effects, Instruction, Location, Operand, OperandKind};
pub use mem::{Mem, SparseMem};
pub use symbol::{Symbol, SymbolKind};
