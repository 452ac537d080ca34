//! Per-function analyses over decoded instructions.
//!
//! `cfg` partitions an instruction sequence into basic blocks, `dominators`
//! and `ssa` build SSA form over that graph, and `pipeline` runs the stages
//! for one symbol at a time.

pub mod cfg;
pub mod dominators;
pub mod pipeline;
pub mod ssa;
