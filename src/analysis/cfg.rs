//! Basic-block partitioning and control-flow graph construction.
//!
//! Blocks start at the first instruction, at every resolved jump, branch or
//! call target inside the sequence, and right after every control transfer.
//! Blocks are stored in address order and addressed by index.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::ops::Range;

use serde::Serialize;
use tracing::{debug, trace};

use crate::budget::Budget;
use crate::core::address::Address;
use crate::core::instruction::{ControlKind, Instruction};
use crate::error::{ObjlensError, Result};

/// Edge kind in control flow graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EdgeKind {
    /// Execution continues at the next block (also after calls).
    Fallthrough,
    /// Taken side of a conditional branch.
    Taken,
    /// Unconditional jump.
    Jump,
}

impl EdgeKind {
    pub fn value(&self) -> &'static str {
        match self {
            EdgeKind::Fallthrough => "fallthrough",
            EdgeKind::Taken => "taken",
            EdgeKind::Jump => "jump",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub from: usize,
    pub to: usize,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BasicBlock {
    pub id: usize,
    pub start: Address,
    /// Address just past the last instruction.
    pub end: Address,
    /// Instruction indices covered by this block.
    pub insts: Range<usize>,
    /// Successor blocks in edge order; a block may appear twice.
    pub succs: Vec<usize>,
    /// Predecessor blocks, one entry per incoming edge.
    pub preds: Vec<usize>,
}

impl BasicBlock {
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    /// Index of the block's last instruction.
    pub fn last(&self) -> usize {
        self.insts.end - 1
    }
}

/// Control-flow graph of one instruction sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Cfg {
    pub blocks: Vec<BasicBlock>,
    pub edges: Vec<Edge>,
    /// Pcs of transfers whose target could not be resolved (indirect jumps,
    /// or targets inside an instruction). Their blocks have no edge for it.
    pub unresolved: Vec<Address>,
}

fn index_of(insts: &[Instruction], pc: Address) -> Option<usize> {
    insts.binary_search_by_key(&pc, |i| i.pc).ok()
}

/// Target lies inside the decoded range but not on an instruction boundary.
fn inside(insts: &[Instruction], pc: Address) -> bool {
    match (insts.first(), insts.last()) {
        (Some(first), Some(last)) => first.pc <= pc && pc < last.next_pc(),
        _ => false,
    }
}

impl Cfg {
    /// Best-effort graph: ambiguous transfers are recorded in `unresolved`.
    pub fn build(insts: &[Instruction], budget: &Budget) -> Result<Cfg> {
        let n = insts.len();
        if n == 0 {
            return Ok(Cfg::default());
        }

        // Pass 1: block starts.
        let mut starts = BTreeSet::new();
        starts.insert(0usize);
        let mut unresolved = Vec::new();
        for (i, inst) in insts.iter().enumerate() {
            let control = inst.control;
            if !control.is_transfer() {
                continue;
            }
            if let Some(t) = control.target {
                match index_of(insts, t) {
                    Some(j) => {
                        starts.insert(j);
                    }
                    None if inside(insts, t) && control.kind != ControlKind::Call => {
                        trace!(pc = format_args!("{:#x}", inst.pc), target = format_args!("{:#x}", t), "target inside an instruction");
                        unresolved.push(inst.pc);
                    }
                    None => {}
                }
            } else if matches!(control.kind, ControlKind::Jump | ControlKind::CondJump) {
                unresolved.push(inst.pc);
            }
            if i + 1 < n {
                starts.insert(i + 1);
            }
        }

        // Pass 2: partition.
        let starts: Vec<usize> = starts.into_iter().collect();
        let mut blocks = Vec::with_capacity(starts.len());
        let mut block_of_inst = vec![0usize; n];
        for (id, &s) in starts.iter().enumerate() {
            budget.check()?;
            let e = starts.get(id + 1).copied().unwrap_or(n);
            block_of_inst[s..e].fill(id);
            blocks.push(BasicBlock {
                id,
                start: insts[s].pc,
                end: insts[e - 1].next_pc(),
                insts: s..e,
                succs: Vec::new(),
                preds: Vec::new(),
            });
        }

        // Pass 3: edges.
        let mut edges = Vec::new();
        let nblocks = blocks.len();
        for b in 0..nblocks {
            budget.check()?;
            let last = &insts[blocks[b].last()];
            let next = (b + 1 < nblocks).then_some(b + 1);
            let target = last
                .control
                .target
                .and_then(|t| index_of(insts, t))
                .map(|j| block_of_inst[j]);
            let mut add = |to: Option<usize>, kind| {
                if let Some(to) = to {
                    edges.push(Edge { from: b, to, kind });
                }
            };
            match last.control.kind {
                ControlKind::None | ControlKind::Call => add(next, EdgeKind::Fallthrough),
                ControlKind::CondJump => {
                    add(target, EdgeKind::Taken);
                    add(next, EdgeKind::Fallthrough);
                }
                ControlKind::Jump => add(target, EdgeKind::Jump),
                ControlKind::Return | ControlKind::Exit => {}
            }
        }
        for e in &edges {
            blocks[e.from].succs.push(e.to);
            blocks[e.to].preds.push(e.from);
        }

        debug!(
            insts = n,
            blocks = blocks.len(),
            edges = edges.len(),
            unresolved = unresolved.len(),
            "cfg built"
        );
        Ok(Cfg {
            blocks,
            edges,
            unresolved,
        })
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn entry(&self) -> Option<&BasicBlock> {
        self.blocks.first()
    }

    /// Block containing instruction index `inst`.
    pub fn block_of(&self, inst: usize) -> Option<&BasicBlock> {
        let i = self.blocks.partition_point(|b| b.insts.end <= inst);
        self.blocks.get(i).filter(|b| b.insts.contains(&inst))
    }

    /// Block starting exactly at `pc`.
    pub fn block_at(&self, pc: Address) -> Option<&BasicBlock> {
        self.blocks
            .binary_search_by_key(&pc, |b| b.start)
            .ok()
            .map(|i| &self.blocks[i])
    }

    /// Outgoing edges of `block`, in successor order.
    pub fn edges_from(&self, block: usize) -> impl Iterator<Item = &Edge> + '_ {
        self.edges.iter().filter(move |e| e.from == block)
    }

    /// Blocks with no successors.
    pub fn exit_blocks(&self) -> Vec<usize> {
        self.blocks
            .iter()
            .filter(|b| b.succs.is_empty())
            .map(|b| b.id)
            .collect()
    }

    /// Check partition and adjacency invariants.
    pub fn validate(&self, insts: &[Instruction]) -> std::result::Result<(), String> {
        let mut expected = 0;
        for (i, b) in self.blocks.iter().enumerate() {
            if b.id != i {
                return Err(format!("block {} has id {}", i, b.id));
            }
            if b.insts.start != expected || b.insts.is_empty() {
                return Err(format!("block {} does not continue the partition", i));
            }
            expected = b.insts.end;
        }
        if expected != insts.len() {
            return Err(format!(
                "blocks cover {} of {} instructions",
                expected,
                insts.len()
            ));
        }
        for e in &self.edges {
            if e.from >= self.blocks.len() || e.to >= self.blocks.len() {
                return Err(format!("edge {:?} references unknown block", e));
            }
        }
        let mut succ_count = 0;
        let mut pred_count = 0;
        for b in &self.blocks {
            succ_count += b.succs.len();
            pred_count += b.preds.len();
        }
        if succ_count != self.edges.len() || pred_count != self.edges.len() {
            return Err("adjacency lists disagree with edge list".to_string());
        }
        Ok(())
    }

    /// Render as Graphviz, one box per block listing its instructions.
    pub fn to_dot(&self, name: &str, insts: &[Instruction]) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph \"{}\" {{", escape(name));
        let _ = writeln!(out, "  node [shape=box, fontname=\"monospace\"];");
        for b in &self.blocks {
            let mut label = String::new();
            for inst in insts.get(b.insts.clone()).unwrap_or(&[]) {
                let _ = write!(label, "{}\\l", escape(&inst.to_string()));
            }
            let _ = writeln!(out, "  b{} [label=\"{}\"];", b.id, label);
        }
        for e in &self.edges {
            let _ = writeln!(
                out,
                "  b{} -> b{} [label=\"{}\"];",
                e.from,
                e.to,
                e.kind.value()
            );
        }
        out.push_str("}\n");
        out
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Strict partition: fails on the first unresolved transfer.
pub fn basic_blocks(insts: &[Instruction]) -> Result<Cfg> {
    let cfg = Cfg::build(insts, &Budget::unlimited())?;
    if let Some(&pc) = cfg.unresolved.first() {
        return Err(ObjlensError::UnresolvedControlFlow { pc });
    }
    Ok(cfg)
}
