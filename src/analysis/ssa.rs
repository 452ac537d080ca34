//! SSA construction over a machine-code CFG.
//!
//! Every instruction becomes one value that defines all the locations it
//! writes. A virtual root sits above the entry block and above every region
//! no other block reaches; it defines one `Param` value per location, so
//! every use has a reaching definition. Merge values are placed at the
//! iterated dominance frontier of each location's definition blocks
//! (semi-pruned: only locations read before being written in some block) and
//! uses are renamed by an explicit-stack walk of the dominator tree.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::Serialize;
use tracing::debug;

use super::cfg::Cfg;
use super::dominators::{predecessors, DominatorTree};
use crate::budget::Budget;
use crate::core::address::Address;
use crate::core::instruction::{Instruction, Location};
use crate::error::Result;

pub type ValueId = usize;

/// A use of `loc`, reading `value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Use {
    pub loc: Location,
    pub value: ValueId,
}

/// Incoming value of a merge along one predecessor edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhiArg {
    /// Predecessor block; `None` for the edge from the virtual root.
    pub pred: Option<usize>,
    pub value: ValueId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ValueKind {
    /// Value of a location on entry.
    Param(Location),
    /// Merge of `loc` at a join, one argument per predecessor edge.
    Phi { loc: Location, args: Vec<PhiArg> },
    /// The instruction at `index` in the decoded sequence.
    Inst {
        index: usize,
        pc: Address,
        text: String,
        defs: Vec<Location>,
        uses: Vec<Use>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Value {
    pub id: ValueId,
    /// Defining block; `None` for params.
    pub block: Option<usize>,
    pub kind: ValueKind,
}

impl Value {
    pub fn is_phi(&self) -> bool {
        matches!(self.kind, ValueKind::Phi { .. })
    }

    /// True if this value defines `loc`.
    pub fn defines(&self, loc: &Location) -> bool {
        match &self.kind {
            ValueKind::Param(l) | ValueKind::Phi { loc: l, .. } => l == loc,
            ValueKind::Inst { defs, .. } => defs.contains(loc),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SsaBlock {
    pub id: usize,
    pub start: Address,
    pub succs: Vec<usize>,
    pub preds: Vec<usize>,
    /// Attached to the virtual root (entry block or unreachable region head).
    pub root: bool,
    /// `None` when the immediate dominator is the virtual root.
    pub idom: Option<usize>,
    pub phis: Vec<ValueId>,
    pub insts: Vec<ValueId>,
}

impl SsaBlock {
    /// Values in definition order.
    pub fn values(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.phis.iter().chain(&self.insts).copied()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SsaFunction {
    pub blocks: Vec<SsaBlock>,
    pub values: Vec<Value>,
    pub params: Vec<ValueId>,
    /// Over blocks plus the virtual root at index `blocks.len()`.
    #[serde(skip)]
    doms: DominatorTree,
}

/// Blocks that need the virtual root: the entry, then the lowest-addressed
/// block of every region not yet reached.
fn find_roots(cfg: &Cfg) -> Vec<usize> {
    let n = cfg.blocks.len();
    let mut reached = vec![false; n];
    let mut roots = Vec::new();
    for start in 0..n {
        if reached[start] {
            continue;
        }
        roots.push(start);
        reached[start] = true;
        let mut stack = vec![start];
        while let Some(b) = stack.pop() {
            for &s in &cfg.blocks[b].succs {
                if !reached[s] {
                    reached[s] = true;
                    stack.push(s);
                }
            }
        }
    }
    roots
}

fn top(stacks: &[Vec<ValueId>], params: &[ValueId], l: usize) -> ValueId {
    stacks[l].last().copied().unwrap_or(params[l])
}

enum Visit {
    Enter(usize),
    Exit(Vec<usize>),
}

impl SsaFunction {
    /// Build SSA for `cfg`, whose blocks index into `insts`.
    pub fn build(cfg: &Cfg, insts: &[Instruction], budget: &Budget) -> Result<SsaFunction> {
        let n = cfg.blocks.len();
        let vroot = n;
        let roots = find_roots(cfg);
        let mut succs: Vec<Vec<usize>> = cfg.blocks.iter().map(|b| b.succs.clone()).collect();
        succs.push(roots.clone());
        let preds = predecessors(&succs);
        let doms = DominatorTree::compute(&succs, &preds, vroot);
        let df = doms.frontiers(&preds);

        // Locations, and which of them are live across block boundaries.
        let mut all = BTreeSet::new();
        for inst in insts {
            all.extend(inst.effects.reads.iter().cloned());
            all.extend(inst.effects.writes.iter().cloned());
        }
        let locs: Vec<Location> = all.into_iter().collect();
        let loc_ix: HashMap<Location, usize> =
            locs.iter().cloned().enumerate().map(|(i, l)| (l, i)).collect();
        let mut global = vec![false; locs.len()];
        let mut def_blocks: Vec<Vec<usize>> = vec![Vec::new(); locs.len()];
        for b in &cfg.blocks {
            let mut killed = vec![false; locs.len()];
            for inst in &insts[b.insts.clone()] {
                for r in &inst.effects.reads {
                    let l = loc_ix[r];
                    if !killed[l] {
                        global[l] = true;
                    }
                }
                for w in &inst.effects.writes {
                    let l = loc_ix[w];
                    killed[l] = true;
                    if def_blocks[l].last() != Some(&b.id) {
                        def_blocks[l].push(b.id);
                    }
                }
            }
        }

        let mut values = Vec::new();
        let params: Vec<ValueId> = locs
            .iter()
            .map(|loc| {
                let id = values.len();
                values.push(Value {
                    id,
                    block: None,
                    kind: ValueKind::Param(loc.clone()),
                });
                id
            })
            .collect();

        // Merge placement at the iterated dominance frontier.
        let mut block_phis: Vec<Vec<(usize, ValueId)>> = vec![Vec::new(); n];
        for (l, loc) in locs.iter().enumerate() {
            if !global[l] {
                continue;
            }
            let mut placed = vec![false; n];
            let mut queued = vec![false; n + 1];
            let mut work: Vec<usize> = def_blocks[l].clone();
            work.push(vroot);
            for &d in &work {
                queued[d] = true;
            }
            while let Some(d) = work.pop() {
                for &y in &df[d] {
                    if y == vroot || placed[y] {
                        continue;
                    }
                    placed[y] = true;
                    let id = values.len();
                    let args = preds[y]
                        .iter()
                        .map(|&p| PhiArg {
                            pred: (p != vroot).then_some(p),
                            value: params[l],
                        })
                        .collect();
                    values.push(Value {
                        id,
                        block: Some(y),
                        kind: ValueKind::Phi {
                            loc: loc.clone(),
                            args,
                        },
                    });
                    block_phis[y].push((l, id));
                    if !queued[y] {
                        queued[y] = true;
                        work.push(y);
                    }
                }
            }
        }

        let mut inst_value = vec![0; insts.len()];
        let mut block_insts: Vec<Vec<ValueId>> = vec![Vec::new(); n];
        for b in &cfg.blocks {
            for i in b.insts.clone() {
                let inst = &insts[i];
                let id = values.len();
                let text = if inst.args.is_empty() {
                    inst.op.clone()
                } else {
                    format!("{} {}", inst.op, inst.args.join(", "))
                };
                values.push(Value {
                    id,
                    block: Some(b.id),
                    kind: ValueKind::Inst {
                        index: i,
                        pc: inst.pc,
                        text,
                        defs: inst.effects.writes.clone(),
                        uses: Vec::new(),
                    },
                });
                inst_value[i] = id;
                block_insts[b.id].push(id);
            }
        }

        // Renaming.
        let mut stacks: Vec<Vec<ValueId>> = params.iter().map(|&p| vec![p]).collect();
        let mut work = vec![Visit::Enter(vroot)];
        while let Some(visit) = work.pop() {
            let b = match visit {
                Visit::Exit(pushed) => {
                    for l in pushed {
                        stacks[l].pop();
                    }
                    continue;
                }
                Visit::Enter(b) => b,
            };
            let mut pushed = Vec::new();
            if b != vroot {
                budget.check()?;
                for &(l, id) in &block_phis[b] {
                    stacks[l].push(id);
                    pushed.push(l);
                }
                for i in cfg.blocks[b].insts.clone() {
                    let fx = &insts[i].effects;
                    let reads: Vec<Use> = fx
                        .reads
                        .iter()
                        .map(|loc| Use {
                            loc: loc.clone(),
                            value: top(&stacks, &params, loc_ix[loc]),
                        })
                        .collect();
                    let id = inst_value[i];
                    if let ValueKind::Inst { uses, .. } = &mut values[id].kind {
                        *uses = reads;
                    }
                    for w in &fx.writes {
                        let l = loc_ix[w];
                        stacks[l].push(id);
                        pushed.push(l);
                    }
                }
            }
            let mut done: Vec<usize> = Vec::new();
            for &s in &succs[b] {
                if done.contains(&s) {
                    continue;
                }
                done.push(s);
                for (j, &p) in preds[s].iter().enumerate() {
                    if p != b {
                        continue;
                    }
                    for &(l, id) in &block_phis[s] {
                        let reaching = top(&stacks, &params, l);
                        if let ValueKind::Phi { args, .. } = &mut values[id].kind {
                            args[j].value = reaching;
                        }
                    }
                }
            }
            work.push(Visit::Exit(pushed));
            for &c in doms.children(b).iter().rev() {
                work.push(Visit::Enter(c));
            }
        }

        let blocks: Vec<SsaBlock> = cfg
            .blocks
            .iter()
            .map(|b| SsaBlock {
                id: b.id,
                start: b.start,
                succs: b.succs.clone(),
                preds: preds[b.id].iter().copied().filter(|&p| p != vroot).collect(),
                root: roots.contains(&b.id),
                idom: doms.immediate_dominator(b.id).filter(|&d| d != vroot),
                phis: block_phis[b.id].iter().map(|&(_, id)| id).collect(),
                insts: std::mem::take(&mut block_insts[b.id]),
            })
            .collect();

        let f = SsaFunction {
            blocks,
            values,
            params,
            doms,
        };
        debug!(
            blocks = f.blocks.len(),
            values = f.values.len(),
            phis = f.phi_count(),
            roots = roots.len(),
            "ssa built"
        );
        Ok(f)
    }

    pub fn value(&self, id: ValueId) -> Option<&Value> {
        self.values.get(id)
    }

    pub fn phi_count(&self) -> usize {
        self.blocks.iter().map(|b| b.phis.len()).sum()
    }

    /// Blocks with no successors.
    pub fn exit_blocks(&self) -> Vec<usize> {
        self.blocks
            .iter()
            .filter(|b| b.succs.is_empty())
            .map(|b| b.id)
            .collect()
    }

    /// Value of instruction `index`, if it was part of the function.
    pub fn value_of_inst(&self, index: usize) -> Option<&Value> {
        self.values
            .iter()
            .find(|v| matches!(v.kind, ValueKind::Inst { index: i, .. } if i == index))
    }

    /// `a` dominates `b`, over blocks.
    pub fn dominates(&self, a: usize, b: usize) -> bool {
        self.doms.dominates(a, b)
    }

    fn def_block(&self, v: &Value) -> usize {
        v.block.unwrap_or(self.blocks.len())
    }

    /// Check single definition, dominance of every use and the shape of
    /// every merge.
    pub fn verify(&self) -> std::result::Result<(), String> {
        let vroot = self.blocks.len();
        // (block, position) of every definition; phis share position 0.
        let mut pos: Vec<Option<(usize, usize)>> = vec![None; self.values.len()];
        let mut place = |id: ValueId, at: (usize, usize)| {
            let slot = pos
                .get_mut(id)
                .ok_or_else(|| format!("v{} does not exist", id))?;
            if slot.is_some() {
                return Err(format!("v{} defined twice", id));
            }
            *slot = Some(at);
            Ok(())
        };
        for &p in &self.params {
            place(p, (vroot, 0))?;
        }
        for b in &self.blocks {
            for &p in &b.phis {
                place(p, (b.id, 0))?;
            }
            for (k, &v) in b.insts.iter().enumerate() {
                place(v, (b.id, k + 1))?;
            }
        }
        for (id, p) in pos.iter().enumerate() {
            match p {
                None => return Err(format!("v{} is not placed in any block", id)),
                Some((b, _)) if self.def_block(&self.values[id]) != *b => {
                    return Err(format!("v{} is listed outside its block", id))
                }
                _ => {}
            }
        }
        let get = |id: ValueId| {
            self.values
                .get(id)
                .ok_or_else(|| format!("use of unknown value v{}", id))
        };

        for b in &self.blocks {
            for (k, &id) in b.insts.iter().enumerate() {
                let ValueKind::Inst { uses, .. } = &self.values[id].kind else {
                    return Err(format!("v{} in instruction list is not an instruction", id));
                };
                for u in uses {
                    let def = get(u.value)?;
                    if !def.defines(&u.loc) {
                        return Err(format!("v{} uses v{} for {}, which it does not define", id, u.value, u.loc));
                    }
                    let (db, dpos) = pos[u.value].unwrap_or((vroot, 0));
                    let ok = if db == b.id {
                        dpos < k + 1
                    } else {
                        self.doms.strictly_dominates(db, b.id)
                    };
                    if !ok {
                        return Err(format!("use of v{} in v{} is not dominated by its definition", u.value, id));
                    }
                }
            }
            let expected: Vec<Option<usize>> = b
                .preds
                .iter()
                .map(|&p| Some(p))
                .chain(b.root.then_some(None))
                .collect();
            for &id in &b.phis {
                let ValueKind::Phi { loc, args } = &self.values[id].kind else {
                    return Err(format!("v{} in merge list is not a merge", id));
                };
                let got: Vec<Option<usize>> = args.iter().map(|a| a.pred).collect();
                if got != expected {
                    return Err(format!(
                        "merge v{} has incoming edges {:?}, expected {:?}",
                        id, got, expected
                    ));
                }
                for a in args {
                    let def = get(a.value)?;
                    if !def.defines(loc) {
                        return Err(format!("merge v{} takes v{} for {}", id, a.value, loc));
                    }
                    let from = a.pred.unwrap_or(vroot);
                    if !self.doms.dominates(self.def_block(def), from) {
                        return Err(format!(
                            "incoming v{} of merge v{} does not dominate its edge",
                            a.value, id
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ValueKind::Param(loc) => write!(f, "v{} = param {}", self.id, loc),
            ValueKind::Phi { loc, args } => {
                write!(f, "v{} = phi {} [", self.id, loc)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    match a.pred {
                        Some(p) => write!(f, "b{}: v{}", p, a.value)?,
                        None => write!(f, "entry: v{}", a.value)?,
                    }
                }
                f.write_str("]")
            }
            ValueKind::Inst {
                pc,
                text,
                defs,
                uses,
                ..
            } => {
                write!(f, "v{} = {:#x}: {}", self.id, pc, text)?;
                if !defs.is_empty() || !uses.is_empty() {
                    f.write_str("  ;")?;
                }
                for d in defs {
                    write!(f, " {}=", d)?;
                }
                for u in uses {
                    write!(f, " {}:v{}", u.loc, u.value)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for SsaFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &p in &self.params {
            writeln!(f, "{}", self.values[p])?;
        }
        for b in &self.blocks {
            write!(f, "b{} @{:#x}:", b.id, b.start)?;
            if b.root {
                f.write_str(" <- entry")?;
            }
            for p in &b.preds {
                write!(f, " <- b{}", p)?;
            }
            writeln!(f)?;
            for id in b.values() {
                writeln!(f, "    {}", self.values[id])?;
            }
        }
        Ok(())
    }
}
