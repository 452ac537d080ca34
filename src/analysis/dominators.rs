//! Dominator tree computation for rooted directed graphs.
//!
//! A node `d` dominates `n` if every path from the root to `n` passes through
//! `d`. The immediate dominator of `n` is its closest strict dominator.
//!
//! # Algorithm
//!
//! Cooper, Harvey and Kennedy, "A Simple, Fast Dominance Algorithm": an
//! iterative fixed point over reverse postorder, intersecting the dominator
//! chains of already-processed predecessors. Graphs are given as adjacency
//! lists over node indices; nothing recurses, so deep or cyclic graphs are
//! handled with bounded stack.

const UNDEFINED: usize = usize::MAX;

/// Immediate dominators of every node reachable from the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DominatorTree {
    root: usize,
    /// Root maps to itself; unreachable nodes to `UNDEFINED`.
    idom: Vec<usize>,
    /// Reverse postorder of the reachable nodes.
    rpo: Vec<usize>,
    /// Position of each node in `rpo`.
    order: Vec<usize>,
    children: Vec<Vec<usize>>,
}

/// Postorder of the nodes reachable from `root`, by explicit-stack DFS.
fn postorder(succs: &[Vec<usize>], root: usize) -> Vec<usize> {
    let mut visited = vec![false; succs.len()];
    let mut out = Vec::with_capacity(succs.len());
    let mut stack = vec![(root, 0usize)];
    visited[root] = true;
    while let Some((node, next)) = stack.last_mut() {
        let node = *node;
        if let Some(&s) = succs[node].get(*next) {
            *next += 1;
            if !visited[s] {
                visited[s] = true;
                stack.push((s, 0));
            }
        } else {
            out.push(node);
            stack.pop();
        }
    }
    out
}

impl DominatorTree {
    /// Compute dominators of the graph given by `succs`/`preds` from `root`.
    pub fn compute(succs: &[Vec<usize>], preds: &[Vec<usize>], root: usize) -> Self {
        let n = succs.len();
        let mut rpo = postorder(succs, root);
        rpo.reverse();
        let mut order = vec![UNDEFINED; n];
        for (i, &b) in rpo.iter().enumerate() {
            order[b] = i;
        }

        let mut idom = vec![UNDEFINED; n];
        idom[root] = root;
        let mut changed = true;
        while changed {
            changed = false;
            for &b in rpo.iter().skip(1) {
                let mut new_idom = UNDEFINED;
                for &p in &preds[b] {
                    if idom[p] == UNDEFINED {
                        continue;
                    }
                    new_idom = if new_idom == UNDEFINED {
                        p
                    } else {
                        intersect(&idom, &order, p, new_idom)
                    };
                }
                if new_idom != UNDEFINED && idom[b] != new_idom {
                    idom[b] = new_idom;
                    changed = true;
                }
            }
        }

        let mut children = vec![Vec::new(); n];
        for &b in &rpo {
            if b != root {
                children[idom[b]].push(b);
            }
        }
        for c in &mut children {
            c.sort_unstable();
        }

        Self {
            root,
            idom,
            rpo,
            order,
            children,
        }
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn len(&self) -> usize {
        self.idom.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idom.is_empty()
    }

    pub fn is_reachable(&self, node: usize) -> bool {
        self.idom.get(node).is_some_and(|&d| d != UNDEFINED)
    }

    /// `None` for the root and for unreachable nodes.
    pub fn immediate_dominator(&self, node: usize) -> Option<usize> {
        match self.idom.get(node) {
            Some(&d) if d != UNDEFINED && node != self.root => Some(d),
            _ => None,
        }
    }

    /// Every node dominates itself.
    pub fn dominates(&self, a: usize, b: usize) -> bool {
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            // Dominators sit earlier in reverse postorder.
            if self.order[cur] < self.order[a] || cur == self.root {
                return false;
            }
            cur = self.idom[cur];
        }
    }

    pub fn strictly_dominates(&self, a: usize, b: usize) -> bool {
        a != b && self.dominates(a, b)
    }

    /// Nodes immediately dominated by `node`, in index order.
    pub fn children(&self, node: usize) -> &[usize] {
        self.children.get(node).map_or(&[], |c| c.as_slice())
    }

    /// Distance from the root in the dominator tree.
    pub fn depth(&self, node: usize) -> Option<usize> {
        if !self.is_reachable(node) {
            return None;
        }
        let mut d = 0;
        let mut cur = node;
        while cur != self.root {
            cur = self.idom[cur];
            d += 1;
        }
        Some(d)
    }

    pub fn reverse_postorder(&self) -> &[usize] {
        &self.rpo
    }

    /// Dominance frontier of every node (sorted, deduplicated).
    ///
    /// `DF(n)` holds the nodes where `n`'s dominance ends: a predecessor is
    /// dominated by `n` but the node itself is not strictly dominated.
    pub fn frontiers(&self, preds: &[Vec<usize>]) -> Vec<Vec<usize>> {
        let mut df: Vec<Vec<usize>> = vec![Vec::new(); self.len()];
        for &b in &self.rpo {
            let stop = self.immediate_dominator(b);
            for &p in &preds[b] {
                let mut runner = Some(p).filter(|&p| self.is_reachable(p));
                while let Some(r) = runner {
                    if Some(r) == stop {
                        break;
                    }
                    df[r].push(b);
                    runner = self.immediate_dominator(r);
                }
            }
        }
        for f in &mut df {
            f.sort_unstable();
            f.dedup();
        }
        df
    }
}

fn intersect(idom: &[usize], order: &[usize], mut a: usize, mut b: usize) -> usize {
    while a != b {
        while order[a] > order[b] {
            a = idom[a];
        }
        while order[b] > order[a] {
            b = idom[b];
        }
    }
    a
}

/// Build predecessor lists from successor lists.
pub fn predecessors(succs: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let mut preds = vec![Vec::new(); succs.len()];
    for (from, ss) in succs.iter().enumerate() {
        for &to in ss {
            preds[to].push(from);
        }
    }
    preds
}
