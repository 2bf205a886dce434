//! The dependency graph (§4.3): node keys, forward/reverse edges, the range
//! membership index, the open-range frontier index, cycle detection, and
//! deterministic dirty-ordering for recalculation.

use rustc_hash::{FxHashMap, FxHashSet};

use formualizer_common::CellAddress;

/// A stable, serializable identifier for a graph node, matching the key
/// formats in §4.3: `cell:wb:sh:c:r`, `range:wb:sh:c1:r1:c2|inf:r2|inf`,
/// `name:scope:n`, `tableCol:wb:tbl:col`.
pub type NodeKey = String;

/// Sort key used to give a deterministic recompute/event order: sheet index
/// is the caller's own bookkeeping (the graph doesn't know sheet order, so it
/// takes it as an input), then row, then column, then the key string as a
/// last-resort tiebreak.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirtyOrder {
    pub sheet_index: u32,
    pub row: u32,
    pub col: u32,
    pub key: NodeKey,
}

/// Directed precedent/dependent edges plus the auxiliary indexes needed to
/// invalidate range reads and open-range (frontier) reads cheaply.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    /// dependent -> the precedents it reads.
    forward: FxHashMap<NodeKey, FxHashSet<NodeKey>>,
    /// precedent -> the dependents that read it.
    reverse: FxHashMap<NodeKey, FxHashSet<NodeKey>>,
    /// cell key -> range node keys whose bounded region covers that cell.
    range_membership: FxHashMap<NodeKey, FxHashSet<NodeKey>>,
    /// (sheet, column) -> formula cells whose spill could reach down that column.
    column_frontier: FxHashMap<(String, u32), FxHashSet<NodeKey>>,
    /// (sheet, row) -> formula cells whose spill could reach across that row.
    row_frontier: FxHashMap<(String, u32), FxHashSet<NodeKey>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces `dependent`'s full precedent set, updating both adjacency
    /// maps. Called once per node at the start of each re-evaluation (§4.7
    /// step 3: "clears its old dependency set ... then evaluates").
    pub fn set_dependencies(&mut self, dependent: &NodeKey, precedents: impl IntoIterator<Item = NodeKey>) {
        self.clear_dependencies(dependent);
        let set = self.forward.entry(dependent.clone()).or_default();
        for p in precedents {
            set.insert(p.clone());
            self.reverse.entry(p).or_default().insert(dependent.clone());
        }
    }

    pub fn clear_dependencies(&mut self, dependent: &NodeKey) {
        if let Some(old) = self.forward.remove(dependent) {
            for p in old {
                if let Some(rev) = self.reverse.get_mut(&p) {
                    rev.remove(dependent);
                    if rev.is_empty() {
                        self.reverse.remove(&p);
                    }
                }
            }
        }
    }

    /// Drops every edge naming `key`, in either direction. Used when a cell,
    /// range, named expression, or table column is removed outright.
    pub fn remove_node(&mut self, key: &NodeKey) {
        self.clear_dependencies(key);
        if let Some(dependents) = self.reverse.remove(key) {
            for d in dependents {
                if let Some(fwd) = self.forward.get_mut(&d) {
                    fwd.remove(key);
                }
            }
        }
    }

    pub fn add_range_membership(&mut self, cell: NodeKey, range_node: NodeKey) {
        self.range_membership.entry(cell).or_default().insert(range_node);
    }

    pub fn ranges_covering(&self, cell: &NodeKey) -> impl Iterator<Item = &NodeKey> {
        self.range_membership.get(cell).into_iter().flatten()
    }

    pub fn add_column_frontier(&mut self, sheet: &str, col: u32, formula_cell: NodeKey) {
        self.column_frontier
            .entry((sheet.to_string(), col))
            .or_default()
            .insert(formula_cell);
    }

    pub fn add_row_frontier(&mut self, sheet: &str, row: u32, formula_cell: NodeKey) {
        self.row_frontier
            .entry((sheet.to_string(), row))
            .or_default()
            .insert(formula_cell);
    }

    pub fn column_frontier(&self, sheet: &str, col: u32) -> impl Iterator<Item = &NodeKey> {
        self.column_frontier.get(&(sheet.to_string(), col)).into_iter().flatten()
    }

    pub fn row_frontier(&self, sheet: &str, row: u32) -> impl Iterator<Item = &NodeKey> {
        self.row_frontier.get(&(sheet.to_string(), row)).into_iter().flatten()
    }

    pub fn dependents_of(&self, key: &NodeKey) -> impl Iterator<Item = &NodeKey> {
        self.reverse.get(key).into_iter().flatten()
    }

    pub fn precedents_of(&self, key: &NodeKey) -> impl Iterator<Item = &NodeKey> {
        self.forward.get(key).into_iter().flatten()
    }

    /// Walks the reverse-dependency closure of `roots`, returning every
    /// reachable node (roots included). Used to build the dirty set for a
    /// mutation batch (§4.7 step 2).
    pub fn transitive_dependents(&self, roots: impl IntoIterator<Item = NodeKey>) -> FxHashSet<NodeKey> {
        let mut seen: FxHashSet<NodeKey> = FxHashSet::default();
        let mut stack: Vec<NodeKey> = roots.into_iter().collect();
        while let Some(key) = stack.pop() {
            if seen.insert(key.clone()) {
                stack.extend(self.dependents_of(&key).cloned());
            }
        }
        seen
    }

    /// Iterative DFS cycle detection with white/gray/black coloring (§4.3).
    /// Returns the set of node keys that participate in at least one cycle.
    pub fn detect_cycles(&self) -> FxHashSet<NodeKey> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut color: FxHashMap<NodeKey, Color> = FxHashMap::default();
        let mut in_cycle: FxHashSet<NodeKey> = FxHashSet::default();
        let nodes: Vec<NodeKey> = self
            .forward
            .keys()
            .chain(self.reverse.keys())
            .cloned()
            .collect::<FxHashSet<_>>()
            .into_iter()
            .collect();

        for start in &nodes {
            if matches!(color.get(start), Some(Color::Black)) {
                continue;
            }
            // (node, child-iterator-index, path-so-far)
            let mut stack: Vec<(NodeKey, usize)> = vec![(start.clone(), 0)];
            let mut path: Vec<NodeKey> = vec![start.clone()];
            color.insert(start.clone(), Color::Gray);

            while let Some((node, idx)) = stack.pop() {
                let children: Vec<NodeKey> = self.precedents_of(&node).cloned().collect();
                if idx < children.len() {
                    stack.push((node.clone(), idx + 1));
                    let child = &children[idx];
                    match color.get(child) {
                        Some(Color::Gray) => {
                            // Found a cycle: everything on `path` from the first
                            // occurrence of `child` onward participates.
                            if let Some(pos) = path.iter().position(|k| k == child) {
                                in_cycle.extend(path[pos..].iter().cloned());
                            }
                        }
                        Some(Color::Black) => {}
                        _ => {
                            color.insert(child.clone(), Color::Gray);
                            path.push(child.clone());
                            stack.push((child.clone(), 0));
                        }
                    }
                } else {
                    color.insert(node.clone(), Color::Black);
                    path.pop();
                }
            }
        }
        in_cycle
    }

    /// Orders `dirty` so precedents precede dependents (topological), with
    /// ties (independent nodes) broken by `(sheet_index, row, col, key)` per
    /// §4.3/§5. `locate` maps a node key back to its display position; nodes
    /// for which `locate` returns `None` (non-cell nodes) sort last among
    /// ties, ordered by key alone.
    pub fn topological_order(
        &self,
        dirty: &FxHashSet<NodeKey>,
        locate: impl Fn(&NodeKey) -> Option<(u32, u32, u32)>,
    ) -> Vec<NodeKey> {
        // Kahn's algorithm restricted to the dirty subgraph, breaking ties
        // with a priority queue ordered by (depth, position, key). Depth is
        // derived implicitly by repeatedly taking the frontier of in-degree-0
        // nodes, so ties among simultaneously-ready nodes fall back to the
        // positional order.
        let mut indeg: FxHashMap<&NodeKey, usize> = FxHashMap::default();
        for key in dirty {
            let deg = self
                .precedents_of(key)
                .filter(|p| dirty.contains(*p))
                .count();
            indeg.insert(key, deg);
        }

        let mut order = Vec::with_capacity(dirty.len());
        let mut remaining: FxHashSet<&NodeKey> = dirty.iter().collect();

        while !remaining.is_empty() {
            let mut ready: Vec<&NodeKey> = remaining
                .iter()
                .copied()
                .filter(|k| indeg.get(*k).copied().unwrap_or(0) == 0)
                .collect();
            if ready.is_empty() {
                // Residual cycle: break determinism ties by key alone and
                // drain the rest so recalc still terminates (cycle cells
                // carry `Error(Cycle)` rather than blocking recalc).
                ready = remaining.iter().copied().collect();
            }
            ready.sort_by_key(|k| match locate(k) {
                Some((s, r, c)) => (s, r, c, (*k).clone()),
                None => (u32::MAX, u32::MAX, u32::MAX, (*k).clone()),
            });
            for key in ready {
                order.push(key.clone());
                remaining.remove(key);
                for dep in self.dependents_of(key) {
                    if let Some(d) = indeg.get_mut(dep) {
                        *d = d.saturating_sub(1);
                    }
                }
            }
        }
        order
    }
}

/// Convenience for turning a resolved cell address into the graph's node-key
/// string, matching `CellAddress::node_key`.
pub fn cell_key(addr: &CellAddress) -> NodeKey {
    addr.node_key()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(s: &str) -> NodeKey {
        s.to_string()
    }

    #[test]
    fn transitive_dependents_follows_reverse_edges() {
        let mut g = DependencyGraph::new();
        g.set_dependencies(&k("c1"), [k("a1")]);
        g.set_dependencies(&k("b1"), [k("c1")]);
        let deps = g.transitive_dependents([k("a1")]);
        assert!(deps.contains(&k("a1")));
        assert!(deps.contains(&k("c1")));
        assert!(deps.contains(&k("b1")));
    }

    #[test]
    fn detects_a_two_node_cycle() {
        let mut g = DependencyGraph::new();
        g.set_dependencies(&k("a1"), [k("b1")]);
        g.set_dependencies(&k("b1"), [k("a1")]);
        let cycle = g.detect_cycles();
        assert!(cycle.contains(&k("a1")));
        assert!(cycle.contains(&k("b1")));
    }

    #[test]
    fn topological_order_respects_precedence() {
        let mut g = DependencyGraph::new();
        g.set_dependencies(&k("c1"), [k("a1"), k("b1")]);
        let dirty: FxHashSet<NodeKey> = [k("a1"), k("b1"), k("c1")].into_iter().collect();
        let order = g.topological_order(&dirty, |_| None);
        let pos = |k: &str| order.iter().position(|x| x == k).unwrap();
        assert!(pos("a1") < pos("c1"));
        assert!(pos("b1") < pos("c1"));
    }
}
