//! Drives §4.7's recalculation steps 3-6 over a dirty set already computed
//! by [`crate::engine::graph::DependencyGraph`]: evaluate in topological
//! order, diff old vs new serialized value, and report exactly the set of
//! cells whose visible value changed.

use rustc_hash::FxHashSet;

use formualizer_common::CellAddress;

use super::graph::{DependencyGraph, NodeKey};

/// One cell whose evaluated value changed as a result of a recalc pass.
#[derive(Debug, Clone, PartialEq)]
pub struct CellChanged {
    pub address: CellAddress,
    pub old_value: String,
    pub new_value: String,
}

/// What a single recalc pass produced. `cycle_cells` is reported separately
/// from `changed` only for observability — a cycle cell that newly took
/// `#CYCLE!` also appears in `changed` like any other value transition.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecalcOutcome {
    pub changed: Vec<CellChanged>,
    pub cycle_cells: Vec<NodeKey>,
}

/// Implemented by the host (the `formualizer-workbook` `Engine` facade) so
/// this crate's recalc driver never needs to know how cells are stored.
pub trait RecalcHost {
    /// Re-evaluates `key`, writes the result back into the store, and
    /// returns `(old_serialized, new_serialized)` for diffing. Called with
    /// the node already known to be in the dirty set and in dependency
    /// order (precedents first).
    fn recompute(&mut self, key: &NodeKey) -> (String, String);

    /// Resolves a node key back to an address for event payloads; `None`
    /// for non-cell nodes (ranges, names, table columns), which never emit
    /// `cell-changed` directly.
    fn address_of(&self, key: &NodeKey) -> Option<CellAddress>;

    /// Sheet display index for deterministic ordering (§4.3/§5); `0` if the
    /// host doesn't track an explicit order.
    fn sheet_index_of(&self, key: &NodeKey) -> u32;
}

/// Runs one full recalculation pass: builds the dirty set from `roots` via
/// the reverse-dependency closure (§4.7 step 2), orders it topologically
/// (§4.3), evaluates each node through `host` (§4.7 step 3), and returns
/// every cell whose serialized value actually changed (§4.7 step 4).
pub fn recalculate(
    graph: &DependencyGraph,
    roots: impl IntoIterator<Item = NodeKey>,
    cycle_nodes: &FxHashSet<NodeKey>,
    host: &mut dyn RecalcHost,
) -> RecalcOutcome {
    let dirty = graph.transitive_dependents(roots);
    #[cfg(feature = "tracing")]
    tracing::debug!(dirty = dirty.len(), "recalculation dirty set computed");
    let locate = |key: &NodeKey| -> Option<(u32, u32, u32)> {
        host.address_of(key)
            .map(|addr| (host.sheet_index_of(key), addr.row, addr.col))
    };
    let order = graph.topological_order(&dirty, locate);

    let mut outcome = RecalcOutcome::default();
    for key in &order {
        let (old, new) = host.recompute(key);
        if cycle_nodes.contains(key) {
            outcome.cycle_cells.push(key.clone());
        }
        if old != new {
            if let Some(address) = host.address_of(key) {
                outcome.changed.push(CellChanged {
                    address,
                    old_value: old,
                    new_value: new,
                });
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeHost {
        values: HashMap<NodeKey, String>,
        addresses: HashMap<NodeKey, CellAddress>,
        compute: Box<dyn Fn(&NodeKey, &HashMap<NodeKey, String>) -> String>,
    }

    impl RecalcHost for FakeHost {
        fn recompute(&mut self, key: &NodeKey) -> (String, String) {
            let old = self.values.get(key).cloned().unwrap_or_default();
            let new = (self.compute)(key, &self.values);
            self.values.insert(key.clone(), new.clone());
            (old, new)
        }

        fn address_of(&self, key: &NodeKey) -> Option<CellAddress> {
            self.addresses.get(key).cloned()
        }

        fn sheet_index_of(&self, _key: &NodeKey) -> u32 {
            0
        }
    }

    #[test]
    fn only_changed_cells_are_reported() {
        let mut graph = DependencyGraph::new();
        graph.set_dependencies(&"c1".to_string(), ["a1".to_string(), "b1".to_string()]);

        let mut values = HashMap::new();
        values.insert("a1".to_string(), "10".to_string());
        values.insert("b1".to_string(), "20".to_string());
        values.insert("c1".to_string(), "30".to_string());

        let mut addresses = HashMap::new();
        addresses.insert("a1".to_string(), CellAddress::new("Book1", "Sheet1", 0, 0));
        addresses.insert("b1".to_string(), CellAddress::new("Book1", "Sheet1", 1, 0));
        addresses.insert("c1".to_string(), CellAddress::new("Book1", "Sheet1", 2, 0));

        let mut host = FakeHost {
            values,
            addresses,
            compute: Box::new(|key, values| match key.as_str() {
                "a1" => "100".to_string(),
                "c1" => {
                    let a: f64 = values.get("a1").unwrap().parse().unwrap();
                    let b: f64 = values.get("b1").unwrap().parse().unwrap();
                    (a + b).to_string()
                }
                other => values.get(other).cloned().unwrap_or_default(),
            }),
        };

        let cycles = FxHashSet::default();
        let outcome = recalculate(&graph, ["a1".to_string()], &cycles, &mut host);

        assert_eq!(outcome.changed.len(), 2);
        let c1_change = outcome
            .changed
            .iter()
            .find(|c| c.address.col == 2)
            .expect("c1 should be reported changed");
        assert_eq!(c1_change.old_value, "30");
        assert_eq!(c1_change.new_value, "120");
    }
}
