//! Spill occupancy tracking (§4.6): which cell currently displays which
//! origin's spilled value, collision/collapse rules, and the diff of
//! released/added cells a recalc needs to turn into `cell-changed` events.

use rustc_hash::FxHashMap;

use formualizer_common::CellAddress;

/// One non-origin cell's occupying spill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpillOccupant {
    pub origin: CellAddress,
}

/// The result of applying a freshly-evaluated spill area for `origin`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SpillDiff {
    /// Cells that now display `origin`'s value that didn't before.
    pub added: Vec<CellAddress>,
    /// Cells that displayed `origin`'s value before but no longer do.
    pub released: Vec<CellAddress>,
    /// `true` if `origin` itself collapsed to `#SPILL!` because some cell in
    /// its computed area already held non-empty content.
    pub collapsed: bool,
}

#[derive(Debug, Default)]
pub struct SpillManager {
    /// Non-origin cell -> who currently occupies it.
    occupancy: FxHashMap<CellAddress, SpillOccupant>,
    /// Origin -> the non-origin cells it currently occupies (its area minus
    /// itself), kept so a re-evaluation can diff against the previous area.
    areas: FxHashMap<CellAddress, Vec<CellAddress>>,
}

impl SpillManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn occupant_of(&self, cell: &CellAddress) -> Option<&CellAddress> {
        self.occupancy.get(cell).map(|o| &o.origin)
    }

    /// Every non-origin cell currently displaying someone else's spilled
    /// value. Used by the open-range evaluator (§4.5) to find spill cells
    /// that intersect a range without an unbounded per-cell index.
    pub fn occupied_cells(&self) -> impl Iterator<Item = &CellAddress> {
        self.occupancy.keys()
    }

    /// Applies a new spill area for `origin`. `has_content` reports whether
    /// the store holds non-empty raw content at a candidate cell (the
    /// collapse trigger); `is_other_spill_origin` reports whether a cell is
    /// itself the origin of a *different* spill still pending in this same
    /// recalc pass (earlier origin wins, per §4.6).
    pub fn apply(
        &mut self,
        origin: &CellAddress,
        new_area: Vec<CellAddress>,
        has_content: impl Fn(&CellAddress) -> bool,
    ) -> SpillDiff {
        let old_area = self.areas.remove(origin).unwrap_or_default();

        // Check for blockage: any non-origin cell in the new area already
        // holding content, or already occupied by an earlier spill's origin.
        let blocked = new_area.iter().any(|c| {
            c != origin
                && (has_content(c)
                    || self
                        .occupancy
                        .get(c)
                        .is_some_and(|o| &o.origin != origin))
        });

        if blocked {
            // Collapse: release everything this origin previously held.
            for cell in &old_area {
                if self.occupancy.get(cell).map(|o| &o.origin) == Some(origin) {
                    self.occupancy.remove(cell);
                }
            }
            return SpillDiff {
                released: old_area,
                added: Vec::new(),
                collapsed: true,
            };
        }

        let non_origin_area: Vec<CellAddress> =
            new_area.into_iter().filter(|c| c != origin).collect();

        let old_set: std::collections::HashSet<&CellAddress> = old_area.iter().collect();
        let new_set: std::collections::HashSet<&CellAddress> = non_origin_area.iter().collect();

        let released: Vec<CellAddress> = old_area
            .iter()
            .filter(|c| !new_set.contains(c))
            .cloned()
            .collect();
        let added: Vec<CellAddress> = non_origin_area
            .iter()
            .filter(|c| !old_set.contains(c))
            .cloned()
            .collect();

        for cell in &released {
            self.occupancy.remove(cell);
        }
        for cell in &non_origin_area {
            self.occupancy.insert(
                cell.clone(),
                SpillOccupant {
                    origin: origin.clone(),
                },
            );
        }
        self.areas.insert(origin.clone(), non_origin_area);

        SpillDiff {
            added,
            released,
            collapsed: false,
        }
    }

    /// Releases every cell held by `origin`'s spill (used when the origin
    /// cell itself is cleared or no longer produces a spilled result).
    pub fn release(&mut self, origin: &CellAddress) -> Vec<CellAddress> {
        let old = self.areas.remove(origin).unwrap_or_default();
        for cell in &old {
            self.occupancy.remove(cell);
        }
        old
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(col: u32, row: u32) -> CellAddress {
        CellAddress::new("Book1", "Sheet1", col, row)
    }

    #[test]
    fn shrinking_a_spill_releases_the_trailing_cells() {
        let mut mgr = SpillManager::new();
        let origin = addr(0, 0);
        let first = mgr.apply(&origin, vec![addr(0, 0), addr(0, 1), addr(0, 2)], |_| false);
        assert_eq!(first.added.len(), 2);
        assert!(!first.collapsed);

        let second = mgr.apply(&origin, vec![addr(0, 0), addr(0, 1)], |_| false);
        assert_eq!(second.released, vec![addr(0, 2)]);
        assert!(mgr.occupant_of(&addr(0, 2)).is_none());
        assert_eq!(mgr.occupant_of(&addr(0, 1)), Some(&origin));
    }

    #[test]
    fn blocked_cell_collapses_the_whole_spill() {
        let mut mgr = SpillManager::new();
        let origin = addr(1, 0);
        let diff = mgr.apply(&origin, vec![addr(1, 0), addr(1, 1)], |c| *c == addr(1, 1));
        assert!(diff.collapsed);
        assert!(diff.added.is_empty());
        assert!(mgr.occupant_of(&addr(1, 1)).is_none());
    }
}
