//! The graph/spill/recalc/event machinery behind incremental evaluation.
//! The top-level `Engine` facade that wires this together with a concrete
//! cell store lives in `formualizer-workbook` (§9: "the engine is a single
//! owned object, `formualizer_workbook::Engine`"); this module only owns the
//! store-agnostic mechanics.

pub mod events;
pub mod graph;
pub mod recalc;
pub mod spill_manager;

pub use events::{EventBus, Unsubscribe};
pub use graph::{cell_key, DependencyGraph, DirtyOrder, NodeKey};
pub use recalc::{recalculate, CellChanged, RecalcHost, RecalcOutcome};
pub use spill_manager::{SpillDiff, SpillManager, SpillOccupant};
