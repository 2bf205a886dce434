//! Dependency-graph-driven formula evaluator: AST interpretation, the
//! built-in function library, and the dependency/spill/recalc machinery that
//! turns a sequence of cell edits into a minimal set of re-evaluations.

pub mod builtins;
pub mod criteria;
pub mod engine;
pub mod interpreter;
pub mod traits;

pub use interpreter::{EvalResult, Interpreter};
pub use traits::{
    ArgumentHandle, EvaluationContext, EvaluatedArg, Function, FunctionProvider, InMemoryRange,
    Range, Resolved, Resolver, Table,
};

pub use engine::{
    cell_key, CellChanged, DependencyGraph, EventBus, NodeKey, RecalcHost, RecalcOutcome,
    SpillDiff, SpillManager, SpillOccupant, Unsubscribe,
};
