//! Multi-workbook, multi-sheet formula engine facade.
//!
//! [`Engine`] is the single entry point: it owns the cell [`store`], the
//! dependency graph and spill manager from `formualizer-eval`, and a small
//! synchronous event bus. Everything else in this crate exists to let
//! `Engine` turn a raw formula string into an evaluated, cached display
//! value without `formualizer-eval` ever needing to know how cells are
//! stored.

pub mod context;
pub mod engine;
pub mod error;
pub mod store;

pub use engine::{Engine, EngineEvent};
pub use error::{EngineError, EngineResult};
pub use store::{NamedExpression, NamedScope, RawContent, TableDefinition};

pub use formualizer_common::{CalcError, CellAddress, ErrorKind, Range, RangeEnd, Value};
pub use formualizer_eval::engine::{CellChanged, RecalcOutcome, Unsubscribe};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NamedScope;

    fn engine_with_sheet() -> Engine {
        let mut engine = Engine::new();
        engine.add_workbook("Book1").unwrap();
        engine.add_sheet("Book1", "Sheet1").unwrap();
        engine
    }

    #[test]
    fn dependent_cell_updates_when_its_precedent_changes() {
        let mut engine = engine_with_sheet();
        engine.set_cell_content("Book1", "Sheet1", 0, 0, RawContent::Number(1.0)).unwrap();
        engine.set_cell_content("Book1", "Sheet1", 1, 0, RawContent::from("=A1+1")).unwrap();
        assert_eq!(
            engine.get_cell_value("Book1", "Sheet1", 1, 0).unwrap(),
            Value::Number(2.0)
        );

        engine.set_cell_content("Book1", "Sheet1", 0, 0, RawContent::Number(10.0)).unwrap();
        assert_eq!(
            engine.get_cell_value("Book1", "Sheet1", 1, 0).unwrap(),
            Value::Number(11.0)
        );
    }

    #[test]
    fn a_two_cell_cycle_resolves_to_cycle_error() {
        let mut engine = engine_with_sheet();
        engine.set_cell_content("Book1", "Sheet1", 0, 0, RawContent::from("=B1")).unwrap();
        engine.set_cell_content("Book1", "Sheet1", 1, 0, RawContent::from("=A1")).unwrap();

        assert_eq!(
            engine.get_cell_value("Book1", "Sheet1", 0, 0).unwrap(),
            Value::Error(ErrorKind::Cycle)
        );
        assert_eq!(
            engine.get_cell_value("Book1", "Sheet1", 1, 0).unwrap(),
            Value::Error(ErrorKind::Cycle)
        );
    }

    #[test]
    fn cycle_closed_by_the_second_cell_is_caught_the_same_pass() {
        let mut engine = engine_with_sheet();
        engine.set_cell_content("Book1", "Sheet1", 0, 0, RawContent::from("=B1+1")).unwrap();
        engine.set_cell_content("Book1", "Sheet1", 1, 0, RawContent::from("=A1+1")).unwrap();

        assert_eq!(
            engine.get_cell_value("Book1", "Sheet1", 0, 0).unwrap(),
            Value::Error(ErrorKind::Cycle)
        );
        assert_eq!(
            engine.get_cell_value("Book1", "Sheet1", 1, 0).unwrap(),
            Value::Error(ErrorKind::Cycle)
        );

        engine.set_cell_content("Book1", "Sheet1", 0, 0, RawContent::Number(5.0)).unwrap();
        assert_eq!(
            engine.get_cell_value("Book1", "Sheet1", 0, 0).unwrap(),
            Value::Number(5.0)
        );
        assert_eq!(
            engine.get_cell_value("Book1", "Sheet1", 1, 0).unwrap(),
            Value::Number(6.0)
        );
    }

    #[test]
    fn opposite_sign_infinities_add_to_positive_infinity() {
        let mut engine = engine_with_sheet();
        engine.set_cell_content("Book1", "Sheet1", 0, 0, RawContent::from("=1/0")).unwrap();
        engine.set_cell_content("Book1", "Sheet1", 0, 1, RawContent::from("=-1/0")).unwrap();
        engine.set_cell_content("Book1", "Sheet1", 0, 2, RawContent::from("=A1+A2")).unwrap();
        engine.set_cell_content("Book1", "Sheet1", 0, 3, RawContent::from("=0/0")).unwrap();

        assert_eq!(engine.get_cell_serialized("Book1", "Sheet1", 0, 0).unwrap(), "=1/0");
        assert_eq!(
            engine.get_cell_value("Book1", "Sheet1", 0, 0).unwrap(),
            Value::Infinity(formualizer_common::Sign::Positive)
        );
        assert_eq!(
            engine.get_cell_value("Book1", "Sheet1", 0, 1).unwrap(),
            Value::Infinity(formualizer_common::Sign::Negative)
        );
        assert_eq!(
            engine.get_cell_value("Book1", "Sheet1", 0, 2).unwrap(),
            Value::Infinity(formualizer_common::Sign::Positive)
        );
        assert_eq!(
            engine.get_cell_value("Book1", "Sheet1", 0, 3).unwrap(),
            Value::Error(ErrorKind::Num)
        );
    }

    #[test]
    fn open_range_sum_sees_new_cells_below_the_formula() {
        let mut engine = engine_with_sheet();
        engine.set_cell_content("Book1", "Sheet1", 0, 0, RawContent::Number(1.0)).unwrap();
        engine.set_cell_content("Book1", "Sheet1", 0, 1, RawContent::Number(2.0)).unwrap();
        engine.set_cell_content("Book1", "Sheet1", 1, 0, RawContent::from("=SUM(A:A)")).unwrap();
        assert_eq!(
            engine.get_cell_value("Book1", "Sheet1", 1, 0).unwrap(),
            Value::Number(3.0)
        );

        engine.set_cell_content("Book1", "Sheet1", 0, 5, RawContent::Number(4.0)).unwrap();
        assert_eq!(
            engine.get_cell_value("Book1", "Sheet1", 1, 0).unwrap(),
            Value::Number(7.0)
        );
    }

    #[test]
    fn a_blocked_spill_collapses_to_spill_error() {
        let mut engine = engine_with_sheet();
        engine.set_cell_content("Book1", "Sheet1", 1, 1, RawContent::Number(99.0)).unwrap();
        engine
            .set_cell_content("Book1", "Sheet1", 0, 0, RawContent::from("={1,2;3,4}"))
            .unwrap();

        assert_eq!(
            engine.get_cell_value("Book1", "Sheet1", 0, 0).unwrap(),
            Value::Error(ErrorKind::Spill)
        );
        assert_eq!(
            engine.get_cell_value("Book1", "Sheet1", 1, 1).unwrap(),
            Value::Number(99.0)
        );
    }

    #[test]
    fn boolean_wire_value_is_lowercase_but_concatenation_is_uppercase() {
        let mut engine = engine_with_sheet();
        engine.set_cell_content("Book1", "Sheet1", 0, 0, RawContent::Boolean(true)).unwrap();
        engine.set_cell_content("Book1", "Sheet1", 0, 1, RawContent::from("=A1&\"!\"")).unwrap();

        assert_eq!(
            engine.get_cell_value("Book1", "Sheet1", 0, 0).unwrap().to_serialized_string(),
            "true"
        );
        assert_eq!(
            engine.get_cell_value("Book1", "Sheet1", 0, 1).unwrap(),
            Value::String("TRUE!".to_string())
        );
    }

    #[test]
    fn cell_content_round_trips_through_serialization() {
        let mut engine = engine_with_sheet();
        engine
            .set_cell_content("Book1", "Sheet1", 0, 0, RawContent::from("=A1+1"))
            .unwrap();
        assert_eq!(engine.get_cell_serialized("Book1", "Sheet1", 0, 0).unwrap(), "=A1+1");
    }

    #[test]
    fn named_expression_updates_recalculate_its_dependents() {
        let mut engine = engine_with_sheet();
        engine
            .add_named_expression("Book1", NamedScope::Global, "Rate", RawContent::Number(0.1))
            .unwrap();
        engine.set_cell_content("Book1", "Sheet1", 0, 0, RawContent::from("=Rate*100")).unwrap();
        assert_eq!(
            engine.get_cell_value("Book1", "Sheet1", 0, 0).unwrap(),
            Value::Number(10.0)
        );

        engine
            .update_named_expression("Book1", NamedScope::Global, "Rate", RawContent::Number(0.2))
            .unwrap();
        assert_eq!(
            engine.get_cell_value("Book1", "Sheet1", 0, 0).unwrap(),
            Value::Number(20.0)
        );
    }

    #[test]
    fn subscribers_observe_cell_changed_events() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let mut engine = engine_with_sheet();
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        let _sub = engine.on(move |event| {
            if matches!(event, EngineEvent::CellChanged { .. }) {
                c1.fetch_add(1, Ordering::SeqCst);
            }
        });

        engine.set_cell_content("Book1", "Sheet1", 0, 0, RawContent::Number(1.0)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
