//! The built-in function registry (§4.4's normative list) plus the small
//! set of coercion helpers every family shares.

mod array;
mod logical;
mod lookup;
mod math;
mod stats;
mod text;
mod trig;

use std::sync::Arc;

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

use formualizer_common::{ErrorKind, Value};

use crate::traits::{EvaluatedArg, Function};

static REGISTRY: Lazy<FxHashMap<String, Arc<dyn Function>>> = Lazy::new(build_registry);

/// Looks up a built-in by name, case-insensitively.
pub fn get(name: &str) -> Option<Arc<dyn Function>> {
    REGISTRY.get(&name.to_ascii_uppercase()).cloned()
}

fn build_registry() -> FxHashMap<String, Arc<dyn Function>> {
    let mut map: FxHashMap<String, Arc<dyn Function>> = FxHashMap::default();
    let mut add = |f: Arc<dyn Function>| {
        map.insert(f.name().to_string(), f);
    };

    math::register(&mut add);
    trig::register(&mut add);
    stats::register(&mut add);
    logical::register(&mut add);
    text::register(&mut add);
    lookup::register(&mut add);
    array::register(&mut add);

    map
}

/// Coerces a cell value for numeric aggregation (`SUM`, `COUNT`, ...):
/// non-numeric text is silently skipped (Excel's range-aggregation
/// convention), but an `Error` cell always propagates.
pub(crate) fn numeric_or_skip(v: &Value) -> Option<Result<f64, ErrorKind>> {
    match v {
        Value::Number(n) => Some(Ok(*n)),
        Value::Infinity(s) => Some(Ok(match s {
            formualizer_common::Sign::Positive => f64::INFINITY,
            formualizer_common::Sign::Negative => f64::NEG_INFINITY,
        })),
        Value::Boolean(b) => Some(Ok(if *b { 1.0 } else { 0.0 })),
        Value::Empty => Some(Ok(0.0)),
        Value::String(_) => None,
        Value::Error(k) => Some(Err(*k)),
    }
}

/// Coerces a value passed directly as a scalar argument: text that parses as
/// a number is accepted (unlike range aggregation), everything else follows
/// `numeric_or_skip`'s rules.
pub(crate) fn numeric_arg(v: &Value) -> Result<f64, ErrorKind> {
    match v {
        Value::String(s) => s.trim().parse::<f64>().map_err(|_| ErrorKind::Value),
        other => numeric_or_skip(other).unwrap_or(Err(ErrorKind::Value)),
    }
}

/// Flattens an evaluated argument (scalar or range) into its constituent
/// values, in row-major order.
pub(crate) fn flatten(arg: EvaluatedArg<'_>) -> Vec<Value> {
    match arg {
        EvaluatedArg::Value(v) => vec![v.into_owned()],
        EvaluatedArg::Range(r) => r.iter_cells().collect(),
    }
}

pub(crate) fn first_error(values: &[Value]) -> Option<ErrorKind> {
    values.iter().find_map(|v| v.error_kind())
}

/// Text-function argument coercion (§4.4): matches `&` concatenation's
/// rendering, including `TRUE`/`FALSE` for booleans rather than the
/// lowercase wire form `Value::to_serialized_string` uses for `getCellValue`.
pub(crate) fn text_of(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Boolean(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        other => other.to_serialized_string(),
    }
}
