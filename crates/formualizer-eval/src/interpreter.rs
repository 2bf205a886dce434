//! Walks a parsed AST against an [`EvaluationContext`], producing either a
//! scalar [`Value`] or a lazily-readable spilled array.

use formualizer_common::{CalcError, CellAddress, ErrorKind, Sign, Value};
use formualizer_parse::parser::{ASTNode, ASTNodeType, ReferenceType};

use crate::traits::{ArgumentHandle, EvaluationContext, Range, Resolved};

/// What evaluating one AST node produced. A `Spilled` result carries its
/// origin cell (needed for implicit-intersection and spill-collision rules)
/// and a lazily-readable `Range` — no cell beyond the one actually consulted
/// is ever materialized here.
pub enum EvalResult {
    Scalar(Value),
    Spilled {
        origin: CellAddress,
        range: Box<dyn Range>,
    },
}

impl EvalResult {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            EvalResult::Scalar(_) => (1, 1),
            EvalResult::Spilled { range, .. } => range.dimensions(),
        }
    }

    /// Collapses a result to a single value: a scalar returns itself; a
    /// spilled 1x1 area returns its sole cell; anything wider uses implicit
    /// intersection against `current` when `current` falls inside the spill
    /// area, else `#VALUE!`.
    pub fn into_scalar(self, current: &CellAddress) -> Value {
        match self {
            EvalResult::Scalar(v) => v,
            EvalResult::Spilled { origin, range } => {
                let (rows, cols) = range.dimensions();
                if rows == 1 && cols == 1 {
                    return range.get(0, 0);
                }
                if origin.sheet == current.sheet && origin.workbook == current.workbook {
                    let in_row = current.row >= origin.row && current.row < origin.row + rows;
                    let in_col = current.col >= origin.col && current.col < origin.col + cols;
                    if in_row && cols == 1 {
                        return range.get(current.row - origin.row, 0);
                    }
                    if in_col && rows == 1 {
                        return range.get(0, current.col - origin.col);
                    }
                }
                Value::Error(ErrorKind::Value)
            }
        }
    }
}

pub struct Interpreter<'ctx> {
    pub context: &'ctx dyn EvaluationContext,
}

impl<'ctx> Interpreter<'ctx> {
    pub fn new(context: &'ctx dyn EvaluationContext) -> Self {
        Self { context }
    }

    pub fn evaluate_scalar(&self, node: &ASTNode) -> Value {
        self.evaluate_ast(node).into_scalar(self.context.current_cell())
    }

    pub fn evaluate_ast(&self, node: &ASTNode) -> EvalResult {
        match &node.node_type {
            ASTNodeType::Literal(v) => EvalResult::Scalar(v.clone()),
            ASTNodeType::Reference { reference, .. } => self.eval_reference(reference),
            ASTNodeType::UnaryOp { op, expr } => self.eval_unary(op, expr),
            ASTNodeType::BinaryOp { op, left, right } => self.eval_binary(op, left, right),
            ASTNodeType::Function { name, args } => self.eval_function(name, args),
            ASTNodeType::Array(rows) => self.eval_array_literal(rows),
        }
    }

    fn eval_reference(&self, reference: &ReferenceType) -> EvalResult {
        match self.context.resolve_any(reference, self.context.current_cell()) {
            Ok(Resolved::Scalar(v)) => EvalResult::Scalar(v),
            Ok(Resolved::Range(range)) => {
                let (rows, cols) = range.dimensions();
                if rows == 1 && cols == 1 {
                    EvalResult::Scalar(range.get(0, 0))
                } else {
                    EvalResult::Spilled {
                        origin: self.context.current_cell().clone(),
                        range,
                    }
                }
            }
            Err(e) => EvalResult::Scalar(Value::Error(e.kind)),
        }
    }

    /* ===================  unary ops  =================== */

    fn eval_unary(&self, op: &str, expr: &ASTNode) -> EvalResult {
        match self.evaluate_ast(expr) {
            EvalResult::Scalar(v) => EvalResult::Scalar(Self::unary_scalar(op, v)),
            EvalResult::Spilled { origin, range } => EvalResult::Spilled {
                origin,
                range: Box::new(UnaryMapRange {
                    inner: range,
                    op: op.to_string(),
                }),
            },
        }
    }

    fn unary_scalar(op: &str, v: Value) -> Value {
        match op {
            "+" => v,
            "-" => negate(v),
            "%" => match coerce_f64(&v) {
                Ok(n) => Value::number(n / 100.0),
                Err(e) => Value::Error(e.kind),
            },
            _ => Value::Error(ErrorKind::Error),
        }
    }

    /* ===================  binary ops  =================== */

    fn eval_binary(&self, op: &str, left: &ASTNode, right: &ASTNode) -> EvalResult {
        let l = self.evaluate_ast(left);
        let r = self.evaluate_ast(right);
        match (l, r) {
            (EvalResult::Scalar(l), EvalResult::Scalar(r)) => {
                EvalResult::Scalar(apply_binary(op, l, r))
            }
            (EvalResult::Spilled { origin, range }, EvalResult::Scalar(r)) => {
                EvalResult::Spilled {
                    origin,
                    range: Box::new(BroadcastRange {
                        left: range,
                        right: Box::new(crate::traits::InMemoryRange::new(vec![vec![r]])),
                        op: op.to_string(),
                    }),
                }
            }
            (EvalResult::Scalar(l), EvalResult::Spilled { origin, range }) => {
                EvalResult::Spilled {
                    origin,
                    range: Box::new(BroadcastRange {
                        left: Box::new(crate::traits::InMemoryRange::new(vec![vec![l]])),
                        right: range,
                        op: op.to_string(),
                    }),
                }
            }
            (
                EvalResult::Spilled { origin, range: lr },
                EvalResult::Spilled { range: rr, .. },
            ) => EvalResult::Spilled {
                origin,
                range: Box::new(BroadcastRange {
                    left: lr,
                    right: rr,
                    op: op.to_string(),
                }),
            },
        }
    }

    /* ===================  function calls  =================== */

    fn eval_function(&self, name: &str, args: &[ASTNode]) -> EvalResult {
        match self.context.get_function(name) {
            Some(func) => {
                let handles: Vec<ArgumentHandle> =
                    args.iter().map(|n| ArgumentHandle::new(n, self)).collect();
                match func.eval_array(&handles, self.context) {
                    Some(range) => EvalResult::Spilled {
                        origin: self.context.current_cell().clone(),
                        range,
                    },
                    None => EvalResult::Scalar(func.eval(&handles, self.context)),
                }
            }
            None => EvalResult::Scalar(Value::Error(ErrorKind::Name)),
        }
    }

    /* ===================  array literal  =================== */

    fn eval_array_literal(&self, rows: &[Vec<ASTNode>]) -> EvalResult {
        let mut data = Vec::with_capacity(rows.len());
        for row in rows {
            data.push(row.iter().map(|c| self.evaluate_scalar(c)).collect());
        }
        EvalResult::Spilled {
            origin: self.context.current_cell().clone(),
            range: Box::new(crate::traits::InMemoryRange::new(data)),
        }
    }
}

/* ===================  scalar operator semantics  =================== */

/// Coerces to a plain `f64`, mapping `Infinity` to `f64::INFINITY`/`NEG_INFINITY`
/// so the IEEE-754 arithmetic below reproduces the spec's infinity rules for
/// free: `inf - inf`, `inf/inf`, and `inf*0` all already evaluate to `NaN`,
/// which `Value::number` folds into `Error(Num)`.
fn coerce_f64(v: &Value) -> Result<f64, CalcError> {
    match v {
        Value::Number(n) => Ok(*n),
        Value::Infinity(Sign::Positive) => Ok(f64::INFINITY),
        Value::Infinity(Sign::Negative) => Ok(f64::NEG_INFINITY),
        Value::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Empty => Ok(0.0),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| CalcError::new(ErrorKind::Value)),
        Value::Error(k) => Err(CalcError::new(*k)),
    }
}

fn negate(v: Value) -> Value {
    match v {
        Value::Number(n) => Value::number(-n),
        Value::Infinity(s) => Value::Infinity(s.flip()),
        other => match coerce_f64(&other) {
            Ok(n) => Value::number(-n),
            Err(e) => Value::Error(e.kind),
        },
    }
}

pub fn apply_binary(op: &str, l: Value, r: Value) -> Value {
    if let Value::Error(k) = l {
        return Value::Error(k);
    }
    if let Value::Error(k) = r {
        return Value::Error(k);
    }
    match op {
        "=" | "<>" | ">" | "<" | ">=" | "<=" => compare(op, &l, &r),
        "&" => Value::String(format!("{}{}", to_text(&l), to_text(&r))),
        "+" => add(l, r),
        "-" => numeric(l, r, |a, b| a - b),
        "*" => numeric(l, r, |a, b| a * b),
        "/" => numeric(l, r, |a, b| a / b),
        "^" => power(l, r),
        _ => Value::Error(ErrorKind::Error),
    }
}

/// `+` needs one case IEEE-754 gets wrong for this spec: opposite-sign
/// infinities coerce to `inf + -inf = NaN` (an `Error(Num)` once folded by
/// `Value::number`), but §9 fixes `+∞ + −∞` as `Value::Infinity(Positive)`.
fn add(l: Value, r: Value) -> Value {
    if let (Value::Infinity(a), Value::Infinity(b)) = (&l, &r) {
        if *a != *b {
            return Value::Infinity(Sign::Positive);
        }
    }
    numeric(l, r, |a, b| a + b)
}

fn numeric<F: Fn(f64, f64) -> f64>(l: Value, r: Value, f: F) -> Value {
    match (coerce_f64(&l), coerce_f64(&r)) {
        (Ok(a), Ok(b)) => Value::number(f(a, b)),
        (Err(e), _) => Value::Error(e.kind),
        (_, Err(e)) => Value::Error(e.kind),
    }
}

fn power(l: Value, r: Value) -> Value {
    match (coerce_f64(&l), coerce_f64(&r)) {
        (Ok(a), Ok(b)) => {
            if a < 0.0 && b.fract() != 0.0 {
                Value::Error(ErrorKind::Num)
            } else {
                Value::number(a.powf(b))
            }
        }
        (Err(e), _) => Value::Error(e.kind),
        (_, Err(e)) => Value::Error(e.kind),
    }
}

/// Excel-style textual rendering for `&` concatenation (§4.4): booleans
/// render as `TRUE`/`FALSE` here, unlike `Value::to_serialized_string`'s
/// lowercase wire form (§6.2), and errors here can't occur (the caller
/// already short-circuited on `Error`).
pub fn to_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Boolean(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        other => other.to_serialized_string(),
    }
}

/// Strict-type comparison with the spec's cross-type ordering
/// (`Number < String < Boolean`); `Empty` behaves as `0` here.
pub fn compare(op: &str, l: &Value, r: &Value) -> Value {
    let ord = compare_values(l, r);
    let result = match op {
        "=" => ord == std::cmp::Ordering::Equal,
        "<>" => ord != std::cmp::Ordering::Equal,
        ">" => ord == std::cmp::Ordering::Greater,
        "<" => ord == std::cmp::Ordering::Less,
        ">=" => ord != std::cmp::Ordering::Less,
        "<=" => ord != std::cmp::Ordering::Greater,
        _ => false,
    };
    Value::Boolean(result)
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Number(_) | Value::Infinity(_) | Value::Empty => 0,
        Value::String(_) => 1,
        Value::Boolean(_) => 2,
        Value::Error(_) => 3,
    }
}

/// Exposes the cross-type ordering used by comparison operators to
/// `SORT`/`SORTBY` callers that need a full `Ordering`, not a boolean.
pub fn compare_for_sort(l: &Value, r: &Value) -> std::cmp::Ordering {
    compare_values(l, r)
}

fn compare_values(l: &Value, r: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    let (lr, rr) = (type_rank(l), type_rank(r));
    if lr != rr {
        return lr.cmp(&rr);
    }
    match (l, r) {
        (Value::String(a), Value::String(b)) => {
            a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase())
        }
        (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
        _ => {
            let a = coerce_f64(l).unwrap_or(0.0);
            let b = coerce_f64(r).unwrap_or(0.0);
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
    }
}

/* ===================  broadcasting ranges  =================== */

/// Element-wise application of a scalar binary operator over two ranges,
/// materializing neither eagerly (§4.4 "Binary operator over Spilled
/// operands"). Missing cells on the shorter side contribute `Empty`.
#[derive(Debug)]
struct BroadcastRange {
    left: Box<dyn Range>,
    right: Box<dyn Range>,
    op: String,
}

impl Range for BroadcastRange {
    fn get(&self, row: u32, col: u32) -> Value {
        let (lr, lc) = self.left.dimensions();
        let (rr, rc) = self.right.dimensions();
        let l = if row < lr && col < lc {
            self.left.get(row, col)
        } else {
            Value::Empty
        };
        let r = if row < rr && col < rc {
            self.right.get(row, col)
        } else {
            Value::Empty
        };
        apply_binary(&self.op, l, r)
    }

    fn dimensions(&self) -> (u32, u32) {
        let (lr, lc) = self.left.dimensions();
        let (rr, rc) = self.right.dimensions();
        (lr.max(rr), lc.max(rc))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[derive(Debug)]
struct UnaryMapRange {
    inner: Box<dyn Range>,
    op: String,
}

impl Range for UnaryMapRange {
    fn get(&self, row: u32, col: u32) -> Value {
        Interpreter::unary_scalar(&self.op, self.inner.get(row, col))
    }

    fn dimensions(&self) -> (u32, u32) {
        self.inner.dimensions()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use formualizer_common::Sign;

    #[test]
    fn nonzero_over_zero_is_signed_infinity() {
        assert_eq!(
            apply_binary("/", Value::Number(5.0), Value::Number(0.0)),
            Value::Infinity(Sign::Positive)
        );
        assert_eq!(
            apply_binary("/", Value::Number(-5.0), Value::Number(0.0)),
            Value::Infinity(Sign::Negative)
        );
    }

    #[test]
    fn zero_over_zero_is_num_error() {
        assert_eq!(
            apply_binary("/", Value::Number(0.0), Value::Number(0.0)),
            Value::Error(ErrorKind::Num)
        );
    }

    #[test]
    fn infinity_over_infinity_is_num_error() {
        let inf = Value::Infinity(Sign::Positive);
        assert_eq!(apply_binary("/", inf.clone(), inf), Value::Error(ErrorKind::Num));
    }

    #[test]
    fn finite_over_infinity_is_zero() {
        assert_eq!(
            apply_binary("/", Value::Number(3.0), Value::Infinity(Sign::Positive)),
            Value::Number(0.0)
        );
    }

    #[test]
    fn infinity_times_zero_is_num_error() {
        assert_eq!(
            apply_binary("*", Value::Infinity(Sign::Positive), Value::Number(0.0)),
            Value::Error(ErrorKind::Num)
        );
    }

    #[test]
    fn same_sign_infinity_subtraction_is_num_error() {
        let pos = Value::Infinity(Sign::Positive);
        assert_eq!(apply_binary("-", pos.clone(), pos), Value::Error(ErrorKind::Num));
    }

    #[test]
    fn opposite_sign_infinity_subtraction_stays_infinite() {
        assert_eq!(
            apply_binary("-", Value::Infinity(Sign::Positive), Value::Infinity(Sign::Negative)),
            Value::Infinity(Sign::Positive)
        );
    }

    #[test]
    fn concatenation_stringifies_booleans_and_empty() {
        assert_eq!(
            apply_binary("&", Value::Boolean(true), Value::Empty),
            Value::String("TRUE".to_string())
        );
    }

    #[test]
    fn cross_type_ordering_places_numbers_below_strings_below_booleans() {
        assert_eq!(
            compare("<", &Value::Number(999.0), &Value::String("a".into())),
            Value::Boolean(true)
        );
        assert_eq!(
            compare("<", &Value::String("z".into()), &Value::Boolean(false)),
            Value::Boolean(true)
        );
    }

    #[test]
    fn error_short_circuits_left_before_right() {
        assert_eq!(
            apply_binary("+", Value::Error(ErrorKind::Ref), Value::Error(ErrorKind::Value)),
            Value::Error(ErrorKind::Ref)
        );
    }
}
