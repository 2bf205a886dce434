//! Evaluator-facing abstractions: ranges, function calls, and the resolver
//! seam the Store/Engine implements so this crate never depends on it directly.

use std::any::Any;
use std::borrow::Cow;
use std::fmt::Debug;
use std::sync::Arc;

use formualizer_common::{ArgKind, CalcError, CellAddress, ErrorKind, Range as RangeAddr, Value};
use formualizer_parse::parser::{ASTNode, ASTNodeType, ReferenceType, TableReference};

use crate::interpreter::Interpreter;

/// A 2-D region of values, resolved lazily: `get` is called per cell rather
/// than forcing the whole region into memory up front.
pub trait Range: Debug + Send + Sync {
    fn get(&self, row: u32, col: u32) -> Value;
    /// Bounded extent of this range as actually iterable; open-ended ranges
    /// are resolved to a concrete extent by the frontier algorithm before a
    /// `Range` object is ever constructed (see `engine::graph`).
    fn dimensions(&self) -> (u32, u32);

    fn is_sparse(&self) -> bool {
        false
    }

    fn materialize(&self) -> Vec<Vec<Value>> {
        let (rows, cols) = self.dimensions();
        (0..rows)
            .map(|r| (0..cols).map(|c| self.get(r, c)).collect())
            .collect()
    }

    fn iter_cells<'a>(&'a self) -> Box<dyn Iterator<Item = Value> + 'a> {
        let (rows, cols) = self.dimensions();
        Box::new((0..rows).flat_map(move |r| (0..cols).map(move |c| self.get(r, c))))
    }

    fn iter_rows<'a>(&'a self) -> Box<dyn Iterator<Item = Vec<Value>> + 'a> {
        let (rows, cols) = self.dimensions();
        Box::new((0..rows).map(move |r| (0..cols).map(|c| self.get(r, c)).collect()))
    }

    fn as_any(&self) -> &dyn Any;
}

impl Range for Box<dyn Range> {
    fn get(&self, row: u32, col: u32) -> Value {
        (**self).get(row, col)
    }
    fn dimensions(&self) -> (u32, u32) {
        (**self).dimensions()
    }
    fn is_sparse(&self) -> bool {
        (**self).is_sparse()
    }
    fn materialize(&self) -> Vec<Vec<Value>> {
        (**self).materialize()
    }
    fn iter_cells<'a>(&'a self) -> Box<dyn Iterator<Item = Value> + 'a> {
        (**self).iter_cells()
    }
    fn iter_rows<'a>(&'a self) -> Box<dyn Iterator<Item = Vec<Value>> + 'a> {
        (**self).iter_rows()
    }
    fn as_any(&self) -> &dyn Any {
        (**self).as_any()
    }
}

/// A simple `Vec`-backed range: array literals, `INDIRECT`, and named
/// expressions bound to a literal 2-D value all materialize to this.
#[derive(Debug, Clone)]
pub struct InMemoryRange {
    data: Vec<Vec<Value>>,
}

impl InMemoryRange {
    pub fn new(data: Vec<Vec<Value>>) -> Self {
        Self { data }
    }
}

impl Range for InMemoryRange {
    fn get(&self, row: u32, col: u32) -> Value {
        self.data
            .get(row as usize)
            .and_then(|r| r.get(col as usize))
            .cloned()
            .unwrap_or(Value::Empty)
    }

    fn dimensions(&self) -> (u32, u32) {
        (
            self.data.len() as u32,
            self.data.first().map_or(0, |r| r.len()) as u32,
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A resolved reference that may or may not carry row/column shape with it.
pub enum Resolved {
    Scalar(Value),
    Range(Box<dyn Range>),
}

/// A structured table: headers plus data rows, addressable by column name.
pub trait Table: Debug + Send + Sync {
    fn get_cell(&self, row: u32, column: &str) -> Value;
    fn get_column(&self, column: &str) -> Result<Box<dyn Range>, CalcError>;
    fn all_columns(&self) -> Box<dyn Range>;
    fn data_rows(&self) -> u32;
}

/* ───────────────────────── argument handling ───────────────────────── */

pub type CowValue<'a> = Cow<'a, Value>;

pub enum EvaluatedArg<'a> {
    Value(CowValue<'a>),
    Range(Box<dyn Range>),
}

pub struct ArgumentHandle<'a, 'b> {
    node: &'a ASTNode,
    interp: &'a Interpreter<'b>,
}

impl<'a, 'b> ArgumentHandle<'a, 'b> {
    pub fn new(node: &'a ASTNode, interp: &'a Interpreter<'b>) -> Self {
        Self { node, interp }
    }

    pub fn ast(&self) -> &'a ASTNode {
        self.node
    }

    /// Evaluate the argument as a scalar, collapsing a 1x1 range to its
    /// single cell and any wider shape to `#VALUE!`.
    pub fn value(&self) -> CowValue<'_> {
        if let ASTNodeType::Literal(v) = &self.node.node_type {
            return Cow::Borrowed(v);
        }
        Cow::Owned(self.interp.evaluate_scalar(self.node))
    }

    pub fn range(&self) -> Result<Box<dyn Range>, CalcError> {
        match &self.node.node_type {
            ASTNodeType::Reference { reference, .. } => self.interp.context.resolve_reference(
                reference,
                self.interp.context.current_cell(),
            ),
            ASTNodeType::Array(rows) => {
                let mut data = Vec::with_capacity(rows.len());
                for row in rows {
                    data.push(row.iter().map(|c| self.interp.evaluate_scalar(c)).collect());
                }
                Ok(Box::new(InMemoryRange::new(data)))
            }
            _ => Err(CalcError::new(ErrorKind::Ref)
                .with_message("argument is not a range reference")),
        }
    }

    pub fn value_or_range(&self) -> EvaluatedArg<'_> {
        match self.range() {
            Ok(r) => EvaluatedArg::Range(r),
            Err(_) => EvaluatedArg::Value(self.value()),
        }
    }

    pub fn matches_kind(&self, kind: ArgKind) -> bool {
        match kind {
            ArgKind::Any => true,
            ArgKind::Range => self.range().is_ok(),
            ArgKind::Number => matches!(self.value().as_ref(), Value::Number(_) | Value::Infinity(_)),
            ArgKind::Text => matches!(self.value().as_ref(), Value::String(_)),
            ArgKind::Logical => matches!(self.value().as_ref(), Value::Boolean(_)),
        }
    }
}

/* ───────────────────────── resolver seam ───────────────────────── */

/// Implemented by the Store/Engine so the evaluator never needs to know how
/// cell content is actually kept.
pub trait Resolver: Send + Sync {
    fn resolve_cell(&self, addr: &CellAddress) -> Value;
    fn resolve_range(&self, range: &RangeAddr) -> Result<Box<dyn Range>, CalcError>;
    fn resolve_named_expression(
        &self,
        workbook: Option<&str>,
        sheet: Option<&str>,
        name: &str,
    ) -> Result<Resolved, CalcError>;
    fn resolve_table(&self, table_ref: &TableReference) -> Result<Box<dyn Table>, CalcError>;

    /// Resolves an arbitrary parsed reference into a `Resolved` value,
    /// recording every cell/range key it touches as a dependency of
    /// `current_cell` (including frontier dependencies for open ranges).
    fn resolve_any(
        &self,
        reference: &ReferenceType,
        current_cell: &CellAddress,
    ) -> Result<Resolved, CalcError>;

    /// Convenience used by argument handles that only ever need a `Range`
    /// shape (a scalar cell becomes a 1x1 range).
    fn resolve_reference(
        &self,
        reference: &ReferenceType,
        current_cell: &CellAddress,
    ) -> Result<Box<dyn Range>, CalcError> {
        match self.resolve_any(reference, current_cell)? {
            Resolved::Range(r) => Ok(r),
            Resolved::Scalar(v) => Ok(Box::new(InMemoryRange::new(vec![vec![v]]))),
        }
    }
}

/// Case-insensitive function name to implementation lookup.
pub trait FunctionProvider: Send + Sync {
    fn get_function(&self, name: &str) -> Option<Arc<dyn Function>>;
}

/// Everything a running evaluation needs: where it is, what it can resolve,
/// and which functions exist. Dependency tracking is interior-mutable
/// because the trait is always held as `&dyn EvaluationContext`.
pub trait EvaluationContext: Resolver + FunctionProvider {
    fn current_cell(&self) -> &CellAddress;

    /// Records that evaluating `current_cell` touched `key` (a dependency
    /// graph node key, per `formualizer_common`'s `node_key` conventions).
    fn record_dependency(&self, key: String);

    /// Records a frontier dependency (§4.5): a cell outside an open range
    /// whose future spill could still reach into it.
    fn record_frontier_dependency(&self, key: String);
}

/// Excel-style callable. Object-safe: no associated consts, no generics.
pub trait Function: Send + Sync {
    fn name(&self) -> &'static str;

    fn min_args(&self) -> usize {
        0
    }

    fn max_args(&self) -> Option<usize> {
        None
    }

    fn volatile(&self) -> bool {
        false
    }

    fn eval<'a, 'b>(
        &self,
        args: &'a [ArgumentHandle<'a, 'b>],
        ctx: &dyn EvaluationContext,
    ) -> Value;

    /// Array-producing functions (`SEQUENCE`, `SORT`, `UNIQUE`, `TRANSPOSE`,
    /// `FILTER`, whole-row/column `INDEX`) override this instead of `eval`;
    /// the interpreter checks it first and only falls back to `eval` for a
    /// scalar result.
    fn eval_array<'a, 'b>(
        &self,
        _args: &'a [ArgumentHandle<'a, 'b>],
        _ctx: &dyn EvaluationContext,
    ) -> Option<Box<dyn Range>> {
        None
    }
}
