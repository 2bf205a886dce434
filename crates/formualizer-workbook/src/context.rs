//! The `Resolver`/`FunctionProvider`/`EvaluationContext` bridge between the
//! Store and `formualizer_eval`'s interpreter (§4.4 "Argument passing").
//! One `EvalCtx` is built per cell evaluation; it never outlives the
//! `Engine::recompute` call that created it.

use std::any::Any;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashSet;

use formualizer_common::{
    CalcError, CellAddress, ErrorKind, Range as RangeAddr, RangeEnd, Value,
};
use formualizer_parse::parser::{ReferenceType, TableReference, TableSpecifier};

use formualizer_eval::traits::{
    EvaluationContext, Function, FunctionProvider, InMemoryRange, Range, Resolved, Resolver, Table,
};
use formualizer_eval::{EvalResult, Interpreter};

use crate::store::{NamedScope, RawContent, Store};

/// A frontier registration collected during evaluation, applied to the
/// dependency graph by the `Engine` after the cell finishes (§4.5 step 2).
/// `Column`/`Row` name the axis line a formula's open range could be
/// affected by; `Engine::recompute` turns these into
/// `DependencyGraph::add_column_frontier`/`add_row_frontier` calls keyed by
/// the evaluating cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FrontierMark {
    Column(String, u32),
    Row(String, u32),
}

/// A cell observed to fall inside a finite range read during evaluation,
/// applied to `DependencyGraph::add_range_membership` after the cell
/// finishes so a later edit to that cell invalidates the range reader.
#[derive(Debug, Clone)]
pub struct MembershipMark {
    pub cell_key: String,
    pub range_key: String,
}

pub struct EvalCtx<'a> {
    pub store: &'a Store,
    pub spills: &'a formualizer_eval::engine::SpillManager,
    pub active: &'a FxHashSet<String>,
    pub current: CellAddress,
    pub deps: Mutex<FxHashSet<String>>,
    pub frontier: Mutex<Vec<FrontierMark>>,
    pub membership: Mutex<Vec<MembershipMark>>,
}

impl<'a> EvalCtx<'a> {
    pub fn new(
        store: &'a Store,
        spills: &'a formualizer_eval::engine::SpillManager,
        active: &'a FxHashSet<String>,
        current: CellAddress,
    ) -> Self {
        Self {
            store,
            spills,
            active,
            current,
            deps: Mutex::new(FxHashSet::default()),
            frontier: Mutex::new(Vec::new()),
            membership: Mutex::new(Vec::new()),
        }
    }

    /// Reads a cell's currently visible value without recording a
    /// dependency; `resolve_cell` wraps this and adds the dependency.
    /// Cells that participate in a reference cycle are handled upstream, by
    /// `Engine::recompute` writing `Error(Cycle)` straight into `display`
    /// before any dependent is evaluated, so a plain read here never needs
    /// to re-detect the cycle itself.
    fn value_at(&self, addr: &CellAddress) -> Value {
        let Some(wb) = self.store.workbook(&addr.workbook) else {
            return Value::Error(ErrorKind::Ref);
        };
        let Some(sheet) = wb.sheet(&addr.sheet) else {
            return Value::Error(ErrorKind::Ref);
        };
        if let Some(v) = sheet.display.get(&(addr.col, addr.row)) {
            return v.clone();
        }
        match sheet.raw_content(addr.col, addr.row) {
            RawContent::Number(n) => Value::Number(n),
            RawContent::Boolean(b) => Value::Boolean(b),
            RawContent::Text(s) if s.starts_with('=') => Value::Empty,
            RawContent::Text(s) => Value::String(s),
            RawContent::Empty => Value::Empty,
        }
    }

    fn resolve_open_range(&self, range: &RangeAddr) -> Box<dyn Range> {
        self.deps.lock().unwrap().insert(range.node_key());

        if range.is_open_column() {
            let end_col = range.end_col.finite().unwrap_or(range.start_col);
            for col in range.start_col..=end_col {
                self.frontier
                    .lock()
                    .unwrap()
                    .push(FrontierMark::Column(range.sheet.clone(), col));
            }
        }
        if range.is_open_row() {
            let end_row = range.end_row.finite().unwrap_or(range.start_row);
            for row in range.start_row..=end_row {
                self.frontier
                    .lock()
                    .unwrap()
                    .push(FrontierMark::Row(range.sheet.clone(), row));
            }
        }

        let mut cells: rustc_hash::FxHashMap<(u32, u32), Value> = rustc_hash::FxHashMap::default();
        let mut rows = 0u32;
        let mut cols = 0u32;

        if let Some(wb) = self.store.workbook(&range.workbook) {
            if let Some(sheet) = wb.sheet(&range.sheet) {
                // §4.5 step 1: every defined cell inside the range.
                for (c, r, content) in sheet.defined_cells() {
                    if content.is_empty() || !range.contains(c, r) {
                        continue;
                    }
                    let addr = CellAddress::new(range.workbook.clone(), range.sheet.clone(), c, r);
                    self.deps.lock().unwrap().insert(addr.node_key());
                    let off = (r - range.start_row, c - range.start_col);
                    rows = rows.max(off.0 + 1);
                    cols = cols.max(off.1 + 1);
                    cells.insert(off, self.value_at(&addr));
                }
            }
        }

        // §4.5 steps 2-3: cells currently covered by someone else's spill
        // that happen to fall inside the range.
        for addr in self.spills.occupied_cells() {
            if addr.workbook == range.workbook && addr.sheet == range.sheet && range.contains(addr.col, addr.row) {
                self.deps.lock().unwrap().insert(addr.node_key());
                let off = (addr.row - range.start_row, addr.col - range.start_col);
                rows = rows.max(off.0 + 1);
                cols = cols.max(off.1 + 1);
                cells.entry(off).or_insert_with(|| self.value_at(addr));
            }
        }

        // §4.5 final clause: self-reference inside the range is a cycle.
        if self.current.workbook == range.workbook
            && self.current.sheet == range.sheet
            && range.contains(self.current.col, self.current.row)
        {
            let off = (
                self.current.row - range.start_row,
                self.current.col - range.start_col,
            );
            rows = rows.max(off.0 + 1);
            cols = cols.max(off.1 + 1);
            cells.insert(off, Value::Error(ErrorKind::Cycle));
        }

        Box::new(SparseRange {
            cells,
            rows: rows.max(1),
            cols: cols.max(1),
        })
    }
}

#[derive(Debug)]
struct SparseRange {
    cells: rustc_hash::FxHashMap<(u32, u32), Value>,
    rows: u32,
    cols: u32,
}

impl Range for SparseRange {
    fn get(&self, row: u32, col: u32) -> Value {
        self.cells.get(&(row, col)).cloned().unwrap_or(Value::Empty)
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.rows, self.cols)
    }

    fn is_sparse(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct OwnedTable {
    headers: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table for OwnedTable {
    fn get_cell(&self, row: u32, column: &str) -> Value {
        let Some(idx) = self.headers.iter().position(|h| h == column) else {
            return Value::Error(ErrorKind::Ref);
        };
        self.rows
            .get(row as usize)
            .and_then(|r| r.get(idx))
            .cloned()
            .unwrap_or(Value::Empty)
    }

    fn get_column(&self, column: &str) -> Result<Box<dyn Range>, CalcError> {
        let idx = self
            .headers
            .iter()
            .position(|h| h == column)
            .ok_or_else(|| CalcError::new(ErrorKind::Ref))?;
        let data: Vec<Vec<Value>> = self
            .rows
            .iter()
            .map(|r| vec![r.get(idx).cloned().unwrap_or(Value::Empty)])
            .collect();
        Ok(Box::new(InMemoryRange::new(data)))
    }

    fn all_columns(&self) -> Box<dyn Range> {
        Box::new(InMemoryRange::new(self.rows.clone()))
    }

    fn data_rows(&self) -> u32 {
        self.rows.len() as u32
    }
}

impl Resolver for EvalCtx<'_> {
    fn resolve_cell(&self, addr: &CellAddress) -> Value {
        self.record_dependency(addr.node_key());
        self.value_at(addr)
    }

    fn resolve_range(&self, range: &RangeAddr) -> Result<Box<dyn Range>, CalcError> {
        let Some(wb) = self.store.workbook(&range.workbook) else {
            return Err(CalcError::new(ErrorKind::Ref));
        };
        if !wb.has_sheet(&range.sheet) {
            return Err(CalcError::new(ErrorKind::Ref));
        }

        if range.is_open() {
            return Ok(self.resolve_open_range(range));
        }

        let end_col = range.end_col.finite().expect("checked non-open above");
        let end_row = range.end_row.finite().expect("checked non-open above");
        self.record_dependency(range.node_key());

        let rows = end_row - range.start_row + 1;
        let cols = end_col - range.start_col + 1;
        let mut data = Vec::with_capacity(rows as usize);
        for r in 0..rows {
            let mut row_vals = Vec::with_capacity(cols as usize);
            for c in 0..cols {
                let addr = CellAddress::new(
                    range.workbook.clone(),
                    range.sheet.clone(),
                    range.start_col + c,
                    range.start_row + r,
                );
                self.membership.lock().unwrap().push(MembershipMark {
                    cell_key: addr.node_key(),
                    range_key: range.node_key(),
                });
                row_vals.push(self.value_at(&addr));
            }
            data.push(row_vals);
        }
        Ok(Box::new(InMemoryRange::new(data)))
    }

    fn resolve_named_expression(
        &self,
        workbook: Option<&str>,
        sheet: Option<&str>,
        name: &str,
    ) -> Result<Resolved, CalcError> {
        let wb_name = workbook.unwrap_or(&self.current.workbook).to_string();
        let sheet_name = sheet.unwrap_or(&self.current.sheet).to_string();
        let wb = self
            .store
            .workbook(&wb_name)
            .ok_or_else(|| CalcError::new(ErrorKind::Ref))?;

        let found = wb
            .named_expression(&NamedScope::Sheet(sheet_name), name)
            .or_else(|| wb.named_expression(&NamedScope::Global, name))
            .ok_or_else(|| CalcError::new(ErrorKind::Name))?;

        let name_key = format!("name:{}:{}:{}", wb_name, found.scope.key_part(), name);
        if self.active.contains(&name_key) {
            return Err(CalcError::new(ErrorKind::Cycle));
        }
        self.record_dependency(name_key.clone());

        match &found.expression {
            RawContent::Number(n) => Ok(Resolved::Scalar(Value::Number(*n))),
            RawContent::Boolean(b) => Ok(Resolved::Scalar(Value::Boolean(*b))),
            RawContent::Empty => Ok(Resolved::Scalar(Value::Empty)),
            RawContent::Text(s) if s.starts_with('=') => {
                let ast = formualizer_parse::parser::parse(&s[1..])
                    .map_err(|_| CalcError::new(ErrorKind::Value))?;
                let mut nested_active = self.active.clone();
                nested_active.insert(name_key);
                let nested = EvalCtx::new(self.store, self.spills, &nested_active, self.current.clone());
                let result = Interpreter::new(&nested).evaluate_ast(&ast);
                self.deps.lock().unwrap().extend(nested.deps.into_inner().unwrap());
                self.frontier.lock().unwrap().extend(nested.frontier.into_inner().unwrap());
                self.membership.lock().unwrap().extend(nested.membership.into_inner().unwrap());
                match result {
                    EvalResult::Scalar(v) => Ok(Resolved::Scalar(v)),
                    EvalResult::Spilled { range, .. } => Ok(Resolved::Range(range)),
                }
            }
            RawContent::Text(s) => Ok(Resolved::Scalar(Value::String(s.clone()))),
        }
    }

    fn resolve_table(&self, table_ref: &TableReference) -> Result<Box<dyn Table>, CalcError> {
        let wb_name = table_ref
            .workbook
            .clone()
            .unwrap_or_else(|| self.current.workbook.clone());
        let wb = self
            .store
            .workbook(&wb_name)
            .ok_or_else(|| CalcError::new(ErrorKind::Ref))?;
        let table = wb
            .table(&table_ref.name)
            .ok_or_else(|| CalcError::new(ErrorKind::Ref))?
            .clone();
        let sheet = wb
            .sheet(&table.sheet)
            .ok_or_else(|| CalcError::new(ErrorKind::Ref))?;

        let last_row = match table.end_row {
            RangeEnd::Finite(r) => r,
            RangeEnd::Infinity => {
                let (left, right) = (table.left_col(), table.right_col());
                sheet
                    .defined_cells()
                    .filter(|(c, r, content)| {
                        *r > table.top_row && *c >= left && *c <= right && !content.is_empty()
                    })
                    .map(|(_, r, _)| r)
                    .max()
                    .unwrap_or(table.top_row)
            }
        };

        self.record_dependency(format!("tableCol:{}:{}", wb_name, table.name));

        let mut rows_data = Vec::new();
        for r in table.data_start_row()..=last_row {
            let mut row_vals = Vec::with_capacity(table.headers.len());
            for i in 0..table.headers.len() as u32 {
                let addr = CellAddress::new(wb_name.clone(), table.sheet.clone(), table.left_col() + i, r);
                self.membership.lock().unwrap().push(MembershipMark {
                    cell_key: addr.node_key(),
                    range_key: format!("tableCol:{}:{}", wb_name, table.name),
                });
                row_vals.push(self.value_at(&addr));
            }
            rows_data.push(row_vals);
        }

        Ok(Box::new(OwnedTable {
            headers: table.headers.clone(),
            rows: rows_data,
        }))
    }

    fn resolve_any(&self, reference: &ReferenceType, _current_cell: &CellAddress) -> Result<Resolved, CalcError> {
        match reference {
            ReferenceType::Cell { workbook, sheet, row, col } => {
                let addr = CellAddress::new(
                    workbook.clone().unwrap_or_else(|| self.current.workbook.clone()),
                    sheet.clone().unwrap_or_else(|| self.current.sheet.clone()),
                    *col,
                    *row,
                );
                Ok(Resolved::Scalar(self.resolve_cell(&addr)))
            }
            ReferenceType::Range {
                workbook,
                sheet,
                start_row,
                start_col,
                end_row,
                end_col,
            } => {
                let wb = workbook.clone().unwrap_or_else(|| self.current.workbook.clone());
                let sh = sheet.clone().unwrap_or_else(|| self.current.sheet.clone());
                let range = RangeAddr::new(
                    wb,
                    sh,
                    start_col.unwrap_or(0),
                    start_row.unwrap_or(0),
                    end_col.map(RangeEnd::Finite).unwrap_or(RangeEnd::Infinity),
                    end_row.map(RangeEnd::Finite).unwrap_or(RangeEnd::Infinity),
                )
                .map_err(|_| CalcError::new(ErrorKind::Ref))?;

                if range.is_single_cell() {
                    let addr = CellAddress::new(range.workbook, range.sheet, range.start_col, range.start_row);
                    Ok(Resolved::Scalar(self.resolve_cell(&addr)))
                } else {
                    Ok(Resolved::Range(self.resolve_range(&range)?))
                }
            }
            ReferenceType::ThreeDRange { .. } => {
                Err(CalcError::new(ErrorKind::Ref).with_message("3-D ranges are parsed but not evaluated"))
            }
            ReferenceType::Table(table_ref) => {
                let table = self.resolve_table(table_ref)?;
                match &table_ref.specifier {
                    None | Some(TableSpecifier::All) | Some(TableSpecifier::Data) => {
                        Ok(Resolved::Range(table.all_columns()))
                    }
                    Some(TableSpecifier::Column(name)) => Ok(Resolved::Range(table.get_column(name)?)),
                    _ => Err(CalcError::new(ErrorKind::Value)
                        .with_message("this structured-reference specifier is not supported")),
                }
            }
            ReferenceType::NamedExpression { workbook, name } => {
                self.resolve_named_expression(workbook.as_deref(), None, name)
            }
        }
    }
}

impl FunctionProvider for EvalCtx<'_> {
    fn get_function(&self, name: &str) -> Option<Arc<dyn Function>> {
        formualizer_eval::builtins::get(name)
    }
}

impl EvaluationContext for EvalCtx<'_> {
    fn current_cell(&self) -> &CellAddress {
        &self.current
    }

    fn record_dependency(&self, key: String) {
        self.deps.lock().unwrap().insert(key);
    }

    fn record_frontier_dependency(&self, key: String) {
        // `EvalCtx` records frontier marks via `self.frontier` directly
        // (they carry axis/line information `record_frontier_dependency`'s
        // bare `String` doesn't), so a call through the trait method alone
        // (e.g. from a third-party `Function` impl) is kept only as a plain
        // dependency: still correct, just not frontier-indexed.
        self.deps.lock().unwrap().insert(key);
    }
}
