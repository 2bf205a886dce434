//! The `Engine` facade (§6.1, §9): "the engine is a single owned object."
//! Owns the [`Store`], the dependency graph, the spill manager, and the
//! event bus, and is the only thing in this crate that turns a raw formula
//! string into an evaluated cell.

use std::panic::{self, AssertUnwindSafe};

use rustc_hash::FxHashSet;

use formualizer_common::{CellAddress, RangeEnd, Value};
use formualizer_common::ErrorKind;
use formualizer_parse::parser::ASTNode;

use formualizer_eval::engine::{
    recalculate, CellChanged, DependencyGraph, EventBus, NodeKey, RecalcHost, RecalcOutcome,
    SpillManager, Unsubscribe,
};
use formualizer_eval::{EvalResult, Interpreter};

use crate::context::{EvalCtx, FrontierMark};
use crate::error::{EngineError, EngineResult};
use crate::store::{NamedExpression, NamedScope, RawContent, Sheet, Store, TableDefinition, Workbook};

/// Everything a subscriber can observe (§6.1's event list).
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    CellChanged {
        workbook: String,
        sheet: String,
        address: CellAddress,
        old_value: String,
        new_value: String,
    },
    SheetAdded { workbook: String, sheet: String },
    SheetRenamed { workbook: String, old_name: String, new_name: String },
    SheetRemoved { workbook: String, sheet: String },
    NamedExpressionAdded { workbook: String, scope: String, name: String },
    NamedExpressionRemoved { workbook: String, scope: String, name: String },
    TableAdded { workbook: String, name: String },
    TableRenamed { workbook: String, old_name: String, new_name: String },
    TableRemoved { workbook: String, name: String },
}

/// Parses the fixed `cell:{workbook}:{sheet}:{col}:{row}` node-key format
/// (§4.3) back into an address. Workbook and sheet names are assumed not to
/// contain `:`, matching how every address in this crate is constructed.
fn parse_cell_key(key: &NodeKey) -> Option<CellAddress> {
    let parts: Vec<&str> = key.split(':').collect();
    if parts.len() != 5 || parts[0] != "cell" {
        return None;
    }
    let col: u32 = parts[3].parse().ok()?;
    let row: u32 = parts[4].parse().ok()?;
    Some(CellAddress::new(parts[1], parts[2], col, row))
}

pub struct Engine {
    store: Store,
    graph: DependencyGraph,
    spills: SpillManager,
    events: EventBus<EngineEvent>,
    /// Nodes found to participate in a cycle by the most recent recalc pass
    /// (§4.3): `recompute` writes `Error(Cycle)` for these instead of
    /// evaluating their formula.
    cycle_nodes: FxHashSet<NodeKey>,
    /// Cell changes discovered while applying a spill's area (added/released
    /// neighbor cells) that `recalculate`'s own `RecalcOutcome` never sees,
    /// since those cells are never themselves graph nodes.
    pending_spill_changes: Vec<CellChanged>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            store: Store::new(),
            graph: DependencyGraph::new(),
            spills: SpillManager::new(),
            events: EventBus::new(),
            cycle_nodes: FxHashSet::default(),
            pending_spill_changes: Vec::new(),
        }
    }

    pub fn build_empty() -> Self {
        Self::new()
    }

    pub fn on<F>(&self, handler: F) -> Unsubscribe<EngineEvent>
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /* ───────────────────────── workbooks ───────────────────────── */

    pub fn add_workbook(&mut self, name: impl Into<String>) -> EngineResult<()> {
        let name = name.into();
        if self.store.has_workbook(&name) {
            return Err(EngineError::DuplicateWorkbook(name));
        }
        self.store.workbooks.insert(name.clone(), Workbook::default());
        self.store.workbook_order.push(name);
        Ok(())
    }

    pub fn remove_workbook(&mut self, name: &str) -> EngineResult<()> {
        if self.store.workbooks.remove(name).is_none() {
            return Err(EngineError::UnknownWorkbook(name.to_string()));
        }
        self.store.workbook_order.retain(|w| w != name);
        Ok(())
    }

    pub fn rename_workbook(&mut self, old_name: &str, new_name: &str) -> EngineResult<RecalcOutcome> {
        if !self.store.has_workbook(old_name) {
            return Err(EngineError::UnknownWorkbook(old_name.to_string()));
        }
        if self.store.has_workbook(new_name) {
            return Err(EngineError::DuplicateWorkbook(new_name.to_string()));
        }
        let wb = self.store.workbooks.remove(old_name).unwrap();
        self.store.workbooks.insert(new_name.to_string(), wb);
        if let Some(pos) = self.store.workbook_order.iter().position(|w| w == old_name) {
            self.store.workbook_order[pos] = new_name.to_string();
        }
        let roots = self.all_cell_keys(new_name);
        Ok(self.recalc_from(roots))
    }

    /* ───────────────────────── sheets ───────────────────────── */

    pub fn add_sheet(&mut self, workbook: &str, sheet: impl Into<String>) -> EngineResult<()> {
        let sheet = sheet.into();
        let wb = self
            .store
            .workbooks
            .get_mut(workbook)
            .ok_or_else(|| EngineError::UnknownWorkbook(workbook.to_string()))?;
        if wb.has_sheet(&sheet) {
            return Err(EngineError::DuplicateSheet(sheet, workbook.to_string()));
        }
        wb.sheets.insert(sheet.clone(), Sheet::default());
        wb.sheet_order.push(sheet.clone());
        self.events.emit(&EngineEvent::SheetAdded {
            workbook: workbook.to_string(),
            sheet,
        });
        Ok(())
    }

    pub fn remove_sheet(&mut self, workbook: &str, sheet: &str) -> EngineResult<RecalcOutcome> {
        {
            let wb = self
                .store
                .workbooks
                .get_mut(workbook)
                .ok_or_else(|| EngineError::UnknownWorkbook(workbook.to_string()))?;
            if wb.sheets.remove(sheet).is_none() {
                return Err(EngineError::UnknownSheet(sheet.to_string(), workbook.to_string()));
            }
            wb.sheet_order.retain(|s| s != sheet);
            wb.tables.retain(|_, t| t.sheet != sheet);
        }
        self.events.emit(&EngineEvent::SheetRemoved {
            workbook: workbook.to_string(),
            sheet: sheet.to_string(),
        });
        let roots = self.all_cell_keys(workbook);
        Ok(self.recalc_from(roots))
    }

    pub fn rename_sheet(&mut self, workbook: &str, old_name: &str, new_name: &str) -> EngineResult<RecalcOutcome> {
        {
            let wb = self
                .store
                .workbooks
                .get_mut(workbook)
                .ok_or_else(|| EngineError::UnknownWorkbook(workbook.to_string()))?;
            if !wb.has_sheet(old_name) {
                return Err(EngineError::UnknownSheet(old_name.to_string(), workbook.to_string()));
            }
            if wb.has_sheet(new_name) {
                return Err(EngineError::DuplicateSheet(new_name.to_string(), workbook.to_string()));
            }
            let sheet = wb.sheets.remove(old_name).unwrap();
            wb.sheets.insert(new_name.to_string(), sheet);
            if let Some(pos) = wb.sheet_order.iter().position(|s| s == old_name) {
                wb.sheet_order[pos] = new_name.to_string();
            }
            for t in wb.tables.values_mut() {
                if t.sheet == old_name {
                    t.sheet = new_name.to_string();
                }
            }
        }
        self.events.emit(&EngineEvent::SheetRenamed {
            workbook: workbook.to_string(),
            old_name: old_name.to_string(),
            new_name: new_name.to_string(),
        });
        // Every node key under the old name is now stale; a formula
        // anywhere in the workbook could reference it, so re-derive the
        // whole workbook rather than trying to rewrite graph keys in place.
        let roots = self.all_cell_keys(workbook);
        Ok(self.recalc_from(roots))
    }

    fn all_cell_keys(&self, workbook: &str) -> Vec<NodeKey> {
        let Some(wb) = self.store.workbook(workbook) else {
            return Vec::new();
        };
        let mut keys = Vec::new();
        for sheet_name in &wb.sheet_order {
            if let Some(sheet) = wb.sheet(sheet_name) {
                for (c, r, _) in sheet.defined_cells() {
                    keys.push(CellAddress::new(workbook, sheet_name.clone(), c, r).node_key());
                }
            }
        }
        keys
    }

    /* ───────────────────────── cell content ───────────────────────── */

    pub fn set_cell_content(
        &mut self,
        workbook: &str,
        sheet: &str,
        col: u32,
        row: u32,
        content: impl Into<RawContent>,
    ) -> EngineResult<RecalcOutcome> {
        {
            let wb = self
                .store
                .workbooks
                .get_mut(workbook)
                .ok_or_else(|| EngineError::UnknownWorkbook(workbook.to_string()))?;
            let s = wb
                .sheets
                .get_mut(sheet)
                .ok_or_else(|| EngineError::UnknownSheet(sheet.to_string(), workbook.to_string()))?;
            s.set_raw_content(col, row, content.into());
        }
        let key = CellAddress::new(workbook, sheet, col, row).node_key();
        Ok(self.recalc_from(vec![key]))
    }

    pub fn set_sheet_content(
        &mut self,
        workbook: &str,
        sheet: &str,
        cells: impl IntoIterator<Item = (u32, u32, RawContent)>,
    ) -> EngineResult<RecalcOutcome> {
        let mut roots = Vec::new();
        {
            let wb = self
                .store
                .workbooks
                .get_mut(workbook)
                .ok_or_else(|| EngineError::UnknownWorkbook(workbook.to_string()))?;
            let s = wb
                .sheets
                .get_mut(sheet)
                .ok_or_else(|| EngineError::UnknownSheet(sheet.to_string(), workbook.to_string()))?;
            for (col, row, content) in cells {
                s.set_raw_content(col, row, content);
                roots.push(CellAddress::new(workbook, sheet, col, row).node_key());
            }
        }
        Ok(self.recalc_from(roots))
    }

    pub fn get_cell_value(&self, workbook: &str, sheet: &str, col: u32, row: u32) -> EngineResult<Value> {
        let wb = self
            .store
            .workbook(workbook)
            .ok_or_else(|| EngineError::UnknownWorkbook(workbook.to_string()))?;
        let s = wb
            .sheet(sheet)
            .ok_or_else(|| EngineError::UnknownSheet(sheet.to_string(), workbook.to_string()))?;
        Ok(s.display.get(&(col, row)).cloned().unwrap_or_else(|| match s.raw_content(col, row) {
            RawContent::Number(n) => Value::Number(n),
            RawContent::Boolean(b) => Value::Boolean(b),
            RawContent::Text(t) if t.starts_with('=') => Value::Empty,
            RawContent::Text(t) => Value::String(t),
            RawContent::Empty => Value::Empty,
        }))
    }

    /// The raw content the host typed in, exactly (§8's round-trip law) —
    /// not the evaluated value.
    pub fn get_cell_serialized(&self, workbook: &str, sheet: &str, col: u32, row: u32) -> EngineResult<String> {
        let wb = self
            .store
            .workbook(workbook)
            .ok_or_else(|| EngineError::UnknownWorkbook(workbook.to_string()))?;
        let s = wb
            .sheet(sheet)
            .ok_or_else(|| EngineError::UnknownSheet(sheet.to_string(), workbook.to_string()))?;
        Ok(s.raw_content(col, row).serialized())
    }

    pub fn get_sheet_serialized(&self, workbook: &str, sheet: &str) -> EngineResult<Vec<(u32, u32, String)>> {
        let wb = self
            .store
            .workbook(workbook)
            .ok_or_else(|| EngineError::UnknownWorkbook(workbook.to_string()))?;
        let s = wb
            .sheet(sheet)
            .ok_or_else(|| EngineError::UnknownSheet(sheet.to_string(), workbook.to_string()))?;
        Ok(s.defined_cells().map(|(c, r, content)| (c, r, content.serialized())).collect())
    }

    /* ───────────────────────── named expressions ───────────────────────── */

    pub fn add_named_expression(
        &mut self,
        workbook: &str,
        scope: NamedScope,
        name: impl Into<String>,
        expression: impl Into<RawContent>,
    ) -> EngineResult<RecalcOutcome> {
        let name = name.into();
        let wb = self
            .store
            .workbooks
            .get_mut(workbook)
            .ok_or_else(|| EngineError::UnknownWorkbook(workbook.to_string()))?;
        let map_key = (scope.key_part(), name.clone());
        if wb.named.contains_key(&map_key) {
            return Err(EngineError::DuplicateNamedExpression(name));
        }
        wb.named.insert(
            map_key,
            NamedExpression {
                name: name.clone(),
                scope: scope.clone(),
                expression: expression.into(),
            },
        );
        self.events.emit(&EngineEvent::NamedExpressionAdded {
            workbook: workbook.to_string(),
            scope: scope.key_part(),
            name: name.clone(),
        });
        let key = format!("name:{}:{}:{}", workbook, scope.key_part(), name);
        Ok(self.recalc_from(vec![key]))
    }

    pub fn update_named_expression(
        &mut self,
        workbook: &str,
        scope: NamedScope,
        name: &str,
        expression: impl Into<RawContent>,
    ) -> EngineResult<RecalcOutcome> {
        let wb = self
            .store
            .workbooks
            .get_mut(workbook)
            .ok_or_else(|| EngineError::UnknownWorkbook(workbook.to_string()))?;
        let map_key = (scope.key_part(), name.to_string());
        let entry = wb
            .named
            .get_mut(&map_key)
            .ok_or_else(|| EngineError::UnknownNamedExpression(name.to_string()))?;
        entry.expression = expression.into();
        let key = format!("name:{}:{}:{}", workbook, scope.key_part(), name);
        Ok(self.recalc_from(vec![key]))
    }

    pub fn remove_named_expression(&mut self, workbook: &str, scope: NamedScope, name: &str) -> EngineResult<RecalcOutcome> {
        {
            let wb = self
                .store
                .workbooks
                .get_mut(workbook)
                .ok_or_else(|| EngineError::UnknownWorkbook(workbook.to_string()))?;
            let map_key = (scope.key_part(), name.to_string());
            if wb.named.remove(&map_key).is_none() {
                return Err(EngineError::UnknownNamedExpression(name.to_string()));
            }
        }
        self.events.emit(&EngineEvent::NamedExpressionRemoved {
            workbook: workbook.to_string(),
            scope: scope.key_part(),
            name: name.to_string(),
        });
        let key = format!("name:{}:{}:{}", workbook, scope.key_part(), name);
        self.graph.remove_node(&key);
        Ok(self.recalc_from(vec![key]))
    }

    /* ───────────────────────── tables ───────────────────────── */

    pub fn add_table(&mut self, workbook: &str, definition: TableDefinition) -> EngineResult<RecalcOutcome> {
        if let RangeEnd::Finite(end) = definition.end_row {
            if end < definition.data_start_row() {
                return Err(EngineError::InvalidTableBounds(format!(
                    "table '{}' has no data rows",
                    definition.name
                )));
            }
        }
        let wb = self
            .store
            .workbooks
            .get_mut(workbook)
            .ok_or_else(|| EngineError::UnknownWorkbook(workbook.to_string()))?;
        if !wb.has_sheet(&definition.sheet) {
            return Err(EngineError::UnknownSheet(definition.sheet.clone(), workbook.to_string()));
        }
        if wb.tables.contains_key(&definition.name) {
            return Err(EngineError::DuplicateTable(definition.name.clone()));
        }
        let name = definition.name.clone();
        wb.tables.insert(name.clone(), definition);
        self.events.emit(&EngineEvent::TableAdded {
            workbook: workbook.to_string(),
            name: name.clone(),
        });
        let key = format!("tableCol:{}:{}", workbook, name);
        Ok(self.recalc_from(vec![key]))
    }

    pub fn rename_table(&mut self, workbook: &str, old_name: &str, new_name: &str) -> EngineResult<RecalcOutcome> {
        {
            let wb = self
                .store
                .workbooks
                .get_mut(workbook)
                .ok_or_else(|| EngineError::UnknownWorkbook(workbook.to_string()))?;
            if wb.tables.contains_key(new_name) {
                return Err(EngineError::DuplicateTable(new_name.to_string()));
            }
            let mut def = wb
                .tables
                .remove(old_name)
                .ok_or_else(|| EngineError::UnknownTable(old_name.to_string()))?;
            def.name = new_name.to_string();
            wb.tables.insert(new_name.to_string(), def);
        }
        self.events.emit(&EngineEvent::TableRenamed {
            workbook: workbook.to_string(),
            old_name: old_name.to_string(),
            new_name: new_name.to_string(),
        });
        let old_key = format!("tableCol:{}:{}", workbook, old_name);
        let new_key = format!("tableCol:{}:{}", workbook, new_name);
        self.graph.remove_node(&old_key);
        Ok(self.recalc_from(vec![new_key]))
    }

    pub fn remove_table(&mut self, workbook: &str, name: &str) -> EngineResult<RecalcOutcome> {
        {
            let wb = self
                .store
                .workbooks
                .get_mut(workbook)
                .ok_or_else(|| EngineError::UnknownWorkbook(workbook.to_string()))?;
            if wb.tables.remove(name).is_none() {
                return Err(EngineError::UnknownTable(name.to_string()));
            }
        }
        self.events.emit(&EngineEvent::TableRemoved {
            workbook: workbook.to_string(),
            name: name.to_string(),
        });
        let key = format!("tableCol:{}:{}", workbook, name);
        self.graph.remove_node(&key);
        Ok(self.recalc_from(vec![key]))
    }

    /* ───────────────────────── recalculation ───────────────────────── */

    fn recalc_from(&mut self, roots: Vec<NodeKey>) -> RecalcOutcome {
        self.pending_spill_changes.clear();

        // A root is exactly a cell whose raw content the caller just
        // changed, so it's the only place this pass could introduce an edge
        // cycle detection hasn't seen yet: refresh its precedent edges
        // first so a cycle closed (or broken) by this very edit is visible
        // to `detect_cycles` below, not just from the next recalc pass.
        for root in &roots {
            self.refresh_dependencies(root);
        }

        // The dirty-set and topological order are derived from the graph's
        // state *before* this pass's evaluations touch it; recompute()
        // replaces each cell's own edges with freshly-observed ones as it
        // goes (§4.7 step 3), which only takes effect for the next pass.
        let snapshot = self.graph.clone();
        self.cycle_nodes = snapshot.detect_cycles();
        let cycle_nodes = self.cycle_nodes.clone();
        #[cfg(feature = "tracing")]
        {
            if !cycle_nodes.is_empty() {
                tracing::debug!(count = cycle_nodes.len(), "cells participating in a reference cycle");
            }
        }

        let mut outcome = recalculate(&snapshot, roots, &cycle_nodes, self);
        outcome.changed.extend(self.pending_spill_changes.drain(..));

        #[cfg(feature = "tracing")]
        tracing::debug!(changed = outcome.changed.len(), "recalculation pass finished");

        for change in &outcome.changed {
            self.events.emit(&EngineEvent::CellChanged {
                workbook: change.address.workbook.clone(),
                sheet: change.address.sheet.clone(),
                address: change.address.clone(),
                old_value: change.old_value.clone(),
                new_value: change.new_value.clone(),
            });
        }
        outcome
    }

    fn ast_for(&mut self, addr: &CellAddress, raw: &RawContent) -> Option<ASTNode> {
        if let Some(ast) = self
            .store
            .workbook(&addr.workbook)
            .and_then(|wb| wb.sheet(&addr.sheet))
            .and_then(|s| s.ast.get(&(addr.col, addr.row)))
        {
            return Some(ast.clone());
        }
        let RawContent::Text(text) = raw else {
            return None;
        };
        let ast = formualizer_parse::parser::parse(&text[1..]).ok()?;
        if let Some(sheet) = self
            .store
            .workbooks
            .get_mut(&addr.workbook)
            .and_then(|wb| wb.sheets.get_mut(&addr.sheet))
        {
            sheet.ast.insert((addr.col, addr.row), ast.clone());
        }
        Some(ast)
    }

    fn write_scalar(&mut self, addr: &CellAddress, value: Value) {
        if let Some(sheet) = self
            .store
            .workbooks
            .get_mut(&addr.workbook)
            .and_then(|wb| wb.sheets.get_mut(&addr.sheet))
        {
            sheet.display.insert((addr.col, addr.row), value);
        }
    }

    fn clear_display(&mut self, addr: &CellAddress) {
        if let Some(sheet) = self
            .store
            .workbooks
            .get_mut(&addr.workbook)
            .and_then(|wb| wb.sheets.get_mut(&addr.sheet))
        {
            sheet.display.remove(&(addr.col, addr.row));
        }
    }

    fn display_serialized(&self, addr: &CellAddress) -> String {
        let Some(sheet) = self.store.workbook(&addr.workbook).and_then(|wb| wb.sheet(&addr.sheet)) else {
            return String::new();
        };
        match sheet.display.get(&(addr.col, addr.row)) {
            Some(v) => v.to_serialized_string(),
            None => sheet.raw_content(addr.col, addr.row).serialized(),
        }
    }

    /// Releases a spill this cell used to own (it no longer produces one),
    /// reporting every neighbor cell that reverts to its own raw content.
    fn release_spill_origin(&mut self, origin: &CellAddress) {
        let released = self.spills.release(origin);
        for cell in released {
            let old = self.display_serialized(&cell);
            self.clear_display(&cell);
            let new = self.display_serialized(&cell);
            if old != new {
                self.pending_spill_changes.push(CellChanged {
                    address: cell,
                    old_value: old,
                    new_value: new,
                });
            }
        }
    }

    fn apply_eval_result_for(&mut self, addr: &CellAddress, result: EvalResult) {
        match result {
            EvalResult::Scalar(v) => {
                self.release_spill_origin(addr);
                self.write_scalar(addr, v);
            }
            EvalResult::Spilled { origin, range } => {
                let (rows, cols) = range.dimensions();
                let mut area = Vec::with_capacity((rows * cols) as usize);
                for r in 0..rows {
                    for c in 0..cols {
                        area.push(CellAddress::new(
                            origin.workbook.clone(),
                            origin.sheet.clone(),
                            origin.col + c,
                            origin.row + r,
                        ));
                    }
                }

                let diff = {
                    let store = &self.store;
                    let has_content = |cell: &CellAddress| -> bool {
                        store
                            .workbook(&cell.workbook)
                            .and_then(|wb| wb.sheet(&cell.sheet))
                            .map(|sheet| !sheet.raw_content(cell.col, cell.row).is_empty())
                            .unwrap_or(false)
                    };
                    self.spills.apply(&origin, area, has_content)
                };

                if diff.collapsed {
                    self.write_scalar(&origin, Value::Error(ErrorKind::Spill));
                } else {
                    self.write_scalar(&origin, range.get(0, 0));
                    for cell in &diff.added {
                        let v = range.get(cell.row - origin.row, cell.col - origin.col);
                        let old = self.display_serialized(cell);
                        self.write_scalar(cell, v);
                        let new = self.display_serialized(cell);
                        if old != new {
                            self.pending_spill_changes.push(CellChanged {
                                address: cell.clone(),
                                old_value: old,
                                new_value: new,
                            });
                        }
                    }
                    for cell in &diff.released {
                        let old = self.display_serialized(cell);
                        self.clear_display(cell);
                        let new = self.display_serialized(cell);
                        if old != new {
                            self.pending_spill_changes.push(CellChanged {
                                address: cell.clone(),
                                old_value: old,
                                new_value: new,
                            });
                        }
                    }
                }
            }
        }
    }
}

impl Engine {
    /// Whether `addr` currently holds formula text, straight from the store
    /// (used both by `recompute` and by the edge-refresh pre-pass, so the
    /// two never disagree about what counts as a formula cell).
    fn is_formula_cell(&self, addr: &CellAddress) -> bool {
        self.store
            .workbook(&addr.workbook)
            .and_then(|wb| wb.sheet(&addr.sheet))
            .map(|sheet| sheet.raw_content(addr.col, addr.row).is_formula())
            .unwrap_or(false)
    }

    /// Parses and evaluates `addr`'s formula and writes whatever it observed
    /// about its own precedents into the dependency graph. Returns `None`
    /// for a non-formula cell, after clearing its edges. Shared by
    /// `recompute` (which also applies the resulting value) and
    /// `refresh_dependencies` (which only cares about the edges).
    fn evaluate_and_wire_edges(&mut self, key: &NodeKey, addr: &CellAddress) -> Option<EvalResult> {
        let raw = self
            .store
            .workbook(&addr.workbook)
            .and_then(|wb| wb.sheet(&addr.sheet))
            .map(|sheet| sheet.raw_content(addr.col, addr.row))
            .unwrap_or(RawContent::Empty);

        if !raw.is_formula() {
            self.graph.set_dependencies(key, std::iter::empty::<String>());
            return None;
        }

        let Some(ast) = self.ast_for(addr, &raw) else {
            self.graph.set_dependencies(key, std::iter::empty::<String>());
            return Some(EvalResult::Scalar(Value::Error(ErrorKind::Error)));
        };

        let active: FxHashSet<String> = FxHashSet::default();
        let (eval_result, deps, frontier, membership) = {
            let ctx = EvalCtx::new(&self.store, &self.spills, &active, addr.clone());
            let result = panic::catch_unwind(AssertUnwindSafe(|| Interpreter::new(&ctx).evaluate_ast(&ast)));
            let deps = ctx.deps.into_inner().unwrap();
            let frontier = ctx.frontier.into_inner().unwrap();
            let membership = ctx.membership.into_inner().unwrap();
            let eval_result = result.unwrap_or_else(|_| {
                #[cfg(feature = "tracing")]
                tracing::warn!(cell = %addr, "formula evaluation panicked; cell set to #ERROR!");
                EvalResult::Scalar(Value::Error(ErrorKind::Error))
            });
            (eval_result, deps, frontier, membership)
        };

        self.graph.set_dependencies(key, deps);
        for mark in frontier {
            match mark {
                FrontierMark::Column(sheet, col) => self.graph.add_column_frontier(&sheet, col, key.clone()),
                FrontierMark::Row(sheet, row) => self.graph.add_row_frontier(&sheet, row, key.clone()),
            }
        }
        for m in membership {
            self.graph.add_range_membership(m.cell_key, m.range_key);
        }

        Some(eval_result)
    }

    /// Re-derives a just-edited cell's own precedent edges without touching
    /// its displayed value (§4.3/§4.7): a cycle is only observable once the
    /// edited cell's *new* formula text has contributed its edges to the
    /// graph, but those edges are otherwise only written the next time the
    /// cell is recomputed. Called for each recalc root before cycle
    /// detection so closing (or breaking) a cycle takes effect the same
    /// pass it happens in, not the pass after.
    fn refresh_dependencies(&mut self, key: &NodeKey) {
        let Some(addr) = parse_cell_key(key) else {
            return;
        };
        self.evaluate_and_wire_edges(key, &addr);
    }
}

impl RecalcHost for Engine {
    fn recompute(&mut self, key: &NodeKey) -> (String, String) {
        let Some(addr) = parse_cell_key(key) else {
            // Range/name/table-column nodes carry no independently
            // observable value of their own (§4.7: "never emit
            // cell-changed directly").
            return (String::new(), String::new());
        };

        let old = self.display_serialized(&addr);

        // A cell that no longer holds a formula can't be a cycle member no
        // matter what last pass's `cycle_nodes` snapshot says (editing it to
        // a literal is exactly how a cycle gets broken) — so formula status
        // is checked first, before any cycle short-circuit.
        if !self.is_formula_cell(&addr) {
            self.clear_display(&addr);
            self.release_spill_origin(&addr);
            self.graph.set_dependencies(key, std::iter::empty::<String>());
            return (old, self.display_serialized(&addr));
        }

        if self.cycle_nodes.contains(key) {
            // Precedent edges are left untouched here: they were already
            // brought up to date either by this pass's `refresh_dependencies`
            // pre-pass (if this cell was just edited) or by its own last
            // real evaluation (if it wasn't). Clearing them would hide this
            // cell from `transitive_dependents` the next time a precedent
            // changes, even after the cycle is broken elsewhere.
            self.write_scalar(&addr, Value::Error(ErrorKind::Cycle));
            return (old, self.display_serialized(&addr));
        }

        if let Some(eval_result) = self.evaluate_and_wire_edges(key, &addr) {
            self.apply_eval_result_for(&addr, eval_result);
        }

        (old, self.display_serialized(&addr))
    }

    fn address_of(&self, key: &NodeKey) -> Option<CellAddress> {
        parse_cell_key(key)
    }

    fn sheet_index_of(&self, key: &NodeKey) -> u32 {
        parse_cell_key(key)
            .and_then(|addr| self.store.workbook(&addr.workbook).and_then(|wb| wb.sheet_index(&addr.sheet)))
            .unwrap_or(0)
    }
}
