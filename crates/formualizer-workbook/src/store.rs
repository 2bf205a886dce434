//! The Store (§3.3, §4.2): workbooks, sheets, raw cell content, named
//! expressions, and table definitions. Holds no evaluation logic — the
//! `Engine` in `engine.rs` is the only thing that reads an `ASTNode` out of
//! a formula or touches the dependency graph.

use rustc_hash::FxHashMap;

use formualizer_common::RangeEnd;

/// Whatever the host actually typed into a cell (§4.2: "a string (possibly a
/// formula), a number, a boolean, or Empty").
#[derive(Debug, Clone, PartialEq)]
pub enum RawContent {
    Number(f64),
    Boolean(bool),
    /// Text content; a leading `=` marks it as a formula (§6.2).
    Text(String),
    Empty,
}

impl RawContent {
    pub fn is_formula(&self) -> bool {
        matches!(self, RawContent::Text(s) if s.starts_with('='))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, RawContent::Empty)
    }

    /// The raw content exactly as the host would get it back from
    /// `getCellSerialized` (§8 round-trip law: byte-for-byte).
    pub fn serialized(&self) -> String {
        match self {
            RawContent::Number(n) => formualizer_common::format_number(*n),
            RawContent::Boolean(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            RawContent::Text(s) => s.clone(),
            RawContent::Empty => String::new(),
        }
    }
}

impl From<f64> for RawContent {
    fn from(n: f64) -> Self {
        RawContent::Number(n)
    }
}

impl From<bool> for RawContent {
    fn from(b: bool) -> Self {
        RawContent::Boolean(b)
    }
}

impl From<&str> for RawContent {
    fn from(s: &str) -> Self {
        if s.is_empty() {
            RawContent::Empty
        } else {
            RawContent::Text(s.to_string())
        }
    }
}

impl From<String> for RawContent {
    fn from(s: String) -> Self {
        RawContent::from(s.as_str())
    }
}

/// A single sheet's raw content plus the engine's cached parse/evaluation
/// state for it. `display` is the currently-visible value of every cell that
/// is a formula or is covered by someone else's spill (§3.4/§3.5); plain
/// literal cells are derived from `raw` on demand and never cached here.
#[derive(Debug, Default)]
pub struct Sheet {
    pub(crate) raw: FxHashMap<(u32, u32), RawContent>,
    pub(crate) ast: FxHashMap<(u32, u32), formualizer_parse::parser::ASTNode>,
    pub(crate) display: FxHashMap<(u32, u32), formualizer_common::Value>,
}

impl Sheet {
    pub fn raw_content(&self, col: u32, row: u32) -> RawContent {
        self.raw.get(&(col, row)).cloned().unwrap_or(RawContent::Empty)
    }

    pub fn set_raw_content(&mut self, col: u32, row: u32, content: RawContent) {
        self.ast.remove(&(col, row));
        self.display.remove(&(col, row));
        if content.is_empty() {
            self.raw.remove(&(col, row));
        } else {
            self.raw.insert((col, row), content);
        }
    }

    /// Every cell with non-empty raw content, for `getSheetSerialized` and
    /// for the open-range evaluator's "defined cells" enumeration (§4.5
    /// step 1).
    pub fn defined_cells(&self) -> impl Iterator<Item = (u32, u32, &RawContent)> {
        self.raw.iter().map(|(&(c, r), content)| (c, r, content))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NamedScope {
    Global,
    Sheet(String),
}

impl NamedScope {
    pub fn key_part(&self) -> String {
        match self {
            NamedScope::Global => "global".to_string(),
            NamedScope::Sheet(s) => s.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NamedExpression {
    pub name: String,
    pub scope: NamedScope,
    pub expression: RawContent,
}

/// A registered table (§3.3). `end_row` may be `Infinity` for a table that
/// grows with the sheet; the data area always starts one row below `top`.
#[derive(Debug, Clone)]
pub struct TableDefinition {
    pub name: String,
    pub sheet: String,
    pub top_col: u32,
    pub top_row: u32,
    pub end_row: RangeEnd,
    pub headers: Vec<String>,
}

impl TableDefinition {
    pub fn data_start_row(&self) -> u32 {
        self.top_row + 1
    }

    pub fn column_index(&self, name: &str) -> Option<u32> {
        self.headers.iter().position(|h| h == name).map(|i| i as u32)
    }

    pub fn left_col(&self) -> u32 {
        self.top_col
    }

    pub fn right_col(&self) -> u32 {
        self.top_col + self.headers.len() as u32 - 1
    }
}

#[derive(Debug, Default)]
pub struct Workbook {
    pub(crate) sheets: FxHashMap<String, Sheet>,
    pub(crate) sheet_order: Vec<String>,
    pub(crate) named: FxHashMap<(String, String), NamedExpression>,
    pub(crate) tables: FxHashMap<String, TableDefinition>,
}

impl Workbook {
    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        self.sheets.get(name)
    }

    pub fn has_sheet(&self, name: &str) -> bool {
        self.sheets.contains_key(name)
    }

    pub fn sheet_names(&self) -> &[String] {
        &self.sheet_order
    }

    pub fn sheet_index(&self, name: &str) -> Option<u32> {
        self.sheet_order.iter().position(|s| s == name).map(|i| i as u32)
    }

    pub fn named_expression(&self, scope: &NamedScope, name: &str) -> Option<&NamedExpression> {
        self.named.get(&(scope.key_part(), name.to_string()))
    }

    pub fn table(&self, name: &str) -> Option<&TableDefinition> {
        self.tables.get(name)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &String> {
        self.tables.keys()
    }

    pub fn tables_on_sheet<'a>(&'a self, sheet: &'a str) -> impl Iterator<Item = &'a TableDefinition> {
        self.tables.values().filter(move |t| t.sheet == sheet)
    }
}

#[derive(Debug, Default)]
pub struct Store {
    pub(crate) workbooks: FxHashMap<String, Workbook>,
    pub(crate) workbook_order: Vec<String>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workbook(&self, name: &str) -> Option<&Workbook> {
        self.workbooks.get(name)
    }

    pub fn has_workbook(&self, name: &str) -> bool {
        self.workbooks.contains_key(name)
    }

    pub fn workbook_names(&self) -> &[String] {
        &self.workbook_order
    }
}
