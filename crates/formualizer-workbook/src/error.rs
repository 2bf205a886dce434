//! `EngineError`: failures at the Store/API boundary, never written into a
//! cell (§7, "Rust error layering"). A cell-level failure is always a
//! `formualizer_common::Value::Error`, produced through `CalcError`.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("workbook '{0}' does not exist")]
    UnknownWorkbook(String),

    #[error("workbook '{0}' already exists")]
    DuplicateWorkbook(String),

    #[error("sheet '{0}' does not exist in workbook '{1}'")]
    UnknownSheet(String, String),

    #[error("sheet '{0}' already exists in workbook '{1}'")]
    DuplicateSheet(String, String),

    #[error("named expression '{0}' already exists in this scope")]
    DuplicateNamedExpression(String),

    #[error("named expression '{0}' does not exist in this scope")]
    UnknownNamedExpression(String),

    #[error("table '{0}' already exists")]
    DuplicateTable(String),

    #[error("table '{0}' does not exist")]
    UnknownTable(String),

    #[error("table bounds are structurally invalid: {0}")]
    InvalidTableBounds(String),

    #[error("'{0}' is not a valid identifier")]
    InvalidIdentifier(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
