//! The nine first-class error kinds and the `Result` error type threaded through
//! parsing and evaluation (`CalcError`). `CalcError` is not itself a cell value —
//! it collapses into `Value::Error(kind)` at the point a `Result` is unwrapped into
//! a cell's evaluated value; the optional message is diagnostic only and never
//! appears in the serialized wire form.

use std::error::Error;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One of the nine error codes a cell can hold.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Div0,
    Na,
    Name,
    Num,
    Ref,
    Value,
    Cycle,
    Error,
    Spill,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Div0 => "#DIV/0!",
            ErrorKind::Na => "#N/A",
            ErrorKind::Name => "#NAME?",
            ErrorKind::Num => "#NUM!",
            ErrorKind::Ref => "#REF!",
            ErrorKind::Value => "#VALUE!",
            ErrorKind::Cycle => "#CYCLE!",
            ErrorKind::Error => "#ERROR!",
            ErrorKind::Spill => "#SPILL!",
        })
    }
}

impl ErrorKind {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.trim() {
            "#DIV/0!" => ErrorKind::Div0,
            "#N/A" => ErrorKind::Na,
            "#NAME?" => ErrorKind::Name,
            "#NUM!" => ErrorKind::Num,
            "#REF!" => ErrorKind::Ref,
            "#VALUE!" => ErrorKind::Value,
            "#CYCLE!" => ErrorKind::Cycle,
            "#ERROR!" => ErrorKind::Error,
            "#SPILL!" => ErrorKind::Spill,
            _ => return None,
        })
    }
}

/// `Result` error type for parsing and evaluation. Carries an `ErrorKind` plus an
/// optional human-readable message for diagnostics/logging.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CalcError {
    pub kind: ErrorKind,
    pub message: Option<String>,
}

impl CalcError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message<S: Into<String>>(mut self, msg: S) -> Self {
        self.message = Some(msg.into());
        self
    }
}

impl From<ErrorKind> for CalcError {
    fn from(kind: ErrorKind) -> Self {
        CalcError::new(kind)
    }
}

impl fmt::Display for CalcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl Error for CalcError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_wire_tags() {
        assert_eq!(ErrorKind::Div0.to_string(), "#DIV/0!");
        assert_eq!(ErrorKind::Na.to_string(), "#N/A");
        assert_eq!(ErrorKind::Cycle.to_string(), "#CYCLE!");
        assert_eq!(ErrorKind::Spill.to_string(), "#SPILL!");
    }

    #[test]
    fn parse_round_trips_display() {
        for kind in [
            ErrorKind::Div0,
            ErrorKind::Na,
            ErrorKind::Name,
            ErrorKind::Num,
            ErrorKind::Ref,
            ErrorKind::Value,
            ErrorKind::Cycle,
            ErrorKind::Error,
            ErrorKind::Spill,
        ] {
            assert_eq!(ErrorKind::parse(&kind.to_string()), Some(kind));
        }
    }
}
