//! Meta crate that re-exports the Formualizer building blocks with sensible
//! defaults. Downstream users can depend on this crate and opt into specific
//! layers via feature flags, or reach into the underlying crates directly
//! when deeper integration is required.

#[cfg(feature = "common")]
pub use formualizer_common as common;

#[cfg(feature = "parse")]
pub use formualizer_parse as parse;

#[cfg(feature = "eval")]
pub use formualizer_eval as eval;

#[cfg(feature = "workbook")]
pub use formualizer_workbook as workbook;

#[cfg(feature = "workbook")]
pub use formualizer_workbook::{Engine, EngineError, EngineEvent, EngineResult, RawContent};

#[cfg(feature = "common")]
pub use formualizer_common::{CalcError, CellAddress, ErrorKind, Value};

#[cfg(feature = "workbook")]
pub mod doc_examples;
