use crate::{Engine, RawContent, Value};

/// Evaluates a formula in a minimal single-cell workbook and returns the
/// resulting value. Intended for documentation examples, to avoid repeating
/// workbook/sheet setup in every doc comment.
///
/// # Example
///
/// ```rust
/// # use formualizer::doc_examples::eval_scalar;
/// let value = eval_scalar("=SUM(1,2,3)")?;
/// assert_eq!(value, formualizer::Value::Number(6.0));
/// # Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
/// ```
pub fn eval_scalar(formula: &str) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> {
    let mut engine = Engine::new();
    engine.add_workbook("Book1")?;
    engine.add_sheet("Book1", "Sheet1")?;
    engine.set_cell_content("Book1", "Sheet1", 0, 0, RawContent::from(formula))?;
    Ok(engine.get_cell_value("Book1", "Sheet1", 0, 0)?)
}
