use std::sync::Arc;

use formualizer_common::{CellAddress, ErrorKind, Value};
use formualizer_parse::parser::ASTNodeType;

use super::numeric_arg;
use crate::interpreter::compare;
use crate::traits::{ArgumentHandle, EvaluationContext, Function, InMemoryRange, Range, Resolved};

pub(super) fn register(add: &mut dyn FnMut(Arc<dyn Function>)) {
    add(Arc::new(IndexFn));
    add(Arc::new(MatchFn));
    add(Arc::new(VLookupFn));
    add(Arc::new(HLookupFn));
    add(Arc::new(XLookupFn));
    add(Arc::new(IndirectFn));
    add(Arc::new(OffsetFn));
    add(Arc::new(RowFn));
    add(Arc::new(ColumnFn));
    add(Arc::new(RowsFn));
    add(Arc::new(ColumnsFn));
    add(Arc::new(ChooseFn));
}

#[derive(Debug)]
struct IndexFn;
impl Function for IndexFn {
    fn name(&self) -> &'static str {
        "INDEX"
    }
    fn min_args(&self) -> usize {
        2
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let range = match args[0].range() {
            Ok(r) => r,
            Err(e) => return Value::Error(e.kind),
        };
        let (rows, cols) = range.dimensions();
        let row = match numeric_arg(args[1].value().as_ref()) {
            Ok(n) => n as i64,
            Err(e) => return Value::Error(e),
        };
        let col = if args.len() > 2 {
            match numeric_arg(args[2].value().as_ref()) {
                Ok(n) => n as i64,
                Err(e) => return Value::Error(e),
            }
        } else {
            if cols == 1 { 1 } else { 0 }
        };
        let row = if row == 0 && rows == 1 { 1 } else { row };
        if row < 1 || col < 1 || row as u32 > rows || col as u32 > cols {
            return Value::Error(ErrorKind::Ref);
        }
        range.get(row as u32 - 1, col as u32 - 1)
    }

    fn eval_array<'a, 'b>(
        &self,
        args: &'a [ArgumentHandle<'a, 'b>],
        _ctx: &dyn EvaluationContext,
    ) -> Option<Box<dyn Range>> {
        let range = args.first()?.range().ok()?;
        let (rows, cols) = range.dimensions();
        let row = args.get(1).map(|a| numeric_arg(a.value().as_ref()).unwrap_or(-1.0) as i64).unwrap_or(0);
        let col = args.get(2).map(|a| numeric_arg(a.value().as_ref()).unwrap_or(-1.0) as i64).unwrap_or(0);
        if row != 0 && col != 0 {
            return None;
        }
        if row == 0 && col > 0 {
            let c = (col as u32).checked_sub(1)?;
            if c >= cols {
                return None;
            }
            Some(Box::new(InMemoryRange::new(
                (0..rows).map(|r| vec![range.get(r, c)]).collect(),
            )))
        } else if col == 0 && row > 0 {
            let r = (row as u32).checked_sub(1)?;
            if r >= rows {
                return None;
            }
            Some(Box::new(InMemoryRange::new(vec![
                (0..cols).map(|c| range.get(r, c)).collect(),
            ])))
        } else {
            None
        }
    }
}

#[derive(Debug)]
struct MatchFn;
impl Function for MatchFn {
    fn name(&self) -> &'static str {
        "MATCH"
    }
    fn min_args(&self) -> usize {
        2
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let target = args[0].value();
        let range = match args[1].range() {
            Ok(r) => r,
            Err(e) => return Value::Error(e.kind),
        };
        let match_type = if args.len() > 2 {
            match numeric_arg(args[2].value().as_ref()) {
                Ok(n) => n as i32,
                Err(e) => return Value::Error(e),
            }
        } else {
            1
        };
        let values: Vec<Value> = range.iter_cells().collect();
        match match_type {
            0 => match values.iter().position(|v| v == target.as_ref()) {
                Some(i) => Value::Number((i + 1) as f64),
                None => Value::Error(ErrorKind::Na),
            },
            1 => {
                // values assumed ascending; find last value <= target
                let mut best: Option<usize> = None;
                for (i, v) in values.iter().enumerate() {
                    if compare("<=", v, target.as_ref()) == Value::Boolean(true) {
                        best = Some(i);
                    } else {
                        break;
                    }
                }
                best.map(|i| Value::Number((i + 1) as f64)).unwrap_or(Value::Error(ErrorKind::Na))
            }
            -1 => {
                let mut best: Option<usize> = None;
                for (i, v) in values.iter().enumerate() {
                    if compare(">=", v, target.as_ref()) == Value::Boolean(true) {
                        best = Some(i);
                    } else {
                        break;
                    }
                }
                best.map(|i| Value::Number((i + 1) as f64)).unwrap_or(Value::Error(ErrorKind::Na))
            }
            _ => Value::Error(ErrorKind::Value),
        }
    }
}

fn lookup_column(
    lookup_value: &Value,
    table: &dyn Range,
    key_col: u32,
    result_col: u32,
    approximate: bool,
) -> Value {
    let (rows, _) = table.dimensions();
    if approximate {
        let mut best: Option<u32> = None;
        for r in 0..rows {
            let cell = table.get(r, key_col);
            if compare("<=", &cell, lookup_value) == Value::Boolean(true) {
                best = Some(r);
            } else {
                break;
            }
        }
        match best {
            Some(r) => table.get(r, result_col),
            None => Value::Error(ErrorKind::Na),
        }
    } else {
        for r in 0..rows {
            if &table.get(r, key_col) == lookup_value {
                return table.get(r, result_col);
            }
        }
        Value::Error(ErrorKind::Na)
    }
}

#[derive(Debug)]
struct VLookupFn;
impl Function for VLookupFn {
    fn name(&self) -> &'static str {
        "VLOOKUP"
    }
    fn min_args(&self) -> usize {
        3
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let lookup_value = args[0].value();
        let table = match args[1].range() {
            Ok(r) => r,
            Err(e) => return Value::Error(e.kind),
        };
        let col = match numeric_arg(args[2].value().as_ref()) {
            Ok(n) => n as u32,
            Err(e) => return Value::Error(e),
        };
        let approximate = if args.len() > 3 {
            args[3].value().is_truthy()
        } else {
            true
        };
        if col < 1 {
            return Value::Error(ErrorKind::Value);
        }
        lookup_column(lookup_value.as_ref(), table.as_ref(), 0, col - 1, approximate)
    }
}

#[derive(Debug)]
struct HLookupFn;
impl Function for HLookupFn {
    fn name(&self) -> &'static str {
        "HLOOKUP"
    }
    fn min_args(&self) -> usize {
        3
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let lookup_value = args[0].value();
        let table = match args[1].range() {
            Ok(r) => r,
            Err(e) => return Value::Error(e.kind),
        };
        let row = match numeric_arg(args[2].value().as_ref()) {
            Ok(n) => n as u32,
            Err(e) => return Value::Error(e),
        };
        let approximate = if args.len() > 3 {
            args[3].value().is_truthy()
        } else {
            true
        };
        if row < 1 {
            return Value::Error(ErrorKind::Value);
        }
        let (_, cols) = table.dimensions();
        if approximate {
            let mut best: Option<u32> = None;
            for c in 0..cols {
                if compare("<=", &table.get(0, c), lookup_value.as_ref()) == Value::Boolean(true) {
                    best = Some(c);
                } else {
                    break;
                }
            }
            best.map(|c| table.get(row - 1, c)).unwrap_or(Value::Error(ErrorKind::Na))
        } else {
            for c in 0..cols {
                if table.get(0, c) == *lookup_value.as_ref() {
                    return table.get(row - 1, c);
                }
            }
            Value::Error(ErrorKind::Na)
        }
    }
}

#[derive(Debug)]
struct XLookupFn;
impl Function for XLookupFn {
    fn name(&self) -> &'static str {
        "XLOOKUP"
    }
    fn min_args(&self) -> usize {
        3
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let lookup_value = args[0].value();
        let lookup_array = match args[1].range() {
            Ok(r) => r,
            Err(e) => return Value::Error(e.kind),
        };
        let return_array = match args[2].range() {
            Ok(r) => r,
            Err(e) => return Value::Error(e.kind),
        };
        let not_found = args.get(3).map(|a| a.value().into_owned());
        let cells: Vec<Value> = lookup_array.iter_cells().collect();
        match cells.iter().position(|v| v == lookup_value.as_ref()) {
            Some(i) => {
                let (rows, cols) = return_array.dimensions();
                if cols == 1 {
                    return_array.get(i as u32, 0)
                } else if rows == 1 {
                    return_array.get(0, i as u32)
                } else {
                    Value::Error(ErrorKind::Value)
                }
            }
            None => not_found.unwrap_or(Value::Error(ErrorKind::Na)),
        }
    }
}

#[derive(Debug)]
struct IndirectFn;
impl Function for IndirectFn {
    fn name(&self) -> &'static str {
        "INDIRECT"
    }
    fn min_args(&self) -> usize {
        1
    }
    fn eval(&self, args: &[ArgumentHandle], ctx: &dyn EvaluationContext) -> Value {
        let text = super::text_of(args[0].value().as_ref());
        match formualizer_parse::parser::parse(&text) {
            Ok(ast) => match &ast.node_type {
                ASTNodeType::Reference { reference, .. } => {
                    match ctx.resolve_any(reference, ctx.current_cell()) {
                        Ok(Resolved::Scalar(v)) => v,
                        Ok(Resolved::Range(r)) => {
                            if r.dimensions() == (1, 1) {
                                r.get(0, 0)
                            } else {
                                Value::Error(ErrorKind::Value)
                            }
                        }
                        Err(e) => Value::Error(e.kind),
                    }
                }
                _ => Value::Error(ErrorKind::Ref),
            },
            Err(_) => Value::Error(ErrorKind::Ref),
        }
    }
}

#[derive(Debug)]
struct OffsetFn;
impl Function for OffsetFn {
    fn name(&self) -> &'static str {
        "OFFSET"
    }
    fn min_args(&self) -> usize {
        3
    }
    fn eval(&self, args: &[ArgumentHandle], ctx: &dyn EvaluationContext) -> Value {
        let base = match base_address(&args[0], ctx) {
            Some(b) => b,
            None => return Value::Error(ErrorKind::Ref),
        };
        let row_off = match numeric_arg(args[1].value().as_ref()) {
            Ok(n) => n as i64,
            Err(e) => return Value::Error(e),
        };
        let col_off = match numeric_arg(args[2].value().as_ref()) {
            Ok(n) => n as i64,
            Err(e) => return Value::Error(e),
        };
        let new_row = base.row as i64 + row_off;
        let new_col = base.col as i64 + col_off;
        if new_row < 0 || new_col < 0 {
            return Value::Error(ErrorKind::Ref);
        }
        let target = CellAddress::new(base.workbook, base.sheet, new_col as u32, new_row as u32);
        ctx.resolve_cell(&target)
    }
}

fn base_address(handle: &ArgumentHandle, ctx: &dyn EvaluationContext) -> Option<CellAddress> {
    match &handle.ast().node_type {
        ASTNodeType::Reference {
            reference: formualizer_parse::parser::ReferenceType::Cell { workbook, sheet, row, col },
            ..
        } => Some(CellAddress::new(
            workbook.clone().unwrap_or_else(|| ctx.current_cell().workbook.clone()),
            sheet.clone().unwrap_or_else(|| ctx.current_cell().sheet.clone()),
            *col,
            *row,
        )),
        ASTNodeType::Reference {
            reference:
                formualizer_parse::parser::ReferenceType::Range {
                    workbook,
                    sheet,
                    start_row: Some(row),
                    start_col: Some(col),
                    ..
                },
            ..
        } => Some(CellAddress::new(
            workbook.clone().unwrap_or_else(|| ctx.current_cell().workbook.clone()),
            sheet.clone().unwrap_or_else(|| ctx.current_cell().sheet.clone()),
            *col,
            *row,
        )),
        _ => None,
    }
}

#[derive(Debug)]
struct RowFn;
impl Function for RowFn {
    fn name(&self) -> &'static str {
        "ROW"
    }
    fn eval(&self, args: &[ArgumentHandle], ctx: &dyn EvaluationContext) -> Value {
        if let Some(a) = args.first() {
            if let Some(addr) = base_address(a, ctx) {
                return Value::Number((addr.row + 1) as f64);
            }
        }
        Value::Number((ctx.current_cell().row + 1) as f64)
    }
}

#[derive(Debug)]
struct ColumnFn;
impl Function for ColumnFn {
    fn name(&self) -> &'static str {
        "COLUMN"
    }
    fn eval(&self, args: &[ArgumentHandle], ctx: &dyn EvaluationContext) -> Value {
        if let Some(a) = args.first() {
            if let Some(addr) = base_address(a, ctx) {
                return Value::Number((addr.col + 1) as f64);
            }
        }
        Value::Number((ctx.current_cell().col + 1) as f64)
    }
}

#[derive(Debug)]
struct RowsFn;
impl Function for RowsFn {
    fn name(&self) -> &'static str {
        "ROWS"
    }
    fn min_args(&self) -> usize {
        1
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        match args[0].range() {
            Ok(r) => Value::Number(r.dimensions().0 as f64),
            Err(e) => Value::Error(e.kind),
        }
    }
}

#[derive(Debug)]
struct ColumnsFn;
impl Function for ColumnsFn {
    fn name(&self) -> &'static str {
        "COLUMNS"
    }
    fn min_args(&self) -> usize {
        1
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        match args[0].range() {
            Ok(r) => Value::Number(r.dimensions().1 as f64),
            Err(e) => Value::Error(e.kind),
        }
    }
}

#[derive(Debug)]
struct ChooseFn;
impl Function for ChooseFn {
    fn name(&self) -> &'static str {
        "CHOOSE"
    }
    fn min_args(&self) -> usize {
        2
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let idx = match numeric_arg(args[0].value().as_ref()) {
            Ok(n) => n as usize,
            Err(e) => return Value::Error(e),
        };
        if idx < 1 || idx >= args.len() {
            return Value::Error(ErrorKind::Value);
        }
        args[idx].value().into_owned()
    }
}
