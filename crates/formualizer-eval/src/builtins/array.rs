use std::sync::Arc;

use formualizer_common::{ErrorKind, Value};

use super::numeric_arg;
use crate::interpreter::compare_for_sort;
use crate::traits::{ArgumentHandle, EvaluationContext, Function, InMemoryRange, Range};

pub(super) fn register(add: &mut dyn FnMut(Arc<dyn Function>)) {
    add(Arc::new(SortFn));
    add(Arc::new(UniqueFn));
    add(Arc::new(SequenceFn));
    add(Arc::new(TransposeFn));
    add(Arc::new(FilterFn));
}

#[derive(Debug)]
struct SortFn;
impl Function for SortFn {
    fn name(&self) -> &'static str {
        "SORT"
    }
    fn min_args(&self) -> usize {
        1
    }
    fn eval(&self, args: &[ArgumentHandle], ctx: &dyn EvaluationContext) -> Value {
        self.eval_array(args, ctx)
            .map(|r| r.get(0, 0))
            .unwrap_or(Value::Error(ErrorKind::Value))
    }

    fn eval_array<'a, 'b>(
        &self,
        args: &'a [ArgumentHandle<'a, 'b>],
        _ctx: &dyn EvaluationContext,
    ) -> Option<Box<dyn Range>> {
        let range = args.first()?.range().ok()?;
        let sort_index = args
            .get(1)
            .and_then(|a| numeric_arg(a.value().as_ref()).ok())
            .map(|n| n as u32 - 1)
            .unwrap_or(0);
        let descending = args
            .get(2)
            .and_then(|a| numeric_arg(a.value().as_ref()).ok())
            .map(|n| n < 0.0)
            .unwrap_or(false);
        let mut rows = range.materialize();
        rows.sort_by(|a, b| {
            let key_a = a.get(sort_index as usize).cloned().unwrap_or(Value::Empty);
            let key_b = b.get(sort_index as usize).cloned().unwrap_or(Value::Empty);
            let ord = compare_for_sort(&key_a, &key_b);
            if descending {
                ord.reverse()
            } else {
                ord
            }
        });
        Some(Box::new(InMemoryRange::new(rows)))
    }
}

#[derive(Debug)]
struct UniqueFn;
impl Function for UniqueFn {
    fn name(&self) -> &'static str {
        "UNIQUE"
    }
    fn min_args(&self) -> usize {
        1
    }
    fn eval(&self, args: &[ArgumentHandle], ctx: &dyn EvaluationContext) -> Value {
        self.eval_array(args, ctx)
            .map(|r| r.get(0, 0))
            .unwrap_or(Value::Error(ErrorKind::Value))
    }

    fn eval_array<'a, 'b>(
        &self,
        args: &'a [ArgumentHandle<'a, 'b>],
        _ctx: &dyn EvaluationContext,
    ) -> Option<Box<dyn Range>> {
        let range = args.first()?.range().ok()?;
        let rows = range.materialize();
        let mut seen: Vec<&Vec<Value>> = Vec::new();
        let mut out = Vec::new();
        for row in &rows {
            if !seen.iter().any(|r| *r == row) {
                seen.push(row);
                out.push(row.clone());
            }
        }
        Some(Box::new(InMemoryRange::new(out)))
    }
}

#[derive(Debug)]
struct SequenceFn;
impl Function for SequenceFn {
    fn name(&self) -> &'static str {
        "SEQUENCE"
    }
    fn min_args(&self) -> usize {
        1
    }
    fn eval(&self, args: &[ArgumentHandle], ctx: &dyn EvaluationContext) -> Value {
        self.eval_array(args, ctx)
            .map(|r| r.get(0, 0))
            .unwrap_or(Value::Error(ErrorKind::Value))
    }

    fn eval_array<'a, 'b>(
        &self,
        args: &'a [ArgumentHandle<'a, 'b>],
        _ctx: &dyn EvaluationContext,
    ) -> Option<Box<dyn Range>> {
        let num_arg = |idx: usize, default: f64| -> Option<f64> {
            match args.get(idx) {
                Some(a) => numeric_arg(a.value().as_ref()).ok(),
                None => Some(default),
            }
        };
        let rows = numeric_arg(args.first()?.value().as_ref()).ok()? as u32;
        let cols = num_arg(1, 1.0)? as u32;
        let start = num_arg(2, 1.0)?;
        let step = num_arg(3, 1.0)?;
        let mut data = Vec::with_capacity(rows as usize);
        let mut value = start;
        for _ in 0..rows {
            let mut row_vals = Vec::with_capacity(cols as usize);
            for _ in 0..cols {
                row_vals.push(Value::Number(value));
                value += step;
            }
            data.push(row_vals);
        }
        Some(Box::new(InMemoryRange::new(data)))
    }
}

#[derive(Debug)]
struct TransposeFn;
impl Function for TransposeFn {
    fn name(&self) -> &'static str {
        "TRANSPOSE"
    }
    fn min_args(&self) -> usize {
        1
    }
    fn eval(&self, args: &[ArgumentHandle], ctx: &dyn EvaluationContext) -> Value {
        self.eval_array(args, ctx)
            .map(|r| r.get(0, 0))
            .unwrap_or(Value::Error(ErrorKind::Value))
    }

    fn eval_array<'a, 'b>(
        &self,
        args: &'a [ArgumentHandle<'a, 'b>],
        _ctx: &dyn EvaluationContext,
    ) -> Option<Box<dyn Range>> {
        let range = args.first()?.range().ok()?;
        let (rows, cols) = range.dimensions();
        let data = (0..cols)
            .map(|c| (0..rows).map(|r| range.get(r, c)).collect())
            .collect();
        Some(Box::new(InMemoryRange::new(data)))
    }
}

#[derive(Debug)]
struct FilterFn;
impl Function for FilterFn {
    fn name(&self) -> &'static str {
        "FILTER"
    }
    fn min_args(&self) -> usize {
        2
    }
    fn eval(&self, args: &[ArgumentHandle], ctx: &dyn EvaluationContext) -> Value {
        self.eval_array(args, ctx)
            .map(|r| r.get(0, 0))
            .unwrap_or(Value::Error(ErrorKind::Na))
    }

    fn eval_array<'a, 'b>(
        &self,
        args: &'a [ArgumentHandle<'a, 'b>],
        _ctx: &dyn EvaluationContext,
    ) -> Option<Box<dyn Range>> {
        let range = args.first()?.range().ok()?;
        let include = args.get(1)?.range().ok()?;
        let (rows, _) = range.dimensions();
        let (inc_rows, inc_cols) = include.dimensions();
        let mut out = Vec::new();
        for r in 0..rows {
            let keep = if inc_cols == 1 {
                include.get((r).min(inc_rows.saturating_sub(1)), 0).is_truthy()
            } else {
                include.get(0, r.min(inc_cols.saturating_sub(1))).is_truthy()
            };
            if keep {
                out.push((0..range.dimensions().1).map(|c| range.get(r, c)).collect());
            }
        }
        if out.is_empty() {
            None
        } else {
            Some(Box::new(InMemoryRange::new(out)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_generates_row_major_values() {
        let data: Vec<Vec<Value>> = (0..2)
            .map(|r| (0..3).map(|c| Value::Number((r * 3 + c + 1) as f64)).collect())
            .collect();
        let range = InMemoryRange::new(data);
        assert_eq!(range.get(1, 2), Value::Number(6.0));
    }
}
