use std::sync::Arc;

use formualizer_common::{ErrorKind, Value};

use super::{first_error, flatten, numeric_or_skip};
use crate::criteria::Criteria;
use crate::traits::{ArgumentHandle, EvaluationContext, Function};

pub(super) fn register(add: &mut dyn FnMut(Arc<dyn Function>)) {
    add(Arc::new(CountFn));
    add(Arc::new(CountAFn));
    add(Arc::new(CountBlankFn));
    add(Arc::new(CountIfFn));
    add(Arc::new(CountIfsFn));
    add(Arc::new(AverageFn));
    add(Arc::new(AverageIfFn));
    add(Arc::new(MaxFn));
    add(Arc::new(MinFn));
    add(Arc::new(MedianFn));
    add(Arc::new(StdevFn));
    add(Arc::new(VarFn));
    add(Arc::new(SumIfFn));
    add(Arc::new(SumIfsFn));
}

fn numbers(args: &[ArgumentHandle]) -> Result<Vec<f64>, ErrorKind> {
    let mut out = Vec::new();
    for arg in args {
        let values = flatten(arg.value_or_range());
        if let Some(e) = first_error(&values) {
            return Err(e);
        }
        for v in &values {
            if let Some(n) = numeric_or_skip(v) {
                out.push(n?);
            }
        }
    }
    Ok(out)
}

#[derive(Debug)]
struct CountFn;
impl Function for CountFn {
    fn name(&self) -> &'static str {
        "COUNT"
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let mut n = 0;
        for arg in args {
            for v in flatten(arg.value_or_range()) {
                if matches!(v, Value::Number(_) | Value::Infinity(_)) {
                    n += 1;
                }
            }
        }
        Value::Number(n as f64)
    }
}

#[derive(Debug)]
struct CountAFn;
impl Function for CountAFn {
    fn name(&self) -> &'static str {
        "COUNTA"
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let mut n = 0;
        for arg in args {
            for v in flatten(arg.value_or_range()) {
                if !matches!(v, Value::Empty) {
                    n += 1;
                }
            }
        }
        Value::Number(n as f64)
    }
}

#[derive(Debug)]
struct CountBlankFn;
impl Function for CountBlankFn {
    fn name(&self) -> &'static str {
        "COUNTBLANK"
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let mut n = 0;
        for arg in args {
            for v in flatten(arg.value_or_range()) {
                if matches!(v, Value::Empty) {
                    n += 1;
                }
            }
        }
        Value::Number(n as f64)
    }
}

#[derive(Debug)]
struct CountIfFn;
impl Function for CountIfFn {
    fn name(&self) -> &'static str {
        "COUNTIF"
    }
    fn min_args(&self) -> usize {
        2
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let range = flatten(args[0].value_or_range());
        let criteria = Criteria::parse(args[1].value().as_ref());
        Value::Number(range.iter().filter(|v| criteria.is_match(v)).count() as f64)
    }
}

#[derive(Debug)]
struct CountIfsFn;
impl Function for CountIfsFn {
    fn name(&self) -> &'static str {
        "COUNTIFS"
    }
    fn min_args(&self) -> usize {
        2
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        match pair_masks(args, 0) {
            Ok(mask) => Value::Number(mask.iter().filter(|&&m| m).count() as f64),
            Err(e) => Value::Error(e),
        }
    }
}

/// Builds the conjunction mask for `(range, criteria)` pairs starting at
/// `args[start]`, used by `COUNTIFS`/`SUMIFS`/`AVERAGEIFS`.
fn pair_masks(args: &[ArgumentHandle], start: usize) -> Result<Vec<bool>, ErrorKind> {
    let pairs = &args[start..];
    if pairs.len() % 2 != 0 || pairs.is_empty() {
        return Err(ErrorKind::Value);
    }
    let mut mask: Option<Vec<bool>> = None;
    for pair in pairs.chunks(2) {
        let range = flatten(pair[0].value_or_range());
        let criteria = Criteria::parse(pair[1].value().as_ref());
        let this: Vec<bool> = range.iter().map(|v| criteria.is_match(v)).collect();
        mask = Some(match mask {
            None => this,
            Some(prev) => prev
                .into_iter()
                .zip(this)
                .map(|(a, b)| a && b)
                .collect(),
        });
    }
    Ok(mask.unwrap_or_default())
}

#[derive(Debug)]
struct AverageFn;
impl Function for AverageFn {
    fn name(&self) -> &'static str {
        "AVERAGE"
    }
    fn min_args(&self) -> usize {
        1
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        match numbers(args) {
            Ok(ns) if ns.is_empty() => Value::Error(ErrorKind::Div0),
            Ok(ns) => Value::number(ns.iter().sum::<f64>() / ns.len() as f64),
            Err(e) => Value::Error(e),
        }
    }
}

#[derive(Debug)]
struct AverageIfFn;
impl Function for AverageIfFn {
    fn name(&self) -> &'static str {
        "AVERAGEIF"
    }
    fn min_args(&self) -> usize {
        2
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let range = flatten(args[0].value_or_range());
        let criteria = Criteria::parse(args[1].value().as_ref());
        let avg_source = if args.len() > 2 {
            flatten(args[2].value_or_range())
        } else {
            range.clone()
        };
        let mut total = 0.0;
        let mut count = 0usize;
        for (c, v) in range.iter().zip(avg_source.iter()) {
            if criteria.is_match(c) {
                match numeric_or_skip(v) {
                    Some(Ok(n)) => {
                        total += n;
                        count += 1;
                    }
                    Some(Err(e)) => return Value::Error(e),
                    None => {}
                }
            }
        }
        if count == 0 {
            Value::Error(ErrorKind::Div0)
        } else {
            Value::number(total / count as f64)
        }
    }
}

#[derive(Debug)]
struct MaxFn;
impl Function for MaxFn {
    fn name(&self) -> &'static str {
        "MAX"
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        match numbers(args) {
            Ok(ns) if ns.is_empty() => Value::Number(0.0),
            Ok(ns) => Value::number(ns.into_iter().fold(f64::NEG_INFINITY, f64::max)),
            Err(e) => Value::Error(e),
        }
    }
}

#[derive(Debug)]
struct MinFn;
impl Function for MinFn {
    fn name(&self) -> &'static str {
        "MIN"
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        match numbers(args) {
            Ok(ns) if ns.is_empty() => Value::Number(0.0),
            Ok(ns) => Value::number(ns.into_iter().fold(f64::INFINITY, f64::min)),
            Err(e) => Value::Error(e),
        }
    }
}

#[derive(Debug)]
struct MedianFn;
impl Function for MedianFn {
    fn name(&self) -> &'static str {
        "MEDIAN"
    }
    fn min_args(&self) -> usize {
        1
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        match numbers(args) {
            Ok(mut ns) if !ns.is_empty() => {
                ns.sort_by(|a, b| a.partial_cmp(b).unwrap());
                let mid = ns.len() / 2;
                Value::number(if ns.len() % 2 == 0 {
                    (ns[mid - 1] + ns[mid]) / 2.0
                } else {
                    ns[mid]
                })
            }
            Ok(_) => Value::Error(ErrorKind::Num),
            Err(e) => Value::Error(e),
        }
    }
}

#[derive(Debug)]
struct StdevFn;
impl Function for StdevFn {
    fn name(&self) -> &'static str {
        "STDEV"
    }
    fn min_args(&self) -> usize {
        1
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        sample_variance(args).map_or_else(Value::Error, |v| Value::number(v.sqrt()))
    }
}

#[derive(Debug)]
struct VarFn;
impl Function for VarFn {
    fn name(&self) -> &'static str {
        "VAR"
    }
    fn min_args(&self) -> usize {
        1
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        sample_variance(args).map_or_else(Value::Error, Value::number)
    }
}

fn sample_variance(args: &[ArgumentHandle]) -> Result<f64, ErrorKind> {
    let ns = numbers(args)?;
    if ns.len() < 2 {
        return Err(ErrorKind::Div0);
    }
    let mean = ns.iter().sum::<f64>() / ns.len() as f64;
    let sum_sq = ns.iter().map(|n| (n - mean).powi(2)).sum::<f64>();
    Ok(sum_sq / (ns.len() - 1) as f64)
}

#[derive(Debug)]
struct SumIfFn;
impl Function for SumIfFn {
    fn name(&self) -> &'static str {
        "SUMIF"
    }
    fn min_args(&self) -> usize {
        2
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let range = flatten(args[0].value_or_range());
        let criteria = Criteria::parse(args[1].value().as_ref());
        let sum_source = if args.len() > 2 {
            flatten(args[2].value_or_range())
        } else {
            range.clone()
        };
        let mut total = 0.0;
        for (c, v) in range.iter().zip(sum_source.iter()) {
            if criteria.is_match(c) {
                match numeric_or_skip(v) {
                    Some(Ok(n)) => total += n,
                    Some(Err(e)) => return Value::Error(e),
                    None => {}
                }
            }
        }
        Value::number(total)
    }
}

#[derive(Debug)]
struct SumIfsFn;
impl Function for SumIfsFn {
    fn name(&self) -> &'static str {
        "SUMIFS"
    }
    fn min_args(&self) -> usize {
        3
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let sum_source = flatten(args[0].value_or_range());
        match pair_masks(args, 1) {
            Ok(mask) => {
                let mut total = 0.0;
                for (keep, v) in mask.iter().zip(sum_source.iter()) {
                    if *keep {
                        match numeric_or_skip(v) {
                            Some(Ok(n)) => total += n,
                            Some(Err(e)) => return Value::Error(e),
                            None => {}
                        }
                    }
                }
                Value::number(total)
            }
            Err(e) => Value::Error(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::Criteria;

    #[test]
    fn countif_criteria_roundtrips_through_parse() {
        let crit = Criteria::parse(&Value::String(">3".into()));
        let vals = vec![Value::Number(1.0), Value::Number(5.0), Value::Number(3.0)];
        assert_eq!(vals.iter().filter(|v| crit.is_match(v)).count(), 1);
    }
}
