use std::sync::Arc;

use formualizer_common::{ErrorKind, Value};

use super::{first_error, flatten, numeric_arg};
use crate::traits::{ArgumentHandle, EvaluationContext, Function};

pub(super) fn register(add: &mut dyn FnMut(Arc<dyn Function>)) {
    add(Arc::new(SumFn));
    add(Arc::new(ProductFn));
    add(Arc::new(ModFn));
    add(Arc::new(PowerFn));
    add(Arc::new(AbsFn));
    add(Arc::new(SignFn));
    add(Arc::new(SqrtFn));
    add(Arc::new(ExpFn));
    add(Arc::new(LnFn));
    add(Arc::new(LogFn));
    add(Arc::new(Log10Fn));
    add(Arc::new(RoundFn { mode: RoundMode::Nearest }));
    add(Arc::new(RoundFn { mode: RoundMode::Up }));
    add(Arc::new(RoundFn { mode: RoundMode::Down }));
    add(Arc::new(CeilingFn));
    add(Arc::new(FloorFn));
    add(Arc::new(IntFn));
    add(Arc::new(TruncFn));
    add(Arc::new(EvenFn));
    add(Arc::new(OddFn));
    add(Arc::new(FactFn));
    add(Arc::new(DecimalFn));
}

fn scalar_args(args: &[ArgumentHandle]) -> Result<Vec<f64>, ErrorKind> {
    args.iter().map(|a| numeric_arg(a.value().as_ref())).collect()
}

#[derive(Debug)]
struct SumFn;
impl Function for SumFn {
    fn name(&self) -> &'static str {
        "SUM"
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let mut total = 0.0;
        for arg in args {
            let values = flatten(arg.value_or_range());
            if let Some(e) = first_error(&values) {
                return Value::Error(e);
            }
            for v in &values {
                if let Some(n) = super::numeric_or_skip(v) {
                    match n {
                        Ok(n) => total += n,
                        Err(e) => return Value::Error(e),
                    }
                }
            }
        }
        Value::number(total)
    }
}

#[derive(Debug)]
struct ProductFn;
impl Function for ProductFn {
    fn name(&self) -> &'static str {
        "PRODUCT"
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let mut acc = 1.0;
        let mut seen = false;
        for arg in args {
            let values = flatten(arg.value_or_range());
            if let Some(e) = first_error(&values) {
                return Value::Error(e);
            }
            for v in &values {
                if let Some(n) = super::numeric_or_skip(v) {
                    match n {
                        Ok(n) => {
                            acc *= n;
                            seen = true;
                        }
                        Err(e) => return Value::Error(e),
                    }
                }
            }
        }
        Value::number(if seen { acc } else { 0.0 })
    }
}

#[derive(Debug)]
struct ModFn;
impl Function for ModFn {
    fn name(&self) -> &'static str {
        "MOD"
    }
    fn min_args(&self) -> usize {
        2
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        match scalar_args(args).as_deref() {
            Ok([n, d]) => {
                if *d == 0.0 {
                    Value::Error(ErrorKind::Div0)
                } else {
                    Value::number(n - d * (n / d).floor())
                }
            }
            Ok(_) => Value::Error(ErrorKind::Value),
            Err(e) => Value::Error(*e),
        }
    }
}

#[derive(Debug)]
struct PowerFn;
impl Function for PowerFn {
    fn name(&self) -> &'static str {
        "POWER"
    }
    fn min_args(&self) -> usize {
        2
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        match scalar_args(args).as_deref() {
            Ok([a, b]) => {
                if *a < 0.0 && b.fract() != 0.0 {
                    Value::Error(ErrorKind::Num)
                } else {
                    Value::number(a.powf(*b))
                }
            }
            Ok(_) => Value::Error(ErrorKind::Value),
            Err(e) => Value::Error(*e),
        }
    }
}

macro_rules! unary_math_fn {
    ($struct_name:ident, $excel_name:literal, $f:expr) => {
        #[derive(Debug)]
        struct $struct_name;
        impl Function for $struct_name {
            fn name(&self) -> &'static str {
                $excel_name
            }
            fn min_args(&self) -> usize {
                1
            }
            fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
                match numeric_arg(args[0].value().as_ref()) {
                    Ok(n) => {
                        let f: fn(f64) -> f64 = $f;
                        Value::number(f(n))
                    }
                    Err(e) => Value::Error(e),
                }
            }
        }
    };
}

unary_math_fn!(AbsFn, "ABS", f64::abs);
unary_math_fn!(SqrtFn, "SQRT", |n| if n < 0.0 { f64::NAN } else { n.sqrt() });
unary_math_fn!(ExpFn, "EXP", f64::exp);
unary_math_fn!(LnFn, "LN", |n| if n <= 0.0 { f64::NAN } else { n.ln() });
unary_math_fn!(Log10Fn, "LOG10", |n| if n <= 0.0 { f64::NAN } else { n.log10() });
unary_math_fn!(IntFn, "INT", f64::floor);
unary_math_fn!(EvenFn, "EVEN", |n| round_away_from_zero_to_multiple(n, 2.0));
unary_math_fn!(OddFn, "ODD", |n| round_away_from_zero_to_multiple(n, 1.0).max(n.signum()));

fn round_away_from_zero_to_multiple(n: f64, m: f64) -> f64 {
    let sign = if n < 0.0 { -1.0 } else { 1.0 };
    sign * (n.abs() / m).ceil() * m
}

#[derive(Debug)]
struct SignFn;
impl Function for SignFn {
    fn name(&self) -> &'static str {
        "SIGN"
    }
    fn min_args(&self) -> usize {
        1
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        match numeric_arg(args[0].value().as_ref()) {
            Ok(n) => Value::number(if n > 0.0 {
                1.0
            } else if n < 0.0 {
                -1.0
            } else {
                0.0
            }),
            Err(e) => Value::Error(e),
        }
    }
}

#[derive(Debug)]
struct LogFn;
impl Function for LogFn {
    fn name(&self) -> &'static str {
        "LOG"
    }
    fn min_args(&self) -> usize {
        1
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let n = match numeric_arg(args[0].value().as_ref()) {
            Ok(n) => n,
            Err(e) => return Value::Error(e),
        };
        let base = if args.len() > 1 {
            match numeric_arg(args[1].value().as_ref()) {
                Ok(b) => b,
                Err(e) => return Value::Error(e),
            }
        } else {
            10.0
        };
        if n <= 0.0 || base <= 0.0 || base == 1.0 {
            Value::Error(ErrorKind::Num)
        } else {
            Value::number(n.log(base))
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum RoundMode {
    Nearest,
    Up,
    Down,
}

#[derive(Debug)]
struct RoundFn {
    mode: RoundMode,
}
impl Function for RoundFn {
    fn name(&self) -> &'static str {
        match self.mode {
            RoundMode::Nearest => "ROUND",
            RoundMode::Up => "ROUNDUP",
            RoundMode::Down => "ROUNDDOWN",
        }
    }
    fn min_args(&self) -> usize {
        2
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let n = match numeric_arg(args[0].value().as_ref()) {
            Ok(n) => n,
            Err(e) => return Value::Error(e),
        };
        let digits = match numeric_arg(args[1].value().as_ref()) {
            Ok(d) => d as i32,
            Err(e) => return Value::Error(e),
        };
        let scale = 10f64.powi(digits);
        let scaled = n * scale;
        let rounded = match self.mode {
            RoundMode::Nearest => {
                if scaled >= 0.0 {
                    (scaled + 0.5).floor()
                } else {
                    (scaled - 0.5).ceil()
                }
            }
            RoundMode::Up => {
                if scaled >= 0.0 {
                    scaled.ceil()
                } else {
                    scaled.floor()
                }
            }
            RoundMode::Down => {
                if scaled >= 0.0 {
                    scaled.floor()
                } else {
                    scaled.ceil()
                }
            }
        };
        Value::number(rounded / scale)
    }
}

#[derive(Debug)]
struct CeilingFn;
impl Function for CeilingFn {
    fn name(&self) -> &'static str {
        "CEILING"
    }
    fn min_args(&self) -> usize {
        2
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        multiple_round(args, |r| r.ceil())
    }
}

#[derive(Debug)]
struct FloorFn;
impl Function for FloorFn {
    fn name(&self) -> &'static str {
        "FLOOR"
    }
    fn min_args(&self) -> usize {
        2
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        multiple_round(args, |r| r.floor())
    }
}

fn multiple_round(args: &[ArgumentHandle], round: fn(f64) -> f64) -> Value {
    let n = match numeric_arg(args[0].value().as_ref()) {
        Ok(n) => n,
        Err(e) => return Value::Error(e),
    };
    let sig = match numeric_arg(args[1].value().as_ref()) {
        Ok(s) => s,
        Err(e) => return Value::Error(e),
    };
    if sig == 0.0 {
        return if n == 0.0 { Value::number(0.0) } else { Value::Error(ErrorKind::Div0) };
    }
    Value::number(round(n / sig) * sig)
}

#[derive(Debug)]
struct TruncFn;
impl Function for TruncFn {
    fn name(&self) -> &'static str {
        "TRUNC"
    }
    fn min_args(&self) -> usize {
        1
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let n = match numeric_arg(args[0].value().as_ref()) {
            Ok(n) => n,
            Err(e) => return Value::Error(e),
        };
        let digits = if args.len() > 1 {
            match numeric_arg(args[1].value().as_ref()) {
                Ok(d) => d as i32,
                Err(e) => return Value::Error(e),
            }
        } else {
            0
        };
        let scale = 10f64.powi(digits);
        Value::number((n * scale).trunc() / scale)
    }
}

#[derive(Debug)]
struct FactFn;
impl Function for FactFn {
    fn name(&self) -> &'static str {
        "FACT"
    }
    fn min_args(&self) -> usize {
        1
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let n = match numeric_arg(args[0].value().as_ref()) {
            Ok(n) => n,
            Err(e) => return Value::Error(e),
        };
        if n < 0.0 {
            return Value::Error(ErrorKind::Num);
        }
        let mut acc = 1.0;
        let mut i = 2u64;
        while (i as f64) <= n.floor() {
            acc *= i as f64;
            i += 1;
        }
        Value::number(acc)
    }
}

#[derive(Debug)]
struct DecimalFn;
impl Function for DecimalFn {
    fn name(&self) -> &'static str {
        "DECIMAL"
    }
    fn min_args(&self) -> usize {
        2
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let text = super::text_of(args[0].value().as_ref());
        let radix = match numeric_arg(args[1].value().as_ref()) {
            Ok(r) => r as u32,
            Err(e) => return Value::Error(e),
        };
        match i64::from_str_radix(text.trim(), radix) {
            Ok(n) => Value::number(n as f64),
            Err(_) => Value::Error(ErrorKind::Num),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use formualizer_common::CellAddress;
    use formualizer_parse::parser::ASTNode;

    fn lit(v: Value) -> ASTNode {
        ASTNode::new(formualizer_parse::parser::ASTNodeType::Literal(v), None)
    }

    struct NoopCtx(CellAddress);
    impl crate::traits::Resolver for NoopCtx {
        fn resolve_cell(&self, _: &CellAddress) -> Value {
            Value::Empty
        }
        fn resolve_range(
            &self,
            _: &formualizer_common::Range,
        ) -> Result<Box<dyn crate::traits::Range>, formualizer_common::CalcError> {
            Err(formualizer_common::CalcError::new(ErrorKind::Ref))
        }
        fn resolve_named_expression(
            &self,
            _: Option<&str>,
            _: Option<&str>,
            _: &str,
        ) -> Result<crate::traits::Resolved, formualizer_common::CalcError> {
            Err(formualizer_common::CalcError::new(ErrorKind::Name))
        }
        fn resolve_table(
            &self,
            _: &formualizer_parse::parser::TableReference,
        ) -> Result<Box<dyn crate::traits::Table>, formualizer_common::CalcError> {
            Err(formualizer_common::CalcError::new(ErrorKind::Ref))
        }
        fn resolve_any(
            &self,
            _: &formualizer_parse::parser::ReferenceType,
            _: &CellAddress,
        ) -> Result<crate::traits::Resolved, formualizer_common::CalcError> {
            Err(formualizer_common::CalcError::new(ErrorKind::Ref))
        }
    }
    impl crate::traits::FunctionProvider for NoopCtx {
        fn get_function(&self, name: &str) -> Option<Arc<dyn Function>> {
            super::super::get(name)
        }
    }
    impl crate::traits::EvaluationContext for NoopCtx {
        fn current_cell(&self) -> &CellAddress {
            &self.0
        }
        fn record_dependency(&self, _: String) {}
        fn record_frontier_dependency(&self, _: String) {}
    }

    fn eval(f: &dyn Function, vals: Vec<Value>) -> Value {
        let ctx = NoopCtx(CellAddress::new("wb", "Sheet1", 0, 0));
        let interp = crate::interpreter::Interpreter::new(&ctx);
        let nodes: Vec<ASTNode> = vals.into_iter().map(lit).collect();
        let handles: Vec<ArgumentHandle> =
            nodes.iter().map(|n| ArgumentHandle::new(n, &interp)).collect();
        f.eval(&handles, &ctx)
    }

    #[test]
    fn sum_ignores_text_and_propagates_errors() {
        assert_eq!(
            eval(&SumFn, vec![Value::Number(1.0), Value::String("x".into()), Value::Number(2.0)]),
            Value::Number(3.0)
        );
        assert_eq!(
            eval(&SumFn, vec![Value::Number(1.0), Value::Error(ErrorKind::Ref)]),
            Value::Error(ErrorKind::Ref)
        );
    }

    #[test]
    fn mod_by_zero_is_div0() {
        assert_eq!(
            eval(&ModFn, vec![Value::Number(5.0), Value::Number(0.0)]),
            Value::Error(ErrorKind::Div0)
        );
    }

    #[test]
    fn round_half_up_matches_excel_rounding() {
        assert_eq!(
            eval(&RoundFn { mode: RoundMode::Nearest }, vec![Value::Number(2.5), Value::Number(0.0)]),
            Value::Number(3.0)
        );
    }

    #[test]
    fn power_negative_base_fractional_exponent_is_num_error() {
        assert_eq!(
            eval(&PowerFn, vec![Value::Number(-8.0), Value::Number(0.5)]),
            Value::Error(ErrorKind::Num)
        );
    }
}
