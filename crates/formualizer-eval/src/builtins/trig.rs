use std::sync::Arc;

use formualizer_common::Value;

use super::numeric_arg;
use crate::traits::{ArgumentHandle, EvaluationContext, Function};

pub(super) fn register(add: &mut dyn FnMut(Arc<dyn Function>)) {
    add(Arc::new(UnaryTrigFn { name: "SIN", f: f64::sin }));
    add(Arc::new(UnaryTrigFn { name: "COS", f: f64::cos }));
    add(Arc::new(UnaryTrigFn { name: "TAN", f: f64::tan }));
    add(Arc::new(UnaryTrigFn { name: "ASIN", f: f64::asin }));
    add(Arc::new(UnaryTrigFn { name: "ACOS", f: f64::acos }));
    add(Arc::new(UnaryTrigFn { name: "ATAN", f: f64::atan }));
    add(Arc::new(UnaryTrigFn { name: "DEGREES", f: f64::to_degrees }));
    add(Arc::new(UnaryTrigFn { name: "RADIANS", f: f64::to_radians }));
    add(Arc::new(Atan2Fn));
    add(Arc::new(PiFn));
}

#[derive(Debug)]
struct UnaryTrigFn {
    name: &'static str,
    f: fn(f64) -> f64,
}
impl Function for UnaryTrigFn {
    fn name(&self) -> &'static str {
        self.name
    }
    fn min_args(&self) -> usize {
        1
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        match numeric_arg(args[0].value().as_ref()) {
            Ok(n) => Value::number((self.f)(n)),
            Err(e) => Value::Error(e),
        }
    }
}

#[derive(Debug)]
struct Atan2Fn;
impl Function for Atan2Fn {
    fn name(&self) -> &'static str {
        "ATAN2"
    }
    fn min_args(&self) -> usize {
        2
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let x = match numeric_arg(args[0].value().as_ref()) {
            Ok(n) => n,
            Err(e) => return Value::Error(e),
        };
        let y = match numeric_arg(args[1].value().as_ref()) {
            Ok(n) => n,
            Err(e) => return Value::Error(e),
        };
        Value::number(y.atan2(x))
    }
}

#[derive(Debug)]
struct PiFn;
impl Function for PiFn {
    fn name(&self) -> &'static str {
        "PI"
    }
    fn eval(&self, _args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        Value::Number(std::f64::consts::PI)
    }
}
