use std::sync::Arc;

use formualizer_common::{ErrorKind, Value};

use crate::traits::{ArgumentHandle, EvaluationContext, Function};

pub(super) fn register(add: &mut dyn FnMut(Arc<dyn Function>)) {
    add(Arc::new(IfFn));
    add(Arc::new(IfsFn));
    add(Arc::new(AndFn));
    add(Arc::new(OrFn));
    add(Arc::new(NotFn));
    add(Arc::new(XorFn));
    add(Arc::new(TrueFn));
    add(Arc::new(FalseFn));
    add(Arc::new(IfErrorFn));
    add(Arc::new(IfNaFn));
    add(Arc::new(IsFn { name: "ISBLANK", f: |v| matches!(v, Value::Empty) }));
    add(Arc::new(IsFn { name: "ISERROR", f: |v| v.is_error() }));
    add(Arc::new(IsFn { name: "ISNA", f: |v| matches!(v, Value::Error(ErrorKind::Na)) }));
    add(Arc::new(IsFn {
        name: "ISNUMBER",
        f: |v| matches!(v, Value::Number(_) | Value::Infinity(_)),
    }));
    add(Arc::new(IsFn { name: "ISTEXT", f: |v| matches!(v, Value::String(_)) }));
    add(Arc::new(IsFn { name: "ISNONTEXT", f: |v| !matches!(v, Value::String(_)) }));
    add(Arc::new(IsFn { name: "ISLOGICAL", f: |v| matches!(v, Value::Boolean(_)) }));
}

#[derive(Debug)]
struct IfFn;
impl Function for IfFn {
    fn name(&self) -> &'static str {
        "IF"
    }
    fn min_args(&self) -> usize {
        2
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let cond = args[0].value();
        if cond.is_error() {
            return cond.into_owned();
        }
        if cond.is_truthy() {
            args[1].value().into_owned()
        } else if args.len() > 2 {
            args[2].value().into_owned()
        } else {
            Value::Boolean(false)
        }
    }
}

#[derive(Debug)]
struct IfsFn;
impl Function for IfsFn {
    fn name(&self) -> &'static str {
        "IFS"
    }
    fn min_args(&self) -> usize {
        2
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        for pair in args.chunks(2) {
            if pair.len() < 2 {
                return Value::Error(ErrorKind::Value);
            }
            let cond = pair[0].value();
            if cond.is_error() {
                return cond.into_owned();
            }
            if cond.is_truthy() {
                return pair[1].value().into_owned();
            }
        }
        Value::Error(ErrorKind::Na)
    }
}

#[derive(Debug)]
struct AndFn;
impl Function for AndFn {
    fn name(&self) -> &'static str {
        "AND"
    }
    fn min_args(&self) -> usize {
        1
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        for arg in args {
            let v = arg.value();
            if v.is_error() {
                return v.into_owned();
            }
            if !v.is_truthy() {
                return Value::Boolean(false);
            }
        }
        Value::Boolean(true)
    }
}

#[derive(Debug)]
struct OrFn;
impl Function for OrFn {
    fn name(&self) -> &'static str {
        "OR"
    }
    fn min_args(&self) -> usize {
        1
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        for arg in args {
            let v = arg.value();
            if v.is_error() {
                return v.into_owned();
            }
            if v.is_truthy() {
                return Value::Boolean(true);
            }
        }
        Value::Boolean(false)
    }
}

#[derive(Debug)]
struct NotFn;
impl Function for NotFn {
    fn name(&self) -> &'static str {
        "NOT"
    }
    fn min_args(&self) -> usize {
        1
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let v = args[0].value();
        if v.is_error() {
            return v.into_owned();
        }
        Value::Boolean(!v.is_truthy())
    }
}

#[derive(Debug)]
struct XorFn;
impl Function for XorFn {
    fn name(&self) -> &'static str {
        "XOR"
    }
    fn min_args(&self) -> usize {
        1
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let mut parity = false;
        for arg in args {
            let v = arg.value();
            if v.is_error() {
                return v.into_owned();
            }
            parity ^= v.is_truthy();
        }
        Value::Boolean(parity)
    }
}

#[derive(Debug)]
struct TrueFn;
impl Function for TrueFn {
    fn name(&self) -> &'static str {
        "TRUE"
    }
    fn eval(&self, _args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        Value::Boolean(true)
    }
}

#[derive(Debug)]
struct FalseFn;
impl Function for FalseFn {
    fn name(&self) -> &'static str {
        "FALSE"
    }
    fn eval(&self, _args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        Value::Boolean(false)
    }
}

#[derive(Debug)]
struct IfErrorFn;
impl Function for IfErrorFn {
    fn name(&self) -> &'static str {
        "IFERROR"
    }
    fn min_args(&self) -> usize {
        2
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let v = args[0].value();
        if v.is_error() {
            args[1].value().into_owned()
        } else {
            v.into_owned()
        }
    }
}

#[derive(Debug)]
struct IfNaFn;
impl Function for IfNaFn {
    fn name(&self) -> &'static str {
        "IFNA"
    }
    fn min_args(&self) -> usize {
        2
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let v = args[0].value();
        if matches!(v.as_ref(), Value::Error(ErrorKind::Na)) {
            args[1].value().into_owned()
        } else {
            v.into_owned()
        }
    }
}

#[derive(Debug)]
struct IsFn {
    name: &'static str,
    f: fn(&Value) -> bool,
}
impl Function for IsFn {
    fn name(&self) -> &'static str {
        self.name
    }
    fn min_args(&self) -> usize {
        1
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        Value::Boolean((self.f)(args[0].value().as_ref()))
    }
}
