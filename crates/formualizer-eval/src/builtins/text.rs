use std::sync::Arc;

use formualizer_common::{format_number, ErrorKind, Value};

use super::{flatten, numeric_arg, text_of};
use crate::traits::{ArgumentHandle, EvaluationContext, Function};

pub(super) fn register(add: &mut dyn FnMut(Arc<dyn Function>)) {
    add(Arc::new(ConcatenateFn { name: "CONCATENATE" }));
    add(Arc::new(ConcatenateFn { name: "CONCAT" }));
    add(Arc::new(LenFn));
    add(Arc::new(CaseFn { name: "UPPER", f: |s| s.to_uppercase() }));
    add(Arc::new(CaseFn { name: "LOWER", f: |s| s.to_lowercase() }));
    add(Arc::new(TrimFn));
    add(Arc::new(LeftFn));
    add(Arc::new(RightFn));
    add(Arc::new(MidFn));
    add(Arc::new(FindSearchFn { name: "FIND", case_sensitive: true }));
    add(Arc::new(FindSearchFn { name: "SEARCH", case_sensitive: false }));
    add(Arc::new(SubstituteFn));
    add(Arc::new(ReplaceFn));
    add(Arc::new(ExactFn));
    add(Arc::new(TextFn));
}

#[derive(Debug)]
struct ConcatenateFn {
    name: &'static str,
}
impl Function for ConcatenateFn {
    fn name(&self) -> &'static str {
        self.name
    }
    fn min_args(&self) -> usize {
        1
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let mut out = String::new();
        for arg in args {
            for v in flatten(arg.value_or_range()) {
                if v.is_error() {
                    return v;
                }
                out.push_str(&text_of(&v));
            }
        }
        Value::String(out)
    }
}

#[derive(Debug)]
struct LenFn;
impl Function for LenFn {
    fn name(&self) -> &'static str {
        "LEN"
    }
    fn min_args(&self) -> usize {
        1
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let v = args[0].value();
        if v.is_error() {
            return v.into_owned();
        }
        Value::Number(text_of(&v).chars().count() as f64)
    }
}

#[derive(Debug)]
struct CaseFn {
    name: &'static str,
    f: fn(&str) -> String,
}
impl Function for CaseFn {
    fn name(&self) -> &'static str {
        self.name
    }
    fn min_args(&self) -> usize {
        1
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let v = args[0].value();
        if v.is_error() {
            return v.into_owned();
        }
        Value::String((self.f)(&text_of(&v)))
    }
}

#[derive(Debug)]
struct TrimFn;
impl Function for TrimFn {
    fn name(&self) -> &'static str {
        "TRIM"
    }
    fn min_args(&self) -> usize {
        1
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let v = args[0].value();
        if v.is_error() {
            return v.into_owned();
        }
        let collapsed = text_of(&v).split_whitespace().collect::<Vec<_>>().join(" ");
        Value::String(collapsed)
    }
}

#[derive(Debug)]
struct LeftFn;
impl Function for LeftFn {
    fn name(&self) -> &'static str {
        "LEFT"
    }
    fn min_args(&self) -> usize {
        1
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let text: Vec<char> = text_of(args[0].value().as_ref()).chars().collect();
        let n = match take_count(args, 1) {
            Ok(n) => n,
            Err(e) => return Value::Error(e),
        };
        Value::String(text.into_iter().take(n).collect())
    }
}

#[derive(Debug)]
struct RightFn;
impl Function for RightFn {
    fn name(&self) -> &'static str {
        "RIGHT"
    }
    fn min_args(&self) -> usize {
        1
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let text: Vec<char> = text_of(args[0].value().as_ref()).chars().collect();
        let n = match take_count(args, 1) {
            Ok(n) => n,
            Err(e) => return Value::Error(e),
        };
        let start = text.len().saturating_sub(n);
        Value::String(text[start..].iter().collect())
    }
}

fn take_count(args: &[ArgumentHandle], idx: usize) -> Result<usize, ErrorKind> {
    if args.len() > idx {
        let n = numeric_arg(args[idx].value().as_ref())?;
        if n < 0.0 {
            Err(ErrorKind::Value)
        } else {
            Ok(n as usize)
        }
    } else {
        Ok(1)
    }
}

#[derive(Debug)]
struct MidFn;
impl Function for MidFn {
    fn name(&self) -> &'static str {
        "MID"
    }
    fn min_args(&self) -> usize {
        3
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let text: Vec<char> = text_of(args[0].value().as_ref()).chars().collect();
        let start = match numeric_arg(args[1].value().as_ref()) {
            Ok(n) if n >= 1.0 => n as usize - 1,
            Ok(_) => return Value::Error(ErrorKind::Value),
            Err(e) => return Value::Error(e),
        };
        let len = match numeric_arg(args[2].value().as_ref()) {
            Ok(n) if n >= 0.0 => n as usize,
            Ok(_) => return Value::Error(ErrorKind::Value),
            Err(e) => return Value::Error(e),
        };
        if start >= text.len() {
            return Value::String(String::new());
        }
        let end = (start + len).min(text.len());
        Value::String(text[start..end].iter().collect())
    }
}

#[derive(Debug)]
struct FindSearchFn {
    name: &'static str,
    case_sensitive: bool,
}
impl Function for FindSearchFn {
    fn name(&self) -> &'static str {
        self.name
    }
    fn min_args(&self) -> usize {
        2
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let needle = text_of(args[0].value().as_ref());
        let haystack = text_of(args[1].value().as_ref());
        let start = if args.len() > 2 {
            match numeric_arg(args[2].value().as_ref()) {
                Ok(n) if n >= 1.0 => n as usize - 1,
                _ => return Value::Error(ErrorKind::Value),
            }
        } else {
            0
        };
        let hay_chars: Vec<char> = haystack.chars().collect();
        if start > hay_chars.len() {
            return Value::Error(ErrorKind::Value);
        }
        let rest: String = hay_chars[start..].iter().collect();
        let (rest_cmp, needle_cmp) = if self.case_sensitive {
            (rest.clone(), needle.clone())
        } else {
            (rest.to_lowercase(), needle.to_lowercase())
        };
        match rest_cmp.find(&needle_cmp) {
            Some(byte_idx) => {
                let char_idx = rest_cmp[..byte_idx].chars().count();
                Value::Number((start + char_idx + 1) as f64)
            }
            None => Value::Error(ErrorKind::Value),
        }
    }
}

#[derive(Debug)]
struct SubstituteFn;
impl Function for SubstituteFn {
    fn name(&self) -> &'static str {
        "SUBSTITUTE"
    }
    fn min_args(&self) -> usize {
        3
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let text = text_of(args[0].value().as_ref());
        let old = text_of(args[1].value().as_ref());
        let new = text_of(args[2].value().as_ref());
        if old.is_empty() {
            return Value::String(text);
        }
        if args.len() > 3 {
            let instance = match numeric_arg(args[3].value().as_ref()) {
                Ok(n) if n >= 1.0 => n as usize,
                _ => return Value::Error(ErrorKind::Value),
            };
            let mut count = 0;
            let mut out = String::new();
            let mut rest = text.as_str();
            while let Some(pos) = rest.find(&old) {
                count += 1;
                if count == instance {
                    out.push_str(&rest[..pos]);
                    out.push_str(&new);
                    out.push_str(&rest[pos + old.len()..]);
                    return Value::String(out);
                }
                out.push_str(&rest[..pos + old.len()]);
                rest = &rest[pos + old.len()..];
            }
            out.push_str(rest);
            Value::String(out)
        } else {
            Value::String(text.replace(&old, &new))
        }
    }
}

#[derive(Debug)]
struct ReplaceFn;
impl Function for ReplaceFn {
    fn name(&self) -> &'static str {
        "REPLACE"
    }
    fn min_args(&self) -> usize {
        4
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let text: Vec<char> = text_of(args[0].value().as_ref()).chars().collect();
        let start = match numeric_arg(args[1].value().as_ref()) {
            Ok(n) if n >= 1.0 => (n as usize - 1).min(text.len()),
            _ => return Value::Error(ErrorKind::Value),
        };
        let len = match numeric_arg(args[2].value().as_ref()) {
            Ok(n) if n >= 0.0 => n as usize,
            _ => return Value::Error(ErrorKind::Value),
        };
        let new_text = text_of(args[3].value().as_ref());
        let end = (start + len).min(text.len());
        let mut out: String = text[..start].iter().collect();
        out.push_str(&new_text);
        out.push_str(&text[end..].iter().collect::<String>());
        Value::String(out)
    }
}

#[derive(Debug)]
struct ExactFn;
impl Function for ExactFn {
    fn name(&self) -> &'static str {
        "EXACT"
    }
    fn min_args(&self) -> usize {
        2
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        Value::Boolean(
            text_of(args[0].value().as_ref()) == text_of(args[1].value().as_ref()),
        )
    }
}

#[derive(Debug)]
struct TextFn;
impl Function for TextFn {
    fn name(&self) -> &'static str {
        "TEXT"
    }
    fn min_args(&self) -> usize {
        1
    }
    fn eval(&self, args: &[ArgumentHandle], _ctx: &dyn EvaluationContext) -> Value {
        let v = args[0].value();
        if v.is_error() {
            return v.into_owned();
        }
        // Format-code interpretation beyond plain numeric rendering is
        // intentionally not implemented; the format argument is accepted
        // but only the default numeric rendering is produced.
        Value::String(match v.as_ref() {
            Value::Number(n) => format_number(*n),
            other => text_of(other),
        })
    }
}
