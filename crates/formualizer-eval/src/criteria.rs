//! Criteria parsing for the `*IF`/`*IFS` family (§4.4): a criteria argument
//! compiles once into an exact match, a comparison, or a wildcard pattern,
//! then is applied per cell without re-parsing.

use formualizer_common::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
pub enum Criteria {
    Exact(Value),
    Comparison(CompareOp, f64),
    Wildcard(WildcardPattern),
}

/// A compiled `*`/`?` glob, anchored at both ends (`*` = any run, `?` = any
/// single character, everything else matched literally).
#[derive(Debug, Clone)]
pub struct WildcardPattern {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    AnyChar,
    AnyRun,
}

impl WildcardPattern {
    fn compile(raw: &str) -> Self {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = raw.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '~' if matches!(chars.peek(), Some('*') | Some('?') | Some('~')) => {
                    literal.push(chars.next().unwrap());
                }
                '*' => {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::AnyRun);
                }
                '?' => {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::AnyChar);
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Self { segments }
    }

    pub fn is_match(&self, text: &str) -> bool {
        let chars: Vec<char> = text.to_ascii_lowercase().chars().collect();
        Self::match_from(&self.segments, &chars)
    }

    fn match_from(segs: &[Segment], input: &[char]) -> bool {
        match segs.first() {
            None => input.is_empty(),
            Some(Segment::Literal(lit)) => {
                let lit_lower: Vec<char> = lit.to_ascii_lowercase().chars().collect();
                input.len() >= lit_lower.len()
                    && input[..lit_lower.len()] == lit_lower[..]
                    && Self::match_from(&segs[1..], &input[lit_lower.len()..])
            }
            Some(Segment::AnyChar) => {
                !input.is_empty() && Self::match_from(&segs[1..], &input[1..])
            }
            Some(Segment::AnyRun) => {
                for split in 0..=input.len() {
                    if Self::match_from(&segs[1..], &input[split..]) {
                        return true;
                    }
                }
                false
            }
        }
    }
}

impl Criteria {
    pub fn parse(raw: &Value) -> Self {
        let text = match raw {
            Value::String(s) => s.clone(),
            Value::Number(n) => return Criteria::Exact(Value::Number(*n)),
            Value::Boolean(b) => return Criteria::Exact(Value::Boolean(*b)),
            Value::Empty => return Criteria::Exact(Value::Empty),
            other => return Criteria::Exact(other.clone()),
        };

        for (tag, op) in [
            (">=", CompareOp::Ge),
            ("<=", CompareOp::Le),
            ("<>", CompareOp::Ne),
            (">", CompareOp::Gt),
            ("<", CompareOp::Lt),
            ("=", CompareOp::Eq),
        ] {
            if let Some(rest) = text.strip_prefix(tag) {
                if let Ok(n) = rest.trim().parse::<f64>() {
                    return Criteria::Comparison(op, n);
                }
            }
        }

        if text.contains('*') || text.contains('?') {
            return Criteria::Wildcard(WildcardPattern::compile(&text));
        }

        if let Ok(n) = text.trim().parse::<f64>() {
            return Criteria::Exact(Value::Number(n));
        }

        Criteria::Exact(Value::String(text))
    }

    /// Type matching is strict: a numeric criterion never matches a numeric
    /// string, and vice versa (§4.4).
    pub fn is_match(&self, cell: &Value) -> bool {
        match self {
            Criteria::Exact(Value::Empty) => matches!(cell, Value::Empty),
            Criteria::Exact(Value::Number(n)) => matches!(cell, Value::Number(c) if c == n),
            Criteria::Exact(Value::Boolean(b)) => matches!(cell, Value::Boolean(c) if c == b),
            Criteria::Exact(Value::String(s)) => {
                matches!(cell, Value::String(c) if c.eq_ignore_ascii_case(s))
            }
            Criteria::Exact(other) => cell == other,
            Criteria::Comparison(op, n) => match cell {
                Value::Number(c) => compare_f64(*op, *c, *n),
                _ => false,
            },
            Criteria::Wildcard(pattern) => match cell {
                Value::String(s) => pattern.is_match(s),
                _ => false,
            },
        }
    }
}

fn compare_f64(op: CompareOp, a: f64, b: f64) -> bool {
    match op {
        CompareOp::Eq => a == b,
        CompareOp::Ne => a != b,
        CompareOp::Lt => a < b,
        CompareOp::Le => a <= b,
        CompareOp::Gt => a > b,
        CompareOp::Ge => a >= b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_criterion_does_not_match_numeric_string() {
        let c = Criteria::parse(&Value::Number(5.0));
        assert!(!c.is_match(&Value::String("5".into())));
        assert!(c.is_match(&Value::Number(5.0)));
    }

    #[test]
    fn comparison_prefix_parses_operator_and_operand() {
        let c = Criteria::parse(&Value::String(">=10".into()));
        assert!(c.is_match(&Value::Number(10.0)));
        assert!(!c.is_match(&Value::Number(9.0)));
    }

    #[test]
    fn wildcard_star_matches_any_run() {
        let c = Criteria::parse(&Value::String("a*z".into()));
        assert!(c.is_match(&Value::String("abcz".into())));
        assert!(!c.is_match(&Value::String("abcy".into())));
    }

    #[test]
    fn wildcard_question_mark_matches_single_char() {
        let c = Criteria::parse(&Value::String("a?c".into()));
        assert!(c.is_match(&Value::String("abc".into())));
        assert!(!c.is_match(&Value::String("abbc".into())));
    }

    #[test]
    fn tilde_escapes_wildcard_metacharacters() {
        let c = Criteria::parse(&Value::String("50~%".into()));
        assert!(c.is_match(&Value::String("50%".into())));
    }
}
