//! Pass/fail expressions evaluated over a probe's result variables.
//!
//! The built-in engine understands comparisons joined by `&&` and `||`
//! (`&&` binds tighter), e.g. `rtt < 500 && code == 200 || mode == "lenient"`.
//! Operands are variable names, numbers, quoted strings, `true` or `false`.

use super::types::{ResultMap, ResultValue};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScriptError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("unknown variable: {0}")]
    UnknownVariable(String),

    #[error("cannot compare {0} with {1}")]
    TypeMismatch(String, String),
}

/// Evaluates a user expression against the result variables of one dispatch
pub trait ScriptEngine: Send + Sync {
    fn evaluate(&self, script: &str, variables: &ResultMap) -> Result<bool, ScriptError>;
}

/// Small comparison-expression engine
#[derive(Debug, Default, Clone, Copy)]
pub struct ExprEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

const OPERATORS: [(&str, Op); 6] =
    [("==", Op::Eq), ("!=", Op::Ne), ("<=", Op::Le), (">=", Op::Ge), ("<", Op::Lt), (">", Op::Gt)];

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Number(f64),
    Text(String),
    Bool(bool),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Text(_) => "string",
            Value::Bool(_) => "bool",
        }
    }
}

impl ScriptEngine for ExprEngine {
    fn evaluate(&self, script: &str, variables: &ResultMap) -> Result<bool, ScriptError> {
        let script = script.trim();
        if script.is_empty() {
            return Err(ScriptError::Syntax("empty expression".into()));
        }
        // Short-circuiting would hide unknown variables in later clauses, so
        // every clause is evaluated.
        let mut any = false;
        for disjunct in split_unquoted(script, "||") {
            let mut all = true;
            for clause in split_unquoted(disjunct, "&&") {
                all &= eval_clause(clause.trim(), variables)?;
            }
            any |= all;
        }
        Ok(any)
    }
}

fn eval_clause(clause: &str, variables: &ResultMap) -> Result<bool, ScriptError> {
    if clause.is_empty() {
        return Err(ScriptError::Syntax("empty clause".into()));
    }
    let Some((idx, token, op)) = find_operator(clause) else {
        // A bare operand is truthy when it is `true` or a non-zero number.
        return match operand(clause, variables)? {
            Value::Bool(b) => Ok(b),
            Value::Number(n) => Ok(n != 0.0),
            Value::Text(s) => Err(ScriptError::TypeMismatch(s, "bool".into())),
        };
    };
    let lhs = operand(clause[..idx].trim(), variables)?;
    let rhs = operand(clause[idx + token.len()..].trim(), variables)?;
    compare(&lhs, op, &rhs)
}

/// Split on `sep` wherever it appears outside of a quoted string.
fn split_unquoted<'a>(text: &'a str, sep: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut in_quote = false;
    let mut start = 0;
    let mut chars = text.char_indices();
    while let Some((idx, ch)) = chars.next() {
        if ch == '"' {
            in_quote = !in_quote;
        } else if !in_quote && text[idx..].starts_with(sep) {
            parts.push(&text[start..idx]);
            start = idx + sep.len();
            // Separators are ASCII; skip the rest of this one.
            for _ in 1..sep.len() {
                chars.next();
            }
        }
    }
    parts.push(&text[start..]);
    parts
}

/// First comparison operator outside of a quoted string.
fn find_operator(clause: &str) -> Option<(usize, &'static str, Op)> {
    let mut in_quote = false;
    for (idx, ch) in clause.char_indices() {
        if ch == '"' {
            in_quote = !in_quote;
            continue;
        }
        if in_quote {
            continue;
        }
        for (token, op) in OPERATORS {
            if clause[idx..].starts_with(token) {
                return Some((idx, token, op));
            }
        }
    }
    None
}

fn operand(raw: &str, variables: &ResultMap) -> Result<Value, ScriptError> {
    if raw.is_empty() {
        return Err(ScriptError::Syntax("missing operand".into()));
    }
    if let Some(inner) = raw.strip_prefix('"') {
        return inner
            .strip_suffix('"')
            .map(|s| Value::Text(s.to_string()))
            .ok_or_else(|| ScriptError::Syntax(format!("unterminated string: {raw}")));
    }
    match raw {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        _ => {}
    }
    if let Ok(n) = raw.parse::<f64>() {
        return Ok(Value::Number(n));
    }
    if !raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.') {
        return Err(ScriptError::Syntax(format!("invalid operand: {raw}")));
    }
    match variables.get(raw) {
        Some(ResultValue::Number(n)) => Ok(Value::Number(*n)),
        Some(ResultValue::Text(s)) => Ok(Value::Text(s.clone())),
        None => Err(ScriptError::UnknownVariable(raw.to_string())),
    }
}

fn compare(lhs: &Value, op: Op, rhs: &Value) -> Result<bool, ScriptError> {
    let ordering = match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
        (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
        // Numeric text stored by probes compares against number literals.
        (Value::Text(a), Value::Number(b)) => a.trim().parse::<f64>().ok().and_then(|a| a.partial_cmp(b)),
        (Value::Number(a), Value::Text(b)) => b.trim().parse::<f64>().ok().and_then(|b| a.partial_cmp(&b)),
        (Value::Bool(a), Value::Bool(b)) if matches!(op, Op::Eq | Op::Ne) => Some(a.cmp(b)),
        _ => None,
    }
    .ok_or_else(|| ScriptError::TypeMismatch(lhs.kind().into(), rhs.kind().into()))?;

    Ok(match op {
        Op::Eq => ordering.is_eq(),
        Op::Ne => ordering.is_ne(),
        Op::Lt => ordering.is_lt(),
        Op::Le => ordering.is_le(),
        Op::Gt => ordering.is_gt(),
        Op::Ge => ordering.is_ge(),
    })
}
