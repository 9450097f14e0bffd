//! Small JSONPath-like query DSL for browsing collections.
//!
//! Grammar, loosely:
//!
//! ```text
//! expr       := selector? projection? pipe*  |  ".length"
//! selector   := "[*]" | "[N]" | "[a:b]" | "[?" path op value "]"
//! op         := "==" | "!=" | ">=" | "<=" | ">" | "<" | "contains"
//! projection := "." path | path ("," path)*
//! pipe       := "| unique" | "| count" | "| sum" | "| avg" | "| min" | "| max"
//! ```
//!
//! Paths use the same dotted/bracket syntax as the hint store
//! (`payload.headers[From]`).

use serde_json::Value;

use super::introspect::field_value;

/// Evaluate an expression over a collection's items.
pub fn evaluate(items: &[Value], expr: &str) -> Result<Value, String> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err("empty query expression".into());
    }

    let mut parts = expr.split('|');
    let main = parts.next().unwrap_or_default().trim();
    let pipes: Vec<&str> = parts.map(str::trim).collect();

    // `.length` short-circuits: item count after any selector.
    let (selector, rest) = split_selector(main)?;
    let selected = apply_selector(items, selector)?;

    if rest.trim() == ".length" || rest.trim() == "length" {
        return Ok(Value::Number(selected.len().into()));
    }

    let projected = apply_projection(&selected, rest.trim())?;
    apply_pipes(projected, &pipes)
}

/// Split a leading `[...]` selector off the expression.
///
/// Filter paths may themselves use bracket notation
/// (`[?payload.headers[From] contains "@acme.com"]`), so the closing
/// bracket is found by depth tracking, not by the first `]`. Brackets
/// inside quoted values are ignored too.
fn split_selector(expr: &str) -> Result<(Option<&str>, &str), String> {
    if !expr.starts_with('[') {
        return Ok((None, expr));
    }
    let mut depth = 0usize;
    let mut in_string = false;
    for (i, c) in expr.char_indices() {
        match c {
            '"' => in_string = !in_string,
            '[' if !in_string => depth += 1,
            ']' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Ok((Some(&expr[1..i]), &expr[i + 1..]));
                }
            }
            _ => {}
        }
    }
    Err("unterminated selector: missing ']'".to_string())
}

fn apply_selector(items: &[Value], selector: Option<&str>) -> Result<Vec<Value>, String> {
    let Some(sel) = selector else {
        return Ok(items.to_vec());
    };
    let sel = sel.trim();

    if sel == "*" {
        return Ok(items.to_vec());
    }
    if let Some(filter) = sel.strip_prefix('?') {
        return apply_filter(items, filter);
    }
    if let Some((a, b)) = sel.split_once(':') {
        let start: usize = a.trim().parse().map_err(|_| format!("bad slice start '{a}'"))?;
        let end: usize = b.trim().parse().map_err(|_| format!("bad slice end '{b}'"))?;
        let end = end.min(items.len());
        let start = start.min(end);
        return Ok(items[start..end].to_vec());
    }
    let index: usize = sel.parse().map_err(|_| format!("bad selector '[{sel}]'"))?;
    Ok(items.get(index).cloned().into_iter().collect())
}

const OPERATORS: &[&str] = &["==", "!=", ">=", "<=", ">", "<"];

fn apply_filter(items: &[Value], filter: &str) -> Result<Vec<Value>, String> {
    // `contains` is word-ish, check it before the symbol operators so a
    // path like `headers[From] contains "x"` parses.
    let (path, op, raw_value) = if let Some(idx) = filter.find(" contains ") {
        (
            filter[..idx].trim(),
            "contains",
            filter[idx + " contains ".len()..].trim(),
        )
    } else {
        let mut found = None;
        for op in OPERATORS {
            if let Some(idx) = filter.find(op) {
                found = Some((filter[..idx].trim(), *op, filter[idx + op.len()..].trim()));
                break;
            }
        }
        found.ok_or_else(|| format!("no operator in filter '{filter}'"))?
    };

    let expected: Value = serde_json::from_str(raw_value)
        .unwrap_or_else(|_| Value::String(raw_value.trim_matches('"').to_string()));

    Ok(items
        .iter()
        .filter(|item| {
            let Some(actual) = field_value(item, path) else {
                return false;
            };
            matches_op(actual, op, &expected)
        })
        .cloned()
        .collect())
}

fn matches_op(actual: &Value, op: &str, expected: &Value) -> bool {
    match op {
        "==" => values_eq(actual, expected),
        "!=" => !values_eq(actual, expected),
        "contains" => match (actual, expected) {
            (Value::String(a), Value::String(b)) => a.contains(b.as_str()),
            (Value::Array(items), b) => items.iter().any(|i| values_eq(i, b)),
            _ => false,
        },
        ">" | "<" | ">=" | "<=" => {
            let (Some(a), Some(b)) = (as_f64(actual), as_f64(expected)) else {
                return false;
            };
            match op {
                ">" => a > b,
                "<" => a < b,
                ">=" => a >= b,
                "<=" => a <= b,
                _ => unreachable!(),
            }
        }
        _ => false,
    }
}

fn values_eq(a: &Value, b: &Value) -> bool {
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn apply_projection(items: &[Value], projection: &str) -> Result<Value, String> {
    let projection = projection.trim_start_matches('.').trim();
    if projection.is_empty() {
        return Ok(Value::Array(items.to_vec()));
    }

    let fields: Vec<&str> = projection.split(',').map(str::trim).collect();
    if fields.len() == 1 {
        let path = fields[0];
        let values: Vec<Value> = items
            .iter()
            .filter_map(|i| field_value(i, path).cloned())
            .collect();
        return Ok(Value::Array(values));
    }

    let objects: Vec<Value> = items
        .iter()
        .map(|item| {
            let mut obj = serde_json::Map::new();
            for path in &fields {
                if let Some(v) = field_value(item, path) {
                    obj.insert((*path).to_string(), v.clone());
                }
            }
            Value::Object(obj)
        })
        .collect();
    Ok(Value::Array(objects))
}

fn apply_pipes(mut value: Value, pipes: &[&str]) -> Result<Value, String> {
    for pipe in pipes {
        let items = match &value {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        };
        value = match *pipe {
            "unique" => {
                let mut seen = std::collections::HashSet::new();
                let mut out = Vec::new();
                for item in items {
                    let key = item.to_string();
                    if seen.insert(key) {
                        out.push(item);
                    }
                }
                Value::Array(out)
            }
            "count" => Value::Number(items.len().into()),
            "sum" | "avg" | "min" | "max" => {
                let nums: Vec<f64> = items.iter().filter_map(as_f64).collect();
                if nums.is_empty() {
                    Value::Null
                } else {
                    let result = match *pipe {
                        "sum" => nums.iter().sum(),
                        "avg" => nums.iter().sum::<f64>() / nums.len() as f64,
                        "min" => nums.iter().copied().fold(f64::INFINITY, f64::min),
                        "max" => nums.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                        _ => unreachable!(),
                    };
                    serde_json::Number::from_f64(result)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
            }
            other => return Err(format!("unknown pipe '{other}'")),
        };
    }
    Ok(value)
}
