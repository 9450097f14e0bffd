//! Deterministic structure introspection for oversized tool results.
//!
//! No LLM involved: parse the raw text as JSON (finding the first
//! non-empty array), CSV, or plain lines; sample a few items; classify
//! fields by serialized size into summary vs noise; and promote small
//! useful sub-values out of noise fields (`payload.headers[From]`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How the raw text was interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
    Json,
    Csv,
    Lines,
}

/// Cached structural record for one tool's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputHints {
    pub shape: ShapeKind,
    /// Object-field path from the JSON root to the item array.
    /// Empty when the root itself is the array (or for CSV/lines).
    pub array_path: Vec<String>,
    /// Field paths rendered in overview tables. Bracket notation reaches
    /// into promoted map keys: `payload.headers[From]`.
    pub summary_fields: Vec<String>,
    /// Oversized fields omitted from tables; listed when a `result.get`
    /// has to truncate.
    pub noise_fields: Vec<String>,
    /// Average serialized item size over the sample, bytes.
    pub est_item_size: usize,
    pub verified_at: DateTime<Utc>,
}

/// Items to sample when classifying fields.
const SAMPLE_SIZE: usize = 3;
/// Object-field depth searched for the first non-empty array.
const MAX_ARRAY_DEPTH: usize = 3;
/// Fields serialized under this are summary.
const SUMMARY_MAX: usize = 500;
/// Scalars over SUMMARY_MAX are noise; containers over this are noise.
const CONTAINER_NOISE_MIN: usize = 1000;
/// Promoted sub-strings must be shorter than this.
const PROMOTE_MAX_STR: usize = 200;
/// Ceiling on promoted fields so tables stay readable.
const MAX_PROMOTED: usize = 6;

/// Header-ish map keys that are always worth promoting.
const KNOWN_HEADER_KEYS: &[&str] = &["From", "To", "Subject", "Date", "Cc", "Reply-To"];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Introspection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Introspect a raw tool result. Always succeeds — the worst case is the
/// plain-text shape with one item per non-empty line.
pub fn introspect(raw: &str, now: DateTime<Utc>) -> OutputHints {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        if let Some((path, items)) = find_first_array(&value, MAX_ARRAY_DEPTH) {
            return introspect_json(path, items, now);
        }
        // A single JSON object: treat it as a one-item collection.
        if value.is_object() {
            return introspect_json(Vec::new(), &[value.clone()], now);
        }
    }
    if let Some(hints) = introspect_csv(raw, now) {
        return hints;
    }
    OutputHints {
        shape: ShapeKind::Lines,
        array_path: Vec::new(),
        summary_fields: vec!["value".into()],
        noise_fields: Vec::new(),
        est_item_size: raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.len())
            .max()
            .unwrap_or(0),
        verified_at: now,
    }
}

/// Breadth-first walk of object fields looking for the first non-empty
/// array, up to `depth` levels down.
fn find_first_array(value: &Value, depth: usize) -> Option<(Vec<String>, &Vec<Value>)> {
    if let Value::Array(items) = value {
        if !items.is_empty() {
            return Some((Vec::new(), items));
        }
    }
    if depth == 0 {
        return None;
    }
    if let Value::Object(map) = value {
        // Direct children first so the shallowest array wins.
        for (key, child) in map {
            if let Value::Array(items) = child {
                if !items.is_empty() {
                    return Some((vec![key.clone()], items));
                }
            }
        }
        for (key, child) in map {
            if let Some((mut path, items)) = find_first_array(child, depth - 1) {
                path.insert(0, key.clone());
                return Some((path, items));
            }
        }
    }
    None
}

fn introspect_json(array_path: Vec<String>, items: &[Value], now: DateTime<Utc>) -> OutputHints {
    let sample: Vec<&Value> = items.iter().take(SAMPLE_SIZE).collect();
    let mut summary = Vec::new();
    let mut noise = Vec::new();
    let mut promoted = Vec::new();

    // Enumerate top-level field paths over the sample, preserving the
    // field order of the first item.
    let mut fields: Vec<String> = Vec::new();
    for item in &sample {
        if let Value::Object(map) = item {
            for key in map.keys() {
                if !fields.contains(key) {
                    fields.push(key.clone());
                }
            }
        }
    }

    for field in &fields {
        let sizes: Vec<usize> = sample
            .iter()
            .filter_map(|i| i.get(field))
            .map(serialized_size)
            .collect();
        if sizes.is_empty() {
            continue;
        }
        let avg = sizes.iter().sum::<usize>() / sizes.len();
        let is_container = sample
            .iter()
            .filter_map(|i| i.get(field))
            .any(|v| v.is_object() || v.is_array());

        if avg < SUMMARY_MAX {
            summary.push(field.clone());
        } else if !is_container || avg > CONTAINER_NOISE_MIN {
            noise.push(field.clone());
            // Small useful sub-values hiding inside the noise.
            if promoted.len() < MAX_PROMOTED {
                if let Some(first) = sample.iter().find_map(|i| i.get(field)) {
                    promote_sub_values(field, first, &mut promoted);
                }
            }
        }
    }

    promoted.truncate(MAX_PROMOTED);
    summary.extend(promoted);

    let est_item_size = if sample.is_empty() {
        0
    } else {
        sample.iter().map(|i| serialized_size(i)).sum::<usize>() / sample.len()
    };

    OutputHints {
        shape: ShapeKind::Json,
        array_path,
        summary_fields: summary,
        noise_fields: noise,
        est_item_size,
        verified_at: now,
    }
}

/// Look one and two levels inside a noise field for recognized header
/// names or short strings, recording bracket-notation paths.
fn promote_sub_values(field: &str, value: &Value, out: &mut Vec<String>) {
    let Value::Object(map) = value else { return };
    for (key, child) in map {
        match child {
            Value::Object(inner) => {
                for (sub_key, sub_val) in inner {
                    if out.len() >= MAX_PROMOTED {
                        return;
                    }
                    if is_promotable(sub_key, sub_val) {
                        out.push(format!("{field}.{key}[{sub_key}]"));
                    }
                }
            }
            _ => {
                if out.len() >= MAX_PROMOTED {
                    return;
                }
                if is_promotable(key, child) {
                    out.push(format!("{field}[{key}]"));
                }
            }
        }
    }
}

fn is_promotable(key: &str, value: &Value) -> bool {
    if KNOWN_HEADER_KEYS.iter().any(|h| h.eq_ignore_ascii_case(key)) {
        return true;
    }
    matches!(value, Value::String(s) if s.len() < PROMOTE_MAX_STR)
}

fn serialized_size(value: &Value) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(0)
}

fn introspect_csv(raw: &str, now: DateTime<Utc>) -> Option<OutputHints> {
    let mut lines = raw.lines().filter(|l| !l.trim().is_empty());
    let header = lines.next()?;
    let columns: Vec<&str> = header.split(',').map(str::trim).collect();
    if columns.len() < 2 {
        return None;
    }
    let rows: Vec<&str> = lines.collect();
    if rows.is_empty() {
        return None;
    }
    let matching = rows
        .iter()
        .filter(|r| r.split(',').count() == columns.len())
        .count();
    if matching * 2 < rows.len() {
        return None;
    }
    Some(OutputHints {
        shape: ShapeKind::Csv,
        array_path: Vec::new(),
        summary_fields: columns.iter().map(|c| c.to_string()).collect(),
        noise_fields: Vec::new(),
        est_item_size: rows.iter().map(|r| r.len()).max().unwrap_or(0),
        verified_at: now,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Item extraction & field access
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Re-extract items from raw text using stored hints.
pub fn extract_items(raw: &str, hints: &OutputHints) -> Vec<Value> {
    match hints.shape {
        ShapeKind::Json => {
            let Ok(mut value) = serde_json::from_str::<Value>(raw) else {
                return Vec::new();
            };
            for seg in &hints.array_path {
                match value.get_mut(seg) {
                    Some(inner) => value = inner.take(),
                    None => return Vec::new(),
                }
            }
            match value {
                Value::Array(items) => items,
                other if other.is_object() => vec![other],
                _ => Vec::new(),
            }
        }
        ShapeKind::Csv => {
            let mut lines = raw.lines().filter(|l| !l.trim().is_empty());
            let Some(header) = lines.next() else {
                return Vec::new();
            };
            let columns: Vec<&str> = header.split(',').map(str::trim).collect();
            lines
                .filter(|row| row.split(',').count() == columns.len())
                .map(|row| {
                    let mut obj = serde_json::Map::new();
                    for (col, cell) in columns.iter().zip(row.split(',')) {
                        obj.insert(col.to_string(), Value::String(cell.trim().to_string()));
                    }
                    Value::Object(obj)
                })
                .collect()
        }
        ShapeKind::Lines => raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| Value::String(l.to_string()))
            .collect(),
    }
}

/// Do the stored hints still describe this data? A missing summary field
/// across the whole sample means the shape changed.
pub fn hints_match(hints: &OutputHints, items: &[Value]) -> bool {
    if items.is_empty() {
        return true;
    }
    let sample: Vec<&Value> = items.iter().take(SAMPLE_SIZE).collect();
    hints.summary_fields.iter().all(|field| {
        sample
            .iter()
            .any(|item| field_value(item, field).is_some())
    })
}

/// Resolve a field path against one item. Supports dotted segments and
/// bracket map-key access: `payload.headers[From]`.
pub fn field_value<'a>(item: &'a Value, path: &str) -> Option<&'a Value> {
    if path == "value" && !item.is_object() {
        return Some(item);
    }
    let mut current = item;
    for segment in path.split('.') {
        if let Some((name, bracket)) = segment.split_once('[') {
            let key = bracket.strip_suffix(']')?;
            if !name.is_empty() {
                current = current.get(name)?;
            }
            current = current.get(key)?;
        } else {
            current = current.get(segment)?;
        }
    }
    Some(current)
}

/// Render a field value as a flat cell string.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gmail_raw(n: usize) -> String {
        let items: Vec<Value> = (0..n)
            .map(|i| {
                serde_json::json!({
                    "id": format!("msg-{i}"),
                    "threadId": format!("thr-{i}"),
                    "snippet": format!("snippet number {i}"),
                    "payload": {
                        "headers": {
                            "From": format!("sender{i}@acme.com"),
                            "Subject": format!("Subject {i}"),
                            "Date": "2026-08-01",
                        },
                        "body": "x".repeat(1500),
                    }
                })
            })
            .collect();
        serde_json::json!({ "messages": items, "resultSizeEstimate": n }).to_string()
    }

    #[test]
    fn finds_first_nonempty_array_and_classifies() {
        let hints = introspect(&gmail_raw(40), Utc::now());
        assert_eq!(hints.shape, ShapeKind::Json);
        assert_eq!(hints.array_path, vec!["messages"]);
        assert!(hints.summary_fields.contains(&"id".to_string()));
        assert!(hints.summary_fields.contains(&"snippet".to_string()));
        assert!(hints.noise_fields.contains(&"payload".to_string()));
        // Header sub-values promoted out of the noise field.
        assert!(hints
            .summary_fields
            .iter()
            .any(|f| f == "payload.headers[From]"));
        assert!(hints
            .summary_fields
            .iter()
            .any(|f| f == "payload.headers[Subject]"));
    }

    #[test]
    fn extraction_follows_array_path() {
        let raw = gmail_raw(7);
        let hints = introspect(&raw, Utc::now());
        let items = extract_items(&raw, &hints);
        assert_eq!(items.len(), 7);
        let from = field_value(&items[2], "payload.headers[From]").unwrap();
        assert_eq!(from, "sender2@acme.com");
    }

    #[test]
    fn root_array_has_empty_path() {
        let raw = serde_json::json!([{"a": 1}, {"a": 2}]).to_string();
        let hints = introspect(&raw, Utc::now());
        assert!(hints.array_path.is_empty());
        assert_eq!(extract_items(&raw, &hints).len(), 2);
    }

    #[test]
    fn csv_shape_detected() {
        let raw = "name, age, city\nalice, 30, berlin\nbob, 25, lisbon\n";
        let hints = introspect(raw, Utc::now());
        assert_eq!(hints.shape, ShapeKind::Csv);
        assert_eq!(hints.summary_fields, vec!["name", "age", "city"]);
        let items = extract_items(raw, &hints);
        assert_eq!(items.len(), 2);
        assert_eq!(field_value(&items[0], "city").unwrap(), "berlin");
    }

    #[test]
    fn csv_requires_half_matching_rows() {
        // 1 of 3 rows matches the 3-column header — falls through to lines.
        let raw = "a, b, c\n1, 2, 3\nbroken row\nanother broken\n";
        let hints = introspect(raw, Utc::now());
        assert_eq!(hints.shape, ShapeKind::Lines);
    }

    #[test]
    fn plain_text_one_item_per_line() {
        let raw = "first line\n\nsecond line\nthird\n";
        let hints = introspect(raw, Utc::now());
        assert_eq!(hints.shape, ShapeKind::Lines);
        let items = extract_items(raw, &hints);
        assert_eq!(items.len(), 3);
        assert_eq!(field_value(&items[0], "value").unwrap(), "first line");
    }

    #[test]
    fn hints_detect_shape_drift() {
        let raw = gmail_raw(5);
        let hints = introspect(&raw, Utc::now());
        let items = extract_items(&raw, &hints);
        assert!(hints_match(&hints, &items));

        // Same tool now returns items without `snippet`.
        let drifted: Vec<Value> = (0..5)
            .map(|i| serde_json::json!({"id": i, "threadId": i}))
            .collect();
        assert!(!hints_match(&hints, &drifted));
    }
}
