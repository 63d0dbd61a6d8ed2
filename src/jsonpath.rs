//! Shared JSONPath subset used by assertion and extractor rules.
//!
//! Supported expressions, with or without a leading `$`:
//! - `.field` / `field`: object key access
//! - `[3]`: array index
//! - `.*` / `[*]`: wildcard over every element of an array or every value
//!   of an object, yielding an array of matches
//!
//! Anything else (filters, slices, recursive descent) is rejected.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Field(String),
    Index(usize),
    Wildcard,
}

/// Evaluate `expr` against `root`.
///
/// Returns `None` when the expression does not parse or does not match.
/// Wildcard segments fan out; the result of a fan-out is an owned array of
/// every matched element, so downstream equality checks compare against a
/// JSON array.
pub fn select(root: &Value, expr: &str) -> Option<Value> {
    let segments = parse(expr)?;
    let mut current: Vec<&Value> = vec![root];
    for segment in &segments {
        let mut next = Vec::new();
        for value in current {
            match segment {
                Segment::Field(name) => {
                    next.push(value.get(name.as_str())?);
                }
                Segment::Index(i) => {
                    next.push(value.get(*i)?);
                }
                Segment::Wildcard => match value {
                    Value::Array(items) => next.extend(items.iter()),
                    Value::Object(map) => next.extend(map.values()),
                    _ => return None,
                },
            }
        }
        if next.is_empty() {
            return None;
        }
        current = next;
    }

    let fanned_out = segments.iter().any(|s| *s == Segment::Wildcard);
    if fanned_out {
        Some(Value::Array(current.into_iter().cloned().collect()))
    } else {
        current.into_iter().next().cloned()
    }
}

fn parse(expr: &str) -> Option<Vec<Segment>> {
    let mut rest = expr.strip_prefix('$').unwrap_or(expr);
    let mut segments = Vec::new();

    while !rest.is_empty() {
        if let Some(tail) = rest.strip_prefix('.') {
            rest = tail;
            if rest.is_empty() {
                return None;
            }
            continue;
        }
        if let Some(tail) = rest.strip_prefix('[') {
            let close = tail.find(']')?;
            let inner = &tail[..close];
            if inner == "*" {
                segments.push(Segment::Wildcard);
            } else {
                segments.push(Segment::Index(inner.parse().ok()?));
            }
            rest = &tail[close + 1..];
            continue;
        }
        // Bare field name up to the next '.' or '['.
        let end = rest
            .find(['.', '['])
            .unwrap_or(rest.len());
        let name = &rest[..end];
        if name == "*" {
            segments.push(Segment::Wildcard);
        } else {
            segments.push(Segment::Field(name.to_string()));
        }
        rest = &rest[end..];
    }

    if segments.is_empty() {
        return None;
    }
    Some(segments)
}

/// Render a scalar JSON value as the plain string stored into a variable.
/// Strings lose their quotes; everything else uses its JSON text.
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
