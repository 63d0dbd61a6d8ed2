//! Extractor rules pull values out of a response into iteration variables.

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jsonpath;

/// How a value is captured from a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExtractorRule {
    /// Capture the scalar a JSONPath expression resolves to.
    JsonPath { expression: String },
    /// Capture a regex group from the body. Group 0 is the whole match.
    Regex { pattern: String, group: u32 },
    /// Capture a response header by case-insensitive name.
    Header { name: String },
}

/// Outcome of one extractor on one response. On success the captured value
/// is also bound into the virtual user's iteration scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ExtractionOutcome {
    pub id: Uuid,
    pub name: String,
    /// Variable the value was (or would have been) bound to.
    pub variable: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub message: String,
}

/// Response facts extractors operate on.
pub struct ExtractionContext<'a> {
    /// Response headers with lowercased names.
    pub headers: &'a std::collections::HashMap<String, String>,
    pub body: &'a str,
}

/// Evaluate a single rule, returning `(success, value, message)`.
pub fn evaluate(rule: &ExtractorRule, ctx: &ExtractionContext) -> (bool, Option<String>, String) {
    match rule {
        ExtractorRule::JsonPath { expression } => {
            match serde_json::from_str::<serde_json::Value>(ctx.body) {
                Ok(doc) => match jsonpath::select(&doc, expression) {
                    Some(value) => match jsonpath::scalar_to_string(&value) {
                        Some(s) => {
                            let message = format!("{expression} captured {s:?}");
                            (true, Some(s), message)
                        }
                        None => (
                            false,
                            None,
                            format!("{expression} resolved to a non-scalar value"),
                        ),
                    },
                    None => (false, None, format!("{expression} not found in body")),
                },
                Err(_) => (false, None, "body is not JSON".to_string()),
            }
        }
        ExtractorRule::Regex { pattern, group } => match Regex::new(pattern) {
            Ok(re) => match re.captures(ctx.body) {
                Some(caps) => match caps.get(*group as usize) {
                    Some(m) => {
                        let s = m.as_str().to_string();
                        let message = format!("group {group} captured {s:?}");
                        (true, Some(s), message)
                    }
                    None => (false, None, format!("matched, but group {group} is absent")),
                },
                None => (false, None, format!("pattern {pattern:?} did not match")),
            },
            Err(e) => (false, None, format!("invalid pattern {pattern:?}: {e}")),
        },
        ExtractorRule::Header { name } => match ctx.headers.get(&name.to_lowercase()) {
            Some(value) => {
                let message = format!("header {name:?} captured {value:?}");
                (true, Some(value.clone()), message)
            }
            None => (false, None, format!("header {name:?} not present")),
        },
    }
}

/// Evaluate every extractor on a request in list order. Failures never abort
/// the pipeline; they only leave the variable unbound.
pub fn evaluate_all(
    extractors: &[crate::plan::Extractor],
    ctx: &ExtractionContext,
) -> Vec<ExtractionOutcome> {
    extractors
        .iter()
        .map(|extractor| {
            let (success, value, message) = evaluate(&extractor.rule, ctx);
            ExtractionOutcome {
                id: extractor.id,
                name: extractor.name.clone(),
                variable: extractor.variable.clone(),
                success,
                value,
                message,
            }
        })
        .collect()
}
