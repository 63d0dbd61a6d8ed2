//! Assertion rules and their evaluation against a received response.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jsonpath;

/// The closed set of response checks a request can carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssertionRule {
    /// Status code equals a specific value.
    StatusCodeEquals { expected: u16 },
    /// Status code does not equal a specific value.
    StatusCodeNotEquals { not_expected: u16 },
    /// Status code falls within an inclusive range.
    StatusCodeRange { min: u16, max: u16 },
    /// Body contains a substring (not a regex).
    BodyContains { substring: String },
    /// Body does not contain a substring.
    BodyNotContains { substring: String },
    /// A JSONPath expression evaluates to an expected JSON value.
    JsonPath {
        expression: String,
        expected: serde_json::Value,
    },
    /// Response time stays below a threshold in milliseconds.
    ResponseTimeBelow { threshold_ms: u64 },
    /// A response header equals a value. Name lookup is case-insensitive,
    /// value comparison is case-sensitive.
    HeaderEquals { header: String, expected: String },
    /// A response header contains a substring.
    HeaderContains { header: String, substring: String },
}

/// Outcome of one assertion on one response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AssertionOutcome {
    pub id: Uuid,
    pub name: String,
    pub passed: bool,
    pub message: String,
}

/// The response facts assertions are scored against.
pub struct ResponseContext<'a> {
    pub status_code: u16,
    /// Response headers with lowercased names.
    pub headers: &'a std::collections::HashMap<String, String>,
    /// Body decoded as UTF-8 (lossy), capped by the dispatcher.
    pub body: &'a str,
    pub elapsed_ms: u64,
}

impl ResponseContext<'_> {
    fn header(&self, name: &str) -> Option<&String> {
        self.headers.get(&name.to_lowercase())
    }
}

/// Evaluate a single rule. Never panics; every outcome carries a message
/// explaining what was compared.
pub fn evaluate(rule: &AssertionRule, ctx: &ResponseContext) -> (bool, String) {
    match rule {
        AssertionRule::StatusCodeEquals { expected } => {
            let passed = ctx.status_code == *expected;
            let message = if passed {
                format!("status {} matches", ctx.status_code)
            } else {
                format!("expected status {expected}, got {}", ctx.status_code)
            };
            (passed, message)
        }
        AssertionRule::StatusCodeNotEquals { not_expected } => {
            let passed = ctx.status_code != *not_expected;
            let message = if passed {
                format!("status {} is not {not_expected}", ctx.status_code)
            } else {
                format!("status must not be {not_expected}")
            };
            (passed, message)
        }
        AssertionRule::StatusCodeRange { min, max } => {
            let passed = (*min..=*max).contains(&ctx.status_code);
            let message = if passed {
                format!("status {} within [{min}, {max}]", ctx.status_code)
            } else {
                format!("status {} outside [{min}, {max}]", ctx.status_code)
            };
            (passed, message)
        }
        AssertionRule::BodyContains { substring } => {
            let passed = ctx.body.contains(substring.as_str());
            let message = if passed {
                format!("body contains {substring:?}")
            } else {
                format!("body does not contain {substring:?}")
            };
            (passed, message)
        }
        AssertionRule::BodyNotContains { substring } => {
            let passed = !ctx.body.contains(substring.as_str());
            let message = if passed {
                format!("body does not contain {substring:?}")
            } else {
                format!("body unexpectedly contains {substring:?}")
            };
            (passed, message)
        }
        AssertionRule::JsonPath {
            expression,
            expected,
        } => match serde_json::from_str::<serde_json::Value>(ctx.body) {
            Ok(doc) => match jsonpath::select(&doc, expression) {
                Some(actual) if actual == *expected => {
                    (true, format!("{expression} equals expected value"))
                }
                Some(actual) => (
                    false,
                    format!("{expression} expected {expected}, got {actual}"),
                ),
                None => (false, format!("{expression} not found in body")),
            },
            Err(_) => (false, "body is not JSON".to_string()),
        },
        AssertionRule::ResponseTimeBelow { threshold_ms } => {
            let passed = ctx.elapsed_ms < *threshold_ms;
            let message = if passed {
                format!("{} ms below {threshold_ms} ms", ctx.elapsed_ms)
            } else {
                format!("{} ms exceeds {threshold_ms} ms", ctx.elapsed_ms)
            };
            (passed, message)
        }
        AssertionRule::HeaderEquals { header, expected } => match ctx.header(header) {
            Some(value) if value == expected => (true, format!("header {header:?} matches")),
            Some(value) => (
                false,
                format!("header {header:?} expected {expected:?}, got {value:?}"),
            ),
            None => (false, format!("header {header:?} not present")),
        },
        AssertionRule::HeaderContains { header, substring } => match ctx.header(header) {
            Some(value) if value.contains(substring.as_str()) => {
                (true, format!("header {header:?} contains {substring:?}"))
            }
            Some(value) => (
                false,
                format!("header {header:?} value {value:?} does not contain {substring:?}"),
            ),
            None => (false, format!("header {header:?} not present")),
        },
    }
}

/// Evaluate every assertion on a request in list order.
pub fn evaluate_all(
    assertions: &[crate::plan::Assertion],
    ctx: &ResponseContext,
) -> Vec<AssertionOutcome> {
    assertions
        .iter()
        .map(|assertion| {
            let (passed, message) = evaluate(&assertion.rule, ctx);
            AssertionOutcome {
                id: assertion.id,
                name: assertion.name.clone(),
                passed,
                message,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn ctx<'a>(
        status: u16,
        headers: &'a HashMap<String, String>,
        body: &'a str,
        elapsed_ms: u64,
    ) -> ResponseContext<'a> {
        ResponseContext {
            status_code: status,
            headers,
            body,
            elapsed_ms,
        }
    }

    #[test]
    fn status_equals() {
        let headers = HashMap::new();
        let c = ctx(200, &headers, "", 10);
        assert!(evaluate(&AssertionRule::StatusCodeEquals { expected: 200 }, &c).0);
        let (passed, message) =
            evaluate(&AssertionRule::StatusCodeEquals { expected: 201 }, &c);
        assert!(!passed);
        assert!(message.contains("201"));
    }

    #[test]
    fn status_not_equals() {
        let headers = HashMap::new();
        let c = ctx(200, &headers, "", 10);
        assert!(evaluate(&AssertionRule::StatusCodeNotEquals { not_expected: 500 }, &c).0);
        assert!(!evaluate(&AssertionRule::StatusCodeNotEquals { not_expected: 200 }, &c).0);
    }

    #[test]
    fn status_range_is_inclusive() {
        let headers = HashMap::new();
        for status in [200, 250, 299] {
            let c = ctx(status, &headers, "", 10);
            assert!(evaluate(&AssertionRule::StatusCodeRange { min: 200, max: 299 }, &c).0);
        }
        let c = ctx(300, &headers, "", 10);
        assert!(!evaluate(&AssertionRule::StatusCodeRange { min: 200, max: 299 }, &c).0);
    }

    #[test]
    fn body_substring_checks() {
        let headers = HashMap::new();
        let c = ctx(200, &headers, "hello world", 10);
        assert!(evaluate(
            &AssertionRule::BodyContains {
                substring: "world".into()
            },
            &c
        )
        .0);
        assert!(!evaluate(
            &AssertionRule::BodyContains {
                substring: "mars".into()
            },
            &c
        )
        .0);
        assert!(evaluate(
            &AssertionRule::BodyNotContains {
                substring: "mars".into()
            },
            &c
        )
        .0);
    }

    #[test]
    fn json_path_equality_is_structural() {
        let headers = HashMap::new();
        let c = ctx(200, &headers, r#"{"data":{"id":42}}"#, 10);
        assert!(evaluate(
            &AssertionRule::JsonPath {
                expression: "data.id".into(),
                expected: json!(42),
            },
            &c
        )
        .0);
        let (passed, _) = evaluate(
            &AssertionRule::JsonPath {
                expression: "data.id".into(),
                expected: json!("42"),
            },
            &c,
        );
        assert!(!passed, "number and string must not compare equal");
    }

    #[test]
    fn json_path_on_non_json_body() {
        let headers = HashMap::new();
        let c = ctx(200, &headers, "<html>", 10);
        let (passed, message) = evaluate(
            &AssertionRule::JsonPath {
                expression: "a".into(),
                expected: json!(1),
            },
            &c,
        );
        assert!(!passed);
        assert_eq!(message, "body is not JSON");
    }

    #[test]
    fn response_time_threshold_is_exclusive() {
        let headers = HashMap::new();
        let c = ctx(200, &headers, "", 100);
        assert!(!evaluate(&AssertionRule::ResponseTimeBelow { threshold_ms: 100 }, &c).0);
        assert!(evaluate(&AssertionRule::ResponseTimeBelow { threshold_ms: 101 }, &c).0);
    }

    #[test]
    fn header_name_lookup_is_case_insensitive() {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        let c = ctx(200, &headers, "", 10);
        assert!(evaluate(
            &AssertionRule::HeaderEquals {
                header: "Content-Type".into(),
                expected: "application/json".into(),
            },
            &c
        )
        .0);
        // Value comparison stays case-sensitive.
        assert!(!evaluate(
            &AssertionRule::HeaderEquals {
                header: "content-type".into(),
                expected: "Application/Json".into(),
            },
            &c
        )
        .0);
        assert!(evaluate(
            &AssertionRule::HeaderContains {
                header: "CONTENT-TYPE".into(),
                substring: "json".into(),
            },
            &c
        )
        .0);
    }

    #[test]
    fn evaluate_all_keeps_list_order() {
        let mut headers = HashMap::new();
        headers.insert("server".to_string(), "axum".to_string());
        let c = ctx(200, &headers, "ok", 5);
        let assertions = vec![
            crate::plan::Assertion {
                id: Uuid::new_v4(),
                name: "status".into(),
                rule: AssertionRule::StatusCodeEquals { expected: 200 },
            },
            crate::plan::Assertion {
                id: Uuid::new_v4(),
                name: "body".into(),
                rule: AssertionRule::BodyContains {
                    substring: "nope".into(),
                },
            },
        ];
        let outcomes = evaluate_all(&assertions, &c);
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].name, "status");
        assert!(outcomes[0].passed);
        assert!(!outcomes[1].passed);
    }

    #[test]
    fn unknown_rule_type_fails_to_parse() {
        let raw = json!({"type": "xpath_equals", "expression": "//a"});
        assert!(serde_json::from_value::<AssertionRule>(raw).is_err());
    }
}
