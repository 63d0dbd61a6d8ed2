//! The declarative test-plan model and its validation.
//!
//! A plan is parsed from UTF-8 JSON (the `.rmeter` on-disk format), validated
//! once, then treated as immutable for the lifetime of a run. Unknown object
//! fields are tolerated for forward compatibility; unknown rule variants are
//! not: they fail parsing, which doubles as plan validation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::assertion::AssertionRule;
use crate::error::EngineError;
use crate::extract::ExtractorRule;

/// Highest plan format this build understands.
pub const SUPPORTED_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        };
        f.write_str(s)
    }
}

/// Request payload variants. Bodies are stored as template text so `${name}`
/// references survive until expansion time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RequestBody {
    Json(String),
    Raw(String),
    Xml(String),
    /// URL-encoded form data as ordered key/value pairs.
    Form(Vec<(String, String)>),
}

/// How many passes a virtual user makes over its group's request list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopCount {
    Finite { count: u64 },
    Duration { seconds: u64 },
    Infinite,
}

impl Default for LoopCount {
    fn default() -> Self {
        Self::Finite { count: 1 }
    }
}

/// A named assertion attached to a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Assertion {
    pub id: Uuid,
    pub name: String,
    pub rule: AssertionRule,
}

/// A named extractor attached to a request. The captured value is bound to
/// `variable` in the iteration scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Extractor {
    pub id: Uuid,
    pub name: String,
    pub variable: String,
    pub rule: ExtractorRule,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct HttpRequest {
    pub id: Uuid,
    pub name: String,
    pub method: HttpMethod,
    /// URL template; may reference `${name}` variables.
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<RequestBody>,
    #[serde(default)]
    pub assertions: Vec<Assertion>,
    #[serde(default)]
    pub extractors: Vec<Extractor>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableScope {
    Global,
    #[default]
    Plan,
    ThreadGroup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Variable {
    pub id: Uuid,
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub scope: VariableScope,
}

/// How CSV rows are handed out across virtual users.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CsvSharingMode {
    /// One global cursor; every iteration of every user consumes a row.
    #[default]
    AllThreads,
    /// Each virtual user walks the rows independently from row 0.
    PerThread,
}

/// Tabular data feeding `${column}` variables, one row per loop iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CsvDataSource {
    pub id: Uuid,
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    #[serde(default)]
    pub sharing_mode: CsvSharingMode,
    /// Wrap back to row 0 when exhausted. When false, the last row is served
    /// again for the remainder of the run.
    #[serde(default = "default_true")]
    pub recycle: bool,
}

impl CsvDataSource {
    /// Parse raw CSV text (header row required) into a data source.
    pub fn from_csv_text(
        name: impl Into<String>,
        text: &str,
        delimiter: u8,
    ) -> Result<Self, EngineError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .from_reader(text.as_bytes());

        let columns: Vec<String> = reader
            .headers()
            .map_err(|e| EngineError::Validation(format!("csv header: {e}")))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        if columns.is_empty() {
            return Err(EngineError::Validation("csv has no columns".into()));
        }

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| EngineError::Validation(format!("csv row: {e}")))?;
            rows.push(record.iter().map(|f| f.to_string()).collect());
        }
        if rows.is_empty() {
            return Err(EngineError::Validation("csv has no data rows".into()));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            columns,
            rows,
            sharing_mode: CsvSharingMode::default(),
            recycle: true,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ThreadGroup {
    pub id: Uuid,
    pub name: String,
    /// Number of concurrent virtual users.
    pub num_threads: u32,
    /// Window over which users are started, staggered evenly.
    pub ramp_up_seconds: u32,
    #[serde(default)]
    pub loop_count: LoopCount,
    #[serde(default)]
    pub requests: Vec<HttpRequest>,
    #[serde(default)]
    pub variables: Vec<Variable>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ThreadGroup {
    /// True when this group would actually issue traffic.
    pub fn is_runnable(&self) -> bool {
        self.enabled && self.requests.iter().any(|r| r.enabled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TestPlan {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub thread_groups: Vec<ThreadGroup>,
    #[serde(default)]
    pub variables: Vec<Variable>,
    #[serde(default)]
    pub csv_data_sources: Vec<CsvDataSource>,
    #[serde(default = "default_format_version")]
    pub format_version: u32,
}

fn default_true() -> bool {
    true
}

fn default_format_version() -> u32 {
    1
}

impl TestPlan {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            thread_groups: Vec::new(),
            variables: Vec::new(),
            csv_data_sources: Vec::new(),
            format_version: SUPPORTED_FORMAT_VERSION,
        }
    }

    /// Parse and validate a plan from its JSON document.
    pub fn from_json(text: &str) -> Result<Self, EngineError> {
        let plan: TestPlan = serde_json::from_str(text)
            .map_err(|e| EngineError::Validation(format!("plan parse: {e}")))?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn to_json(&self) -> Result<String, EngineError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::Validation(format!("plan serialize: {e}")))
    }

    /// Check every structural invariant the engine relies on. All problems
    /// are collected before being reported.
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut problems = Vec::new();

        if self.format_version > SUPPORTED_FORMAT_VERSION {
            problems.push(format!(
                "unsupported format_version {} (max {SUPPORTED_FORMAT_VERSION})",
                self.format_version
            ));
        }
        if self.name.trim().is_empty() {
            problems.push("plan name must not be empty".to_string());
        }

        for group in &self.thread_groups {
            validate_thread_group(group, &mut problems);
        }
        for source in &self.csv_data_sources {
            validate_csv_source(source, &mut problems);
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Validation(problems.join("; ")))
        }
    }
}

fn validate_thread_group(group: &ThreadGroup, problems: &mut Vec<String>) {
    if group.name.trim().is_empty() {
        problems.push(format!("thread group {} has an empty name", group.id));
    }
    if group.num_threads == 0 {
        problems.push(format!(
            "thread group {:?}: num_threads must be at least 1",
            group.name
        ));
    }
    match group.loop_count {
        LoopCount::Finite { count } if count == 0 => problems.push(format!(
            "thread group {:?}: finite loop count must be at least 1",
            group.name
        )),
        LoopCount::Duration { seconds } if seconds == 0 => problems.push(format!(
            "thread group {:?}: loop duration must be at least 1 second",
            group.name
        )),
        _ => {}
    }
    for request in &group.requests {
        validate_request(request, problems);
    }
}

fn validate_request(request: &HttpRequest, problems: &mut Vec<String>) {
    let url = request.url.trim();
    if url.is_empty() {
        problems.push(format!("request {:?}: url must not be empty", request.name));
    } else {
        // Placeholders may stand in for any part of the URL, so strip them
        // before checking for a scheme.
        let stripped = strip_placeholders(url);
        if !stripped.starts_with("http://") && !stripped.starts_with("https://") {
            problems.push(format!(
                "request {:?}: url must use http:// or https:// (got {url:?})",
                request.name
            ));
        }
    }
    for assertion in &request.assertions {
        if let AssertionRule::StatusCodeRange { min, max } = assertion.rule {
            if min > max || min < 100 || max > 599 {
                problems.push(format!(
                    "assertion {:?}: status range [{min}, {max}] must satisfy 100 <= min <= max <= 599",
                    assertion.name
                ));
            }
        }
        if let AssertionRule::ResponseTimeBelow { threshold_ms } = assertion.rule {
            if threshold_ms == 0 {
                problems.push(format!(
                    "assertion {:?}: response time threshold must be positive",
                    assertion.name
                ));
            }
        }
    }
}

fn validate_csv_source(source: &CsvDataSource, problems: &mut Vec<String>) {
    if source.columns.is_empty() {
        problems.push(format!("csv source {:?} has no columns", source.name));
    }
    for (i, row) in source.rows.iter().enumerate() {
        if row.len() != source.columns.len() {
            problems.push(format!(
                "csv source {:?} row {i} has {} cells, expected {}",
                source.name,
                row.len(),
                source.columns.len()
            ));
        }
    }
}

fn strip_placeholders(url: &str) -> String {
    let mut out = String::with_capacity(url.len());
    let mut rest = url;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start..].find('}') {
            Some(end) => rest = &rest[start + end + 1..],
            None => {
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(url: &str) -> HttpRequest {
        HttpRequest {
            id: Uuid::new_v4(),
            name: "req".into(),
            method: HttpMethod::Get,
            url: url.into(),
            headers: HashMap::new(),
            body: None,
            assertions: Vec::new(),
            extractors: Vec::new(),
            enabled: true,
        }
    }

    fn group(requests: Vec<HttpRequest>) -> ThreadGroup {
        ThreadGroup {
            id: Uuid::new_v4(),
            name: "workers".into(),
            num_threads: 2,
            ramp_up_seconds: 0,
            loop_count: LoopCount::Finite { count: 3 },
            requests,
            variables: Vec::new(),
            enabled: true,
        }
    }

    fn plan(groups: Vec<ThreadGroup>) -> TestPlan {
        let mut p = TestPlan::new("plan");
        p.thread_groups = groups;
        p
    }

    #[test]
    fn method_display_and_wire_format() {
        assert_eq!(HttpMethod::Get.to_string(), "GET");
        assert_eq!(serde_json::to_string(&HttpMethod::Options).unwrap(), "\"OPTIONS\"");
        let m: HttpMethod = serde_json::from_str("\"PATCH\"").unwrap();
        assert_eq!(m, HttpMethod::Patch);
    }

    #[test]
    fn request_defaults_from_minimal_json() {
        let raw = json!({
            "id": "00000000-0000-0000-0000-000000000001",
            "name": "minimal",
            "method": "GET",
            "url": "http://example.com"
        });
        let req: HttpRequest = serde_json::from_value(raw).unwrap();
        assert!(req.enabled);
        assert!(req.headers.is_empty());
        assert!(req.body.is_none());
        assert!(req.assertions.is_empty());
    }

    #[test]
    fn body_round_trips_through_adjacent_tag() {
        let body = RequestBody::Json("{\"a\": 1}".into());
        let raw = serde_json::to_value(&body).unwrap();
        assert_eq!(raw["type"], "json");
        let back: RequestBody = serde_json::from_value(raw).unwrap();
        assert!(matches!(back, RequestBody::Json(s) if s == "{\"a\": 1}"));

        let form = RequestBody::Form(vec![("a".into(), "1".into())]);
        let raw = serde_json::to_value(&form).unwrap();
        let back: RequestBody = serde_json::from_value(raw).unwrap();
        assert!(matches!(back, RequestBody::Form(p) if p.len() == 1));
    }

    #[test]
    fn loop_count_default_is_one_pass() {
        assert!(matches!(LoopCount::default(), LoopCount::Finite { count: 1 }));
    }

    #[test]
    fn unknown_rule_variant_fails_plan_parse() {
        let raw = json!({
            "id": Uuid::new_v4(),
            "name": "p",
            "thread_groups": [{
                "id": Uuid::new_v4(),
                "name": "g",
                "num_threads": 1,
                "ramp_up_seconds": 0,
                "requests": [{
                    "id": Uuid::new_v4(),
                    "name": "r",
                    "method": "GET",
                    "url": "http://x/",
                    "assertions": [{
                        "id": Uuid::new_v4(),
                        "name": "bad",
                        "rule": {"type": "soap_matches", "value": 1}
                    }]
                }]
            }]
        });
        assert!(TestPlan::from_json(&raw.to_string()).is_err());
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let raw = json!({
            "id": Uuid::new_v4(),
            "name": "p",
            "future_field": {"x": 1},
            "thread_groups": []
        });
        let plan = TestPlan::from_json(&raw.to_string()).unwrap();
        assert_eq!(plan.name, "p");
        assert_eq!(plan.format_version, 1);
    }

    #[test]
    fn newer_format_version_is_rejected() {
        let mut p = TestPlan::new("p");
        p.format_version = SUPPORTED_FORMAT_VERSION + 1;
        assert!(p.validate().is_err());
    }

    #[test]
    fn zero_threads_is_invalid() {
        let mut g = group(vec![request("http://x/")]);
        g.num_threads = 0;
        let err = plan(vec![g]).validate().unwrap_err();
        assert!(err.to_string().contains("num_threads"));
    }

    #[test]
    fn zero_loop_count_is_invalid() {
        let mut g = group(vec![request("http://x/")]);
        g.loop_count = LoopCount::Finite { count: 0 };
        assert!(plan(vec![g]).validate().is_err());
        let mut g = group(vec![request("http://x/")]);
        g.loop_count = LoopCount::Duration { seconds: 0 };
        assert!(plan(vec![g]).validate().is_err());
    }

    #[test]
    fn url_scheme_is_required() {
        let g = group(vec![request("ftp://example.com")]);
        assert!(plan(vec![g]).validate().is_err());
        let g = group(vec![request("")]);
        assert!(plan(vec![g]).validate().is_err());
    }

    #[test]
    fn placeholder_urls_pass_scheme_check() {
        let g = group(vec![request("http://${host}/api/${path}")]);
        plan(vec![g]).validate().unwrap();
    }

    #[test]
    fn bad_status_range_is_invalid() {
        let mut req = request("http://x/");
        req.assertions.push(Assertion {
            id: Uuid::new_v4(),
            name: "range".into(),
            rule: AssertionRule::StatusCodeRange { min: 300, max: 200 },
        });
        assert!(plan(vec![group(vec![req])]).validate().is_err());

        let mut req = request("http://x/");
        req.assertions.push(Assertion {
            id: Uuid::new_v4(),
            name: "range".into(),
            rule: AssertionRule::StatusCodeRange { min: 50, max: 200 },
        });
        assert!(plan(vec![group(vec![req])]).validate().is_err());
    }

    #[test]
    fn ragged_csv_rows_are_invalid() {
        let mut p = plan(vec![group(vec![request("http://x/")])]);
        p.csv_data_sources.push(CsvDataSource {
            id: Uuid::new_v4(),
            name: "users".into(),
            columns: vec!["a".into(), "b".into()],
            rows: vec![vec!["1".into()]],
            sharing_mode: CsvSharingMode::AllThreads,
            recycle: true,
        });
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("row 0"));
    }

    #[test]
    fn csv_text_parsing() {
        let source =
            CsvDataSource::from_csv_text("users", "name,pass\nalice,a1\nbob,b2\n", b',').unwrap();
        assert_eq!(source.columns, vec!["name", "pass"]);
        assert_eq!(source.rows.len(), 2);
        assert_eq!(source.rows[1], vec!["bob", "b2"]);
        assert!(source.recycle);
    }

    #[test]
    fn csv_text_without_rows_fails() {
        assert!(CsvDataSource::from_csv_text("empty", "a,b\n", b',').is_err());
    }

    #[test]
    fn runnable_requires_an_enabled_request() {
        let mut g = group(vec![request("http://x/")]);
        assert!(g.is_runnable());
        g.requests[0].enabled = false;
        assert!(!g.is_runnable());
        let mut g = group(vec![request("http://x/")]);
        g.enabled = false;
        assert!(!g.is_runnable());
    }

    #[test]
    fn plan_round_trips_through_json() {
        let mut p = plan(vec![group(vec![request("http://example.com/")])]);
        p.variables.push(Variable {
            id: Uuid::new_v4(),
            name: "base".into(),
            value: "http://example.com".into(),
            scope: VariableScope::Global,
        });
        let text = p.to_json().unwrap();
        let back = TestPlan::from_json(&text).unwrap();
        assert_eq!(back.id, p.id);
        assert_eq!(back.thread_groups.len(), 1);
        assert_eq!(back.variables[0].scope, VariableScope::Global);
    }
}
