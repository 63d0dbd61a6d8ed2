//! The per-request pipeline: expand templates, dispatch, score assertions,
//! run extractors, and produce the result record.

use chrono::Utc;
use uuid::Uuid;

use crate::assertion::{self, AssertionOutcome, AssertionRule, ResponseContext};
use crate::client::{Dispatcher, OutboundRequest, RawResponse};
use crate::extract::{self, ExtractionContext, ExtractionOutcome};
use crate::plan::{HttpRequest, RequestBody};
use crate::report::{truncate_body, RequestRecord};
use crate::vars::VariableContext;

/// Run-scoped facts shared by every request a virtual user executes.
pub struct RequestContext<'a> {
    pub dispatcher: &'a Dispatcher,
    pub plan_id: Uuid,
    pub thread_group: &'a str,
}

/// Execute one enabled request template end to end.
///
/// Successful extractions are bound into `vars`' iteration scope before this
/// returns, so they are visible to the remaining requests of the iteration.
pub async fn run_request(
    request: &HttpRequest,
    vars: &mut VariableContext,
    ctx: &RequestContext<'_>,
) -> RequestRecord {
    let timestamp = Utc::now();
    let outbound = resolve(request, vars);
    let response = ctx.dispatcher.send(&outbound).await;

    let assertion_outcomes = match &response.error {
        None => {
            let rctx = ResponseContext {
                status_code: response.status_code,
                headers: &response.headers,
                body: &response.body,
                elapsed_ms: response.elapsed_ms,
            };
            assertion::evaluate_all(&request.assertions, &rctx)
        }
        Some(error) => failed_assertions(request, &response, error),
    };
    let assertions_passed = assertion_outcomes.iter().all(|o| o.passed);

    let extraction_outcomes = match &response.error {
        None => {
            let ectx = ExtractionContext {
                headers: &response.headers,
                body: &response.body,
            };
            let outcomes = extract::evaluate_all(&request.extractors, &ectx);
            for outcome in &outcomes {
                if let (true, Some(value)) = (outcome.success, &outcome.value) {
                    vars.bind(outcome.variable.clone(), value.clone());
                }
            }
            outcomes
        }
        Some(error) => failed_extractions(request, error),
    };

    RequestRecord {
        id: Uuid::new_v4(),
        plan_id: ctx.plan_id,
        thread_group: ctx.thread_group.to_string(),
        request_id: request.id,
        request_name: request.name.clone(),
        timestamp,
        method: request.method.to_string(),
        url: outbound.url,
        status_code: response.status_code,
        elapsed_ms: response.elapsed_ms,
        size_bytes: response.size_bytes,
        response_headers: response.headers,
        response_body: truncate_body(&response.body),
        assertions_passed,
        assertion_outcomes,
        extraction_outcomes,
        error: response.error,
    }
}

/// Expand every template field of a request against the current scopes.
fn resolve(request: &HttpRequest, vars: &VariableContext) -> OutboundRequest {
    let url = vars.expand(&request.url);
    let headers = request
        .headers
        .iter()
        .map(|(name, value)| (vars.expand(name), vars.expand(value)))
        .collect();
    let body = request.body.as_ref().map(|body| match body {
        RequestBody::Json(text) => RequestBody::Json(vars.expand(text)),
        RequestBody::Raw(text) => RequestBody::Raw(vars.expand(text)),
        RequestBody::Xml(text) => RequestBody::Xml(vars.expand(text)),
        RequestBody::Form(pairs) => RequestBody::Form(
            pairs
                .iter()
                .map(|(k, v)| (vars.expand(k), vars.expand(v)))
                .collect(),
        ),
    });

    OutboundRequest {
        method: request.method,
        url,
        headers,
        body,
    }
}

// Without a response only time-based assertions can be computed; everything
// else fails with the transport error as context.
fn failed_assertions(
    request: &HttpRequest,
    response: &RawResponse,
    error: &str,
) -> Vec<AssertionOutcome> {
    request
        .assertions
        .iter()
        .map(|a| match a.rule {
            AssertionRule::ResponseTimeBelow { .. } => {
                let rctx = ResponseContext {
                    status_code: 0,
                    headers: &response.headers,
                    body: "",
                    elapsed_ms: response.elapsed_ms,
                };
                let (passed, message) = assertion::evaluate(&a.rule, &rctx);
                AssertionOutcome {
                    id: a.id,
                    name: a.name.clone(),
                    passed,
                    message,
                }
            }
            _ => AssertionOutcome {
                id: a.id,
                name: a.name.clone(),
                passed: false,
                message: format!("no response: {error}"),
            },
        })
        .collect()
}

fn failed_extractions(request: &HttpRequest, error: &str) -> Vec<ExtractionOutcome> {
    request
        .extractors
        .iter()
        .map(|e| ExtractionOutcome {
            id: e.id,
            name: e.name.clone(),
            variable: e.variable.clone(),
            success: false,
            value: None,
            message: format!("no response: {error}"),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Assertion, Extractor, HttpMethod};
    use crate::extract::ExtractorRule;
    use std::collections::HashMap;
    use std::time::Duration;

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

    fn dispatcher() -> Dispatcher {
        Dispatcher::with_timeout(Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn resolve_expands_all_template_fields() {
        let mut vars = VariableContext::default();
        vars.bind("host", "example.com");
        vars.bind("token", "t-1");
        vars.bind("user", "alice");

        let mut req = request("http://${host}/api");
        req.headers
            .insert("Authorization".into(), "Bearer ${token}".into());
        req.body = Some(RequestBody::Form(vec![("name".into(), "${user}".into())]));

        let outbound = resolve(&req, &vars);
        assert_eq!(outbound.url, "http://example.com/api");
        assert_eq!(outbound.headers["Authorization"], "Bearer t-1");
        match outbound.body {
            Some(RequestBody::Form(pairs)) => assert_eq!(pairs[0].1, "alice"),
            _ => panic!("expected form body"),
        }
    }

    #[test]
    fn resolve_leaves_unknown_names_visible() {
        let vars = VariableContext::default();
        let req = request("http://host/${missing}");
        assert_eq!(resolve(&req, &vars).url, "http://host/${missing}");
    }

    #[tokio::test]
    async fn transport_failure_still_yields_a_record() {
        let dispatcher = dispatcher();
        let ctx = RequestContext {
            dispatcher: &dispatcher,
            plan_id: Uuid::new_v4(),
            thread_group: "g",
        };
        let mut vars = VariableContext::default();
        let mut req = request("http://127.0.0.1:1/");
        req.assertions.push(Assertion {
            id: Uuid::new_v4(),
            name: "status ok".into(),
            rule: AssertionRule::StatusCodeEquals { expected: 200 },
        });
        req.assertions.push(Assertion {
            id: Uuid::new_v4(),
            name: "fast".into(),
            rule: AssertionRule::ResponseTimeBelow { threshold_ms: 60_000 },
        });
        req.extractors.push(Extractor {
            id: Uuid::new_v4(),
            name: "grab".into(),
            variable: "x".into(),
            rule: ExtractorRule::Header {
                name: "server".into(),
            },
        });

        let record = run_request(&req, &mut vars, &ctx).await;
        assert_eq!(record.status_code, 0);
        assert!(record.error.is_some());
        assert!(!record.is_success());
        // Non-time assertions fail, the time-based one still computes.
        assert!(!record.assertion_outcomes[0].passed);
        assert!(record.assertion_outcomes[0].message.contains("no response"));
        assert!(record.assertion_outcomes[1].passed);
        assert!(!record.assertions_passed);
        // Extraction failed and nothing was bound.
        assert!(!record.extraction_outcomes[0].success);
        assert_eq!(vars.resolve("x"), None);
    }

    #[tokio::test]
    async fn record_url_is_the_resolved_url() {
        let dispatcher = dispatcher();
        let ctx = RequestContext {
            dispatcher: &dispatcher,
            plan_id: Uuid::new_v4(),
            thread_group: "g",
        };
        let mut vars = VariableContext::default();
        vars.bind("port", "1");
        let req = request("http://127.0.0.1:${port}/path");
        let record = run_request(&req, &mut vars, &ctx).await;
        assert_eq!(record.url, "http://127.0.0.1:1/path");
        assert_eq!(record.method, "GET");
    }
}
