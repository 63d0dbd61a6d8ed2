//! Records the engine publishes: one per request, periodic progress, and the
//! terminal per-run summary with its per-second time series.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::assertion::AssertionOutcome;
use crate::extract::ExtractionOutcome;
use crate::MAX_RECORD_BODY_BYTES;

/// The outcome of one executed request, streamed to subscribers and folded
/// into the aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RequestRecord {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub thread_group: String,
    pub request_id: Uuid,
    pub request_name: String,
    pub timestamp: DateTime<Utc>,
    /// HTTP method as sent, e.g. "GET".
    pub method: String,
    /// The URL after variable expansion.
    pub url: String,
    /// 0 when the request never produced a response.
    pub status_code: u16,
    pub elapsed_ms: u64,
    pub size_bytes: u64,
    /// Response headers with lowercased names.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub response_headers: HashMap<String, String>,
    /// Response body truncated to 4 KiB; `None` when empty or dropped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    /// True iff every assertion passed (vacuously true with none).
    pub assertions_passed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assertion_outcomes: Vec<AssertionOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extraction_outcomes: Vec<ExtractionOutcome>,
    /// Transport-level failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RequestRecord {
    /// A request counts as successful when it produced a response and all
    /// of its assertions passed.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.assertions_passed
    }
}

/// Truncate a response body for storage on a record, respecting UTF-8
/// character boundaries.
pub fn truncate_body(body: &str) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    if body.len() <= MAX_RECORD_BODY_BYTES {
        return Some(body.to_string());
    }
    let mut cut = MAX_RECORD_BODY_BYTES;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    Some(body[..cut].to_string())
}

/// A periodic view of a running test.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProgressSnapshot {
    pub completed_requests: u64,
    pub total_errors: u64,
    pub active_vus: u32,
    pub elapsed_ms: u64,
    /// Requests per second, smoothed over a 2-second horizon.
    pub current_rps: f64,
    pub mean_ms: f64,
    /// Streaming estimate; the summary recomputes p95 exactly.
    pub p95_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}

/// The terminal report for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TestSummary {
    pub plan_id: Uuid,
    pub plan_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub min_response_ms: u64,
    pub max_response_ms: u64,
    pub mean_response_ms: f64,
    pub p50_response_ms: u64,
    pub p95_response_ms: u64,
    pub p99_response_ms: u64,
    /// Total requests divided by wall-clock duration.
    pub requests_per_second: f64,
    pub total_bytes_received: u64,
}

/// One second of the run, for post-hoc charts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TimeBucket {
    /// Seconds since run start.
    pub second: u64,
    pub requests: u64,
    pub errors: u64,
    pub avg_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
}
