//! HTTP dispatch over a shared [`reqwest`] client.
//!
//! One [`Dispatcher`] is built per run and cloned into every virtual user so
//! they share a connection pool. Transport failures are not `Err`; they come
//! back as a [`RawResponse`] with `status_code == 0` and an error string, so
//! the pipeline can still produce a result record.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{event, Level};

use crate::error::EngineError;
use crate::plan::{HttpMethod, RequestBody};
use crate::{CRATE_NAME, DEFAULT_HTTP_TIMEOUT_SECS, HTTP_TIMEOUT_ENV, MAX_EVAL_BODY_BYTES};

/// A fully resolved request, ready to put on the wire. All `${name}`
/// templates have already been expanded.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<RequestBody>,
}

/// What came back, in the shape assertions and extractors consume.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// 0 when the request never produced a response.
    pub status_code: u16,
    /// Header names lowercased for case-insensitive lookup.
    pub headers: HashMap<String, String>,
    /// Body decoded as lossy UTF-8, capped at [`MAX_EVAL_BODY_BYTES`].
    pub body: String,
    /// Full body size on the wire, before the evaluation cap.
    pub size_bytes: u64,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

impl RawResponse {
    fn failure(error: String, elapsed_ms: u64) -> Self {
        Self {
            status_code: 0,
            headers: HashMap::new(),
            body: String::new(),
            size_bytes: 0,
            elapsed_ms,
            error: Some(error),
        }
    }
}

/// Shared HTTP client with the engine's dispatch policy baked in: pooled
/// connections, at most 10 redirect hops, gzip/brotli decoding and a
/// per-request timeout of 30 s unless `RMETER_HTTP_TIMEOUT_SECS` overrides it.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    inner: reqwest::Client,
}

impl Dispatcher {
    pub fn new() -> Result<Self, EngineError> {
        Self::with_timeout(configured_timeout(std::env::var(HTTP_TIMEOUT_ENV).ok()))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, EngineError> {
        let mut default_headers = reqwest::header::HeaderMap::new();
        default_headers.insert(reqwest::header::ACCEPT, "*/*".parse().expect("static header"));

        let inner = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent("rmeter/1")
            .default_headers(default_headers)
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(|e| EngineError::Fatal(format!("failed to build http client: {e}")))?;
        Ok(Self { inner })
    }

    /// Send exactly one request and collect the response. The returned
    /// elapsed time covers connect through body read, or time to failure.
    pub async fn send(&self, request: &OutboundRequest) -> RawResponse {
        let start = Instant::now();
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Options => reqwest::Method::OPTIONS,
        };

        let mut builder = self.inner.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = match body {
                RequestBody::Json(text) => builder
                    .header_if_absent(&request.headers, "content-type", "application/json")
                    .body(text.clone()),
                RequestBody::Xml(text) => builder
                    .header_if_absent(&request.headers, "content-type", "application/xml")
                    .body(text.clone()),
                RequestBody::Raw(text) => builder.body(text.clone()),
                RequestBody::Form(pairs) => builder.form(pairs),
            };
        }

        let mut response = match builder.send().await {
            Ok(r) => r,
            Err(e) => {
                return RawResponse::failure(
                    format!("network error: {e}"),
                    start.elapsed().as_millis() as u64,
                )
            }
        };

        let status_code = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_lowercase(), v.to_string()))
            })
            .collect();

        // Stream the body: the full size is counted, but only the first
        // MAX_EVAL_BODY_BYTES are retained for evaluation, so an oversized
        // response cannot balloon memory.
        let mut size_bytes = 0u64;
        let mut retained: Vec<u8> = Vec::new();
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    size_bytes += chunk.len() as u64;
                    if retained.len() < MAX_EVAL_BODY_BYTES {
                        let room = MAX_EVAL_BODY_BYTES - retained.len();
                        retained.extend_from_slice(&chunk[..chunk.len().min(room)]);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    return RawResponse::failure(
                        format!("error reading response body: {e}"),
                        start.elapsed().as_millis() as u64,
                    )
                }
            }
        }
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let body = String::from_utf8_lossy(&retained).into_owned();

        RawResponse {
            status_code,
            headers,
            body,
            size_bytes,
            elapsed_ms,
            error: None,
        }
    }
}

trait HeaderIfAbsent {
    fn header_if_absent(
        self,
        present: &HashMap<String, String>,
        name: &str,
        value: &'static str,
    ) -> Self;
}

impl HeaderIfAbsent for reqwest::RequestBuilder {
    fn header_if_absent(
        self,
        present: &HashMap<String, String>,
        name: &str,
        value: &'static str,
    ) -> Self {
        if present.keys().any(|k| k.eq_ignore_ascii_case(name)) {
            self
        } else {
            self.header(name, value)
        }
    }
}

fn configured_timeout(env_value: Option<String>) -> Duration {
    let default = Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS);
    let Some(raw) = env_value else {
        return default;
    };
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Duration::from_secs(secs),
        _ => {
            event!(
                target: CRATE_NAME,
                Level::WARN,
                value = %raw,
                "ignoring invalid {HTTP_TIMEOUT_ENV}"
            );
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_defaults_to_thirty_seconds() {
        assert_eq!(configured_timeout(None), Duration::from_secs(30));
    }

    #[test]
    fn timeout_env_override() {
        assert_eq!(
            configured_timeout(Some("5".into())),
            Duration::from_secs(5)
        );
        assert_eq!(
            configured_timeout(Some(" 120 ".into())),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn invalid_timeout_values_fall_back() {
        for raw in ["", "abc", "0", "-3", "1.5"] {
            assert_eq!(
                configured_timeout(Some(raw.into())),
                Duration::from_secs(30),
                "value {raw:?} should fall back"
            );
        }
    }

    #[tokio::test]
    async fn transport_failure_yields_status_zero() {
        let dispatcher = Dispatcher::with_timeout(Duration::from_secs(2)).unwrap();
        // Port 1 is never listening; the connect fails immediately.
        let request = OutboundRequest {
            method: HttpMethod::Get,
            url: "http://127.0.0.1:1/".into(),
            headers: HashMap::new(),
            body: None,
        };
        let response = dispatcher.send(&request).await;
        assert_eq!(response.status_code, 0);
        assert_eq!(response.size_bytes, 0);
        assert!(response.error.is_some());
        assert!(response.headers.is_empty());
    }

    #[tokio::test]
    async fn invalid_url_is_a_transport_error() {
        let dispatcher = Dispatcher::with_timeout(Duration::from_secs(2)).unwrap();
        let request = OutboundRequest {
            method: HttpMethod::Get,
            url: "http://${unresolved}/".into(),
            headers: HashMap::new(),
            body: None,
        };
        let response = dispatcher.send(&request).await;
        assert_eq!(response.status_code, 0);
        assert!(response.error.is_some());
    }
}
