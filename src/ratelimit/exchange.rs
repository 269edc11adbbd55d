//! The request/response surface a host framework adapts to.
//!
//! The limiter only reads a handful of request attributes and writes status,
//! headers and body on the response. Hosts copy those fields in and out of
//! their own types.

use std::collections::HashMap;
use std::future::Future;

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode, Uri};
use tracing::warn;

use super::info::RateLimitInfo;

tokio::task_local! {
    static REQUEST_SCOPE: ();
}

/// Run `future` as part of handling a request.
///
/// Limiters constructed inside this scope are reported by the
/// `creationStack` validation check.
pub async fn within_request<F: Future>(future: F) -> F::Output {
    REQUEST_SCOPE.scope((), future).await
}

/// Whether the current task is handling a request.
pub(crate) fn in_request_scope() -> bool {
    REQUEST_SCOPE.try_with(|_| ()).is_ok()
}

/// The host's policy for trusting `X-Forwarded-For`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TrustProxy {
    /// Never trust forwarding headers
    #[default]
    Off,
    /// Trust every hop, which lets any client choose its own address
    All,
    /// Trust this many hops from the socket peer
    Hops(u32),
    /// Trust the listed proxy addresses
    Addresses(Vec<String>),
}

/// An inbound request as seen by the limiter.
#[derive(Debug, Default)]
pub struct Request {
    /// Request method
    pub method: Method,
    /// Request target
    pub uri: Uri,
    /// Request headers
    pub headers: HeaderMap,
    /// Client address as resolved by the host, possibly malformed
    pub client_ip: Option<String>,
    /// Host forwarding-header policy
    pub trust_proxy: TrustProxy,
    rate_limits: HashMap<String, RateLimitInfo>,
    counted: HashMap<String, Vec<String>>,
}

impl Request {
    /// Create an empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a request from the given client address.
    pub fn from_ip(ip: impl Into<String>) -> Self {
        Self {
            client_ip: Some(ip.into()),
            ..Self::default()
        }
    }

    /// Set a request header.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        let Ok(header) = HeaderName::from_bytes(name.as_bytes()) else {
            warn!(header = name, "Ignoring invalid request header name");
            return self;
        };
        match HeaderValue::from_str(value) {
            Ok(value) => {
                self.headers.insert(header, value);
            }
            Err(_) => warn!(header = name, "Ignoring invalid request header value"),
        }
        self
    }

    /// Set the forwarding-header policy.
    pub fn with_trust_proxy(mut self, trust_proxy: TrustProxy) -> Self {
        self.trust_proxy = trust_proxy;
        self
    }

    /// Get a request header as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The rate limit outcome attached under `property`.
    pub fn rate_limit(&self, property: &str) -> Option<&RateLimitInfo> {
        self.rate_limits.get(property)
    }

    pub(crate) fn set_rate_limit(&mut self, property: &str, info: RateLimitInfo) {
        self.rate_limits.insert(property.to_string(), info);
    }

    /// Record that `key` was counted in `store`.
    ///
    /// Returns `false` if the same pair was already recorded for this request.
    pub(crate) fn record_count(&mut self, store: &str, key: &str) -> bool {
        let keys = self.counted.entry(store.to_string()).or_default();
        if keys.iter().any(|k| k == key) {
            return false;
        }
        keys.push(key.to_string());
        true
    }
}

/// The outbound response the limiter writes to.
#[derive(Debug, Clone, Default)]
pub struct Response {
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Body, if one was sent
    pub body: Option<serde_json::Value>,
    headers_sent: bool,
    finished: bool,
}

impl Response {
    /// Create an empty `200 OK` response.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether headers have already gone out on the wire.
    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// Whether the response has been fully written.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Mark headers as sent; later header writes are ignored.
    pub fn mark_headers_sent(&mut self) {
        self.headers_sent = true;
    }

    /// Mark the response as fully written.
    pub fn finish(&mut self) {
        self.headers_sent = true;
        self.finished = true;
    }

    /// Write a status and body and finish the response.
    pub fn send(&mut self, status: StatusCode, body: serde_json::Value) {
        self.status = status;
        self.body = Some(body);
        self.finish();
    }

    /// Replace a header. Values that are not valid header text are dropped.
    pub fn set_header(&mut self, name: HeaderName, value: impl ToString) {
        if let Some(value) = header_value(&name, value) {
            self.headers.insert(name, value);
        }
    }

    /// Add a header alongside any existing values.
    pub fn append_header(&mut self, name: HeaderName, value: impl ToString) {
        if let Some(value) = header_value(&name, value) {
            self.headers.append(name, value);
        }
    }

    /// Get a header as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

fn header_value(name: &HeaderName, value: impl ToString) -> Option<HeaderValue> {
    match HeaderValue::from_str(&value.to_string()) {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(header = %name, "Dropping invalid response header value");
            None
        }
    }
}

/// What the host should do after the limiter has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Continue to the next handler
    Next,
    /// The response is complete; do not call the next handler
    Stop,
}

/// Response lifecycle notifications forwarded by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseEvent {
    /// The response was written completely
    Finish,
    /// The connection closed, possibly before the response finished
    Close,
    /// The transport failed while writing the response
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_count_detects_repeats() {
        let mut request = Request::from_ip("1.2.3.4");
        assert!(request.record_count("store-a", "key"));
        assert!(request.record_count("store-b", "key"));
        assert!(!request.record_count("store-a", "key"));
    }

    #[test]
    fn test_request_headers() {
        let request = Request::new().with_header("x-forwarded-for", "10.0.0.1");
        assert_eq!(request.header("x-forwarded-for"), Some("10.0.0.1"));
        assert_eq!(request.header("X-Forwarded-For"), Some("10.0.0.1"));
        assert_eq!(request.client_ip, None);
    }

    #[test]
    fn test_request_header_names_are_normalized() {
        let request = Request::new()
            .with_header("X-Api-Key", "abc")
            .with_header("bad header", "ignored")
            .with_header("x-token", "bad\nvalue");
        assert_eq!(request.header("x-api-key"), Some("abc"));
        assert_eq!(request.headers.len(), 1);
    }

    #[test]
    fn test_response_send_finishes() {
        let mut response = Response::new();
        assert!(!response.headers_sent());

        response.send(StatusCode::TOO_MANY_REQUESTS, serde_json::json!("slow down"));

        assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers_sent());
        assert!(response.is_finished());
    }

    #[test]
    fn test_set_and_append_headers() {
        let mut response = Response::new();
        let name = HeaderName::from_static("ratelimit");
        response.set_header(name.clone(), "a");
        response.set_header(name.clone(), "b");
        assert_eq!(response.headers.get_all(&name).iter().count(), 1);

        response.append_header(name.clone(), "c");
        assert_eq!(response.headers.get_all(&name).iter().count(), 2);

        response.set_header(name.clone(), "bad\nvalue");
        assert_eq!(response.header("ratelimit"), Some("b"));
    }

    #[tokio::test]
    async fn test_request_scope() {
        assert!(!in_request_scope());
        assert!(within_request(async { in_request_scope() }).await);
    }
}
