//! Rate limit response headers.
//!
//! Renders the legacy `X-RateLimit-*` set and one of three revisions of the
//! IETF `RateLimit` header drafts. Every writer is a no-op once the response
//! headers have been sent.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use http::header::{HeaderName, RETRY_AFTER};
use sha2::{Digest, Sha256};

use super::exchange::Response;
use super::info::RateLimitInfo;

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
const RATELIMIT_POLICY: HeaderName = HeaderName::from_static("ratelimit-policy");
const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
const RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");
const RATELIMIT: HeaderName = HeaderName::from_static("ratelimit");

/// Draft identifiers accepted for `standard_headers`.
pub const SUPPORTED_DRAFTS: [&str; 3] = ["draft-6", "draft-7", "draft-8"];

/// Which IETF rate limit header draft to emit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StandardHeaders {
    /// No standard headers
    #[default]
    Off,
    /// Separate `RateLimit-Limit`/`-Remaining`/`-Reset` plus `RateLimit-Policy`
    Draft6,
    /// Combined `RateLimit` header plus `RateLimit-Policy`
    Draft7,
    /// Named `RateLimit` and `RateLimit-Policy` entries per limiter
    Draft8,
}

impl FromStr for StandardHeaders {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft-6" => Ok(StandardHeaders::Draft6),
            "draft-7" => Ok(StandardHeaders::Draft7),
            "draft-8" => Ok(StandardHeaders::Draft8),
            other => Err(format!(
                "unsupported standard headers draft `{other}`, expected one of: {}",
                SUPPORTED_DRAFTS.join(", ")
            )),
        }
    }
}

impl fmt::Display for StandardHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StandardHeaders::Off => "off",
            StandardHeaders::Draft6 => "draft-6",
            StandardHeaders::Draft7 => "draft-7",
            StandardHeaders::Draft8 => "draft-8",
        };
        f.write_str(name)
    }
}

/// Window length in whole seconds, rounded up.
pub fn window_seconds(window: Duration) -> u64 {
    window.as_millis().div_ceil(1000) as u64
}

/// Seconds until `reset_time`, or the whole window when it is unknown.
pub fn reset_seconds(window: Duration, reset_time: Option<DateTime<Utc>>) -> u64 {
    match reset_time {
        Some(reset) => {
            let millis = (reset - Utc::now()).num_milliseconds().max(0) as u64;
            millis.div_ceil(1000)
        }
        None => window_seconds(window),
    }
}

/// Partition key for draft-8 policies: base64 of a truncated SHA-256 hex digest.
fn partition_key(key: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(key.as_bytes()));
    base64::engine::general_purpose::STANDARD.encode(&digest[..12])
}

/// `X-RateLimit-Limit`, `X-RateLimit-Remaining`, `X-RateLimit-Reset`.
pub fn set_legacy_headers(response: &mut Response, info: &RateLimitInfo) {
    if response.headers_sent() {
        return;
    }

    response.set_header(X_RATELIMIT_LIMIT, info.limit);
    response.set_header(X_RATELIMIT_REMAINING, info.remaining);

    if let Some(reset) = info.reset_time {
        // Epoch seconds, rounded up
        let reset_epoch = (reset.timestamp_millis().max(0) as u64).div_ceil(1000);
        response.set_header(X_RATELIMIT_RESET, reset_epoch);
    }
}

/// Draft-6: policy plus separate limit/remaining/reset headers.
pub fn set_draft6_headers(response: &mut Response, info: &RateLimitInfo, window: Duration) {
    if response.headers_sent() {
        return;
    }

    response.set_header(
        RATELIMIT_POLICY,
        format!("{};w={}", info.limit, window_seconds(window)),
    );
    response.set_header(RATELIMIT_LIMIT, info.limit);
    response.set_header(RATELIMIT_REMAINING, info.remaining);

    if info.reset_time.is_some() {
        response.set_header(RATELIMIT_RESET, reset_seconds(window, info.reset_time));
    }
}

/// Draft-7: policy plus one combined `RateLimit` header.
pub fn set_draft7_headers(response: &mut Response, info: &RateLimitInfo, window: Duration) {
    if response.headers_sent() {
        return;
    }

    let reset = reset_seconds(window, info.reset_time);
    response.set_header(
        RATELIMIT_POLICY,
        format!("{};w={}", info.limit, window_seconds(window)),
    );
    response.set_header(
        RATELIMIT,
        format!("limit={}, remaining={}, reset={}", info.limit, info.remaining, reset),
    );
}

/// Draft-8: named policy and state entries, appended so several limiters
/// can report on the same response.
pub fn set_draft8_headers(
    response: &mut Response,
    info: &RateLimitInfo,
    window: Duration,
    name: &str,
    key: &str,
) {
    if response.headers_sent() {
        return;
    }

    let reset = reset_seconds(window, info.reset_time);
    response.append_header(
        RATELIMIT_POLICY,
        format!(
            "\"{}\"; q={}; w={}; pk=:{}:",
            name,
            info.limit,
            window_seconds(window),
            partition_key(key)
        ),
    );
    response.append_header(
        RATELIMIT,
        format!("\"{}\"; r={}; t={}", name, info.remaining, reset),
    );
}

/// `Retry-After` in seconds, sent on blocked requests.
pub fn set_retry_after_header(response: &mut Response, info: &RateLimitInfo, window: Duration) {
    if response.headers_sent() {
        return;
    }

    response.set_header(RETRY_AFTER, reset_seconds(window, info.reset_time));
}
