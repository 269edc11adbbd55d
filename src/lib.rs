//! Ratewall - Request Rate Limiting Engine
//!
//! This crate decides, per inbound HTTP request, whether a client has used
//! up its quota for the current window. Clients are identified by a key
//! (by default their address, with IPv6 collapsed to a subnet), hits are
//! counted in a pluggable [`Store`](ratelimit::Store), and the outcome is
//! reported back through standard rate limit response headers.
//!
//! Host frameworks adapt their request and response types to
//! [`Request`](ratelimit::Request) and [`Response`](ratelimit::Response),
//! then call [`RateLimiter::evaluate`](ratelimit::RateLimiter::evaluate) or
//! [`RateLimiter::run`](ratelimit::RateLimiter::run).

pub mod config;
pub mod error;
pub mod ratelimit;

pub use error::{RateLimitError, Result, StoreError};
pub use ratelimit::{Options, RateLimiter};
