//! Rate limiting logic and state management.

mod exchange;
mod info;
mod key;
mod limiter;
mod memory;
mod options;
mod store;

pub mod headers;
pub mod validation;

pub use exchange::{within_request, Flow, Request, Response, ResponseEvent, TrustProxy};
pub use headers::StandardHeaders;
pub use info::RateLimitInfo;
pub use key::{ip_key, DEFAULT_IPV6_SUBNET};
pub use limiter::{CompletionHook, Evaluation, RateLimiter};
pub use memory::{MemoryStore, WindowStrategy};
pub use options::{
    default_handler, Handler, KeyGenerator, LimitReachedFn, Options, Rejection, RequestFn,
    ResolvedConfig, ResponseFn, Setting, DEFAULT_LIMIT, DEFAULT_MESSAGE,
    DEFAULT_REQUEST_PROPERTY, DEFAULT_WINDOW,
};
pub use store::{Capabilities, ClientRateLimitInfo, Store, StoreOptions};
pub use validation::{Severity, ValidateConfig, ValidationResult};
