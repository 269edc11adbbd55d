//! Limiter options and their resolution into an immutable configuration.
//!
//! [`Options`] is a partial, builder-style configuration. Resolving it fills
//! in defaults, folds the legacy `max`/`headers` aliases into `limit` and
//! `legacy_headers`, checks the store against the requested features, and
//! hands the store its window.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use http::StatusCode;
use serde_json::Value;
use tracing::debug;

use super::exchange::{Request, Response};
use super::headers::{window_seconds, StandardHeaders};
use super::info::RateLimitInfo;
use super::key::{default_key, DEFAULT_IPV6_SUBNET};
use super::memory::MemoryStore;
use super::store::{Store, StoreOptions};
use super::validation::{
    ValidateConfig, ValidationHook, ValidationResult, Validations, MAX_WINDOW_MS,
};
use crate::config::{Ipv6SubnetSetting, RateLimitSettings, StandardHeadersSetting, ValidateSetting};
use crate::error::{BoxError, RateLimitError, Result};

/// Default window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(60_000);
/// Default number of requests allowed per window.
pub const DEFAULT_LIMIT: u64 = 5;
/// Default body sent with a rejection.
pub const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";
/// Default request property the outcome is attached under.
pub const DEFAULT_REQUEST_PROPERTY: &str = "rateLimit";

/// A per-request resolver.
pub type RequestFn<T> =
    Arc<dyn for<'a> Fn(&'a Request) -> BoxFuture<'a, std::result::Result<T, BoxError>> + Send + Sync>;

/// A resolver that also sees the finished response.
pub type ResponseFn<T> = Arc<
    dyn for<'a> Fn(&'a Request, &'a Response) -> BoxFuture<'a, std::result::Result<T, BoxError>>
        + Send
        + Sync,
>;

/// Sends the rejection for a blocked request.
pub type Handler =
    Arc<dyn Fn(&Request, &mut Response, &Rejection) -> std::result::Result<(), BoxError> + Send + Sync>;

/// Called once per window when a client first goes over the limit.
pub type LimitReachedFn = Arc<dyn Fn(&Request, &RateLimitInfo) + Send + Sync>;

/// A value that is either fixed or computed per request.
pub enum Setting<T> {
    /// Same value for every request
    Fixed(T),
    /// Computed from the request, possibly asynchronously
    Dynamic(RequestFn<T>),
}

impl<T> Setting<T> {
    /// Compute the value with an async resolver.
    pub fn dynamic<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a Request) -> BoxFuture<'a, std::result::Result<T, BoxError>>
            + Send
            + Sync
            + 'static,
    {
        Setting::Dynamic(Arc::new(f))
    }

    /// Compute the value with a synchronous, fallible function.
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&Request) -> std::result::Result<T, BoxError> + Send + Sync + 'static,
        T: Send + 'static,
    {
        Setting::dynamic(move |request| {
            let value = f(request);
            Box::pin(futures::future::ready(value))
        })
    }
}

impl<T: Clone> Setting<T> {
    /// Resolve the value for `request`. Resolver errors are passed through.
    pub async fn resolve(&self, request: &Request) -> Result<T> {
        match self {
            Setting::Fixed(value) => Ok(value.clone()),
            Setting::Dynamic(resolver) => resolver(request).await.map_err(RateLimitError::Callback),
        }
    }
}

impl<T: Clone> Clone for Setting<T> {
    fn clone(&self) -> Self {
        match self {
            Setting::Fixed(value) => Setting::Fixed(value.clone()),
            Setting::Dynamic(resolver) => Setting::Dynamic(resolver.clone()),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Setting<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Setting::Fixed(value) => f.debug_tuple("Fixed").field(value).finish(),
            Setting::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl<T> From<T> for Setting<T> {
    fn from(value: T) -> Self {
        Setting::Fixed(value)
    }
}

/// What a blocked request is answered with.
#[derive(Debug, Clone)]
pub struct Rejection {
    /// Status code to send
    pub status_code: StatusCode,
    /// Resolved message body
    pub message: Value,
    /// Outcome of the count that triggered the rejection
    pub info: RateLimitInfo,
}

/// Send the configured status and message, unless the response is already done.
pub fn default_handler(
    _request: &Request,
    response: &mut Response,
    rejection: &Rejection,
) -> std::result::Result<(), BoxError> {
    if !response.is_finished() {
        response.send(rejection.status_code, rejection.message.clone());
    }
    Ok(())
}

/// How client keys are derived.
#[derive(Clone)]
pub enum KeyGenerator {
    /// Client address, with IPv6 collapsed to `ipv6_subnet` bits when set
    Default {
        /// Prefix length, or `None` to use full addresses
        ipv6_subnet: Option<u8>,
    },
    /// User-supplied resolver
    Custom(RequestFn<String>),
}

impl KeyGenerator {
    /// Derive the key for `request`.
    pub async fn key(&self, request: &Request) -> Result<String> {
        match self {
            KeyGenerator::Default { ipv6_subnet } => Ok(default_key(request, *ipv6_subnet)),
            KeyGenerator::Custom(generate) => {
                generate(request).await.map_err(RateLimitError::Callback)
            }
        }
    }

    /// Whether the user supplied the generator.
    pub fn is_custom(&self) -> bool {
        matches!(self, KeyGenerator::Custom(_))
    }
}

impl fmt::Debug for KeyGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyGenerator::Default { ipv6_subnet } => f
                .debug_struct("Default")
                .field("ipv6_subnet", ipv6_subnet)
                .finish(),
            KeyGenerator::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Debug, Clone)]
enum HeaderSelection {
    Draft(StandardHeaders),
    Named(String),
}

/// Partial limiter configuration.
///
/// Every field is optional; unset fields take their defaults when the
/// limiter is built.
#[derive(Clone, Default)]
pub struct Options {
    window: Option<Duration>,
    limit: Option<Setting<u64>>,
    max: Option<Setting<u64>>,
    message: Option<Setting<Value>>,
    status_code: Option<StatusCode>,
    invalid_status_code: Option<u16>,
    legacy_headers: Option<bool>,
    headers: Option<bool>,
    standard_headers: Option<HeaderSelection>,
    identifier: Option<Setting<String>>,
    store: Option<Arc<dyn Store>>,
    pass_on_store_error: Option<bool>,
    key_generator: Option<RequestFn<String>>,
    ipv6_subnet: Option<Option<u8>>,
    request_property_name: Option<String>,
    skip: Option<Setting<bool>>,
    skip_successful_requests: Option<bool>,
    skip_failed_requests: Option<bool>,
    request_was_successful: Option<ResponseFn<bool>>,
    handler: Option<Handler>,
    on_limit_reached: Option<LimitReachedFn>,
    validate: Option<ValidateConfig>,
    on_validation: Option<ValidationHook>,
    unknown_options: Vec<String>,
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("window", &self.window)
            .field("limit", &self.limit)
            .field("max", &self.max)
            .field("status_code", &self.status_code)
            .field("legacy_headers", &self.legacy_headers)
            .field("standard_headers", &self.standard_headers)
            .field("ipv6_subnet", &self.ipv6_subnet)
            .field("validate", &self.validate)
            .finish_non_exhaustive()
    }
}

impl Options {
    /// Create empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lift file-loaded settings into options. Callbacks are attached afterwards.
    pub fn from_settings(settings: RateLimitSettings) -> Self {
        let mut options = Options::new();

        options.window = settings.window_ms.map(Duration::from_millis);
        options.limit = settings.limit.map(Setting::Fixed);
        options.max = settings.max.map(Setting::Fixed);
        options.message = settings.message.map(Setting::Fixed);
        if let Some(code) = settings.status_code {
            match StatusCode::from_u16(code) {
                Ok(status) => options.status_code = Some(status),
                Err(_) => options.invalid_status_code = Some(code),
            }
        }
        options.legacy_headers = settings.legacy_headers;
        options.headers = settings.headers;
        options.standard_headers = settings.standard_headers.map(|selection| match selection {
            StandardHeadersSetting::Enabled(true) => HeaderSelection::Draft(StandardHeaders::Draft6),
            StandardHeadersSetting::Enabled(false) => HeaderSelection::Draft(StandardHeaders::Off),
            StandardHeadersSetting::Draft(name) => HeaderSelection::Named(name),
        });
        options.identifier = settings.identifier.map(Setting::Fixed);
        options.pass_on_store_error = settings.pass_on_store_error;
        options.request_property_name = settings.request_property_name;
        options.skip_successful_requests = settings.skip_successful_requests;
        options.skip_failed_requests = settings.skip_failed_requests;
        options.validate = settings.validate.map(|validate| match validate {
            ValidateSetting::All(enabled) => ValidateConfig::All(enabled),
            ValidateSetting::PerCheck(checks) => ValidateConfig::from(checks),
        });
        options.ipv6_subnet = settings.ipv6_subnet.map(|subnet| match subnet {
            Ipv6SubnetSetting::Prefix(bits) => Some(bits),
            Ipv6SubnetSetting::Enabled(true) => Some(DEFAULT_IPV6_SUBNET),
            Ipv6SubnetSetting::Enabled(false) => None,
        });
        if let Some(buckets) = settings.memory_buckets {
            options.store = Some(Arc::new(MemoryStore::bucketed(buckets)));
        }
        options.unknown_options = settings.unknown.into_keys().collect();

        options
    }

    /// Length of the counting window.
    pub fn window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    /// Requests allowed per window.
    pub fn limit(self, limit: u64) -> Self {
        self.limit_with(Setting::Fixed(limit))
    }

    /// Requests allowed per window, possibly computed per request.
    pub fn limit_with(mut self, limit: Setting<u64>) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Legacy alias for [`Options::limit`]; `limit` wins when both are set.
    pub fn max(mut self, max: u64) -> Self {
        self.max = Some(Setting::Fixed(max));
        self
    }

    /// Body sent with a rejection.
    pub fn message(self, message: impl Into<Value>) -> Self {
        self.message_with(Setting::Fixed(message.into()))
    }

    /// Body sent with a rejection, possibly computed per request.
    pub fn message_with(mut self, message: Setting<Value>) -> Self {
        self.message = Some(message);
        self
    }

    /// Status code sent with a rejection.
    pub fn status_code(mut self, status_code: StatusCode) -> Self {
        self.status_code = Some(status_code);
        self
    }

    /// Emit the `X-RateLimit-*` headers.
    pub fn legacy_headers(mut self, enabled: bool) -> Self {
        self.legacy_headers = Some(enabled);
        self
    }

    /// Legacy alias for [`Options::legacy_headers`].
    pub fn headers(mut self, enabled: bool) -> Self {
        self.headers = Some(enabled);
        self
    }

    /// Emit one of the IETF header drafts.
    pub fn standard_headers(mut self, draft: StandardHeaders) -> Self {
        self.standard_headers = Some(HeaderSelection::Draft(draft));
        self
    }

    /// Select a header draft by name, e.g. `"draft-7"`.
    pub fn standard_headers_named(mut self, draft: impl Into<String>) -> Self {
        self.standard_headers = Some(HeaderSelection::Named(draft.into()));
        self
    }

    /// Policy name used by draft-8 headers.
    pub fn identifier(self, identifier: impl Into<String>) -> Self {
        self.identifier_with(Setting::Fixed(identifier.into()))
    }

    /// Policy name used by draft-8 headers, possibly computed per request.
    pub fn identifier_with(mut self, identifier: Setting<String>) -> Self {
        self.identifier = Some(identifier);
        self
    }

    /// Counting store. Each limiter needs its own instance.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Let requests through when the store fails.
    pub fn pass_on_store_error(mut self, enabled: bool) -> Self {
        self.pass_on_store_error = Some(enabled);
        self
    }

    /// Derive client keys with an async resolver.
    pub fn key_generator_with<F>(mut self, generator: F) -> Self
    where
        F: for<'a> Fn(&'a Request) -> BoxFuture<'a, std::result::Result<String, BoxError>>
            + Send
            + Sync
            + 'static,
    {
        self.key_generator = Some(Arc::new(generator));
        self
    }

    /// Derive client keys with a synchronous function.
    pub fn key_generator<F>(self, generator: F) -> Self
    where
        F: Fn(&Request) -> std::result::Result<String, BoxError> + Send + Sync + 'static,
    {
        self.key_generator_with(move |request| {
            let key = generator(request);
            Box::pin(futures::future::ready(key))
        })
    }

    /// Prefix length IPv6 addresses are collapsed to by the default key generator.
    pub fn ipv6_subnet(mut self, bits: u8) -> Self {
        self.ipv6_subnet = Some(Some(bits));
        self
    }

    /// Key IPv6 clients by their full address.
    pub fn disable_ipv6_subnet(mut self) -> Self {
        self.ipv6_subnet = Some(None);
        self
    }

    /// Property the outcome is attached to the request under.
    pub fn request_property_name(mut self, name: impl Into<String>) -> Self {
        self.request_property_name = Some(name.into());
        self
    }

    /// Bypass the limiter for requests matching `predicate`.
    pub fn skip<F>(self, predicate: F) -> Self
    where
        F: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        self.skip_with(Setting::computed(move |request| Ok(predicate(request))))
    }

    /// Bypass the limiter with a fixed or async predicate.
    pub fn skip_with(mut self, skip: Setting<bool>) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Uncount requests that end successfully.
    pub fn skip_successful_requests(mut self, enabled: bool) -> Self {
        self.skip_successful_requests = Some(enabled);
        self
    }

    /// Uncount requests that fail.
    pub fn skip_failed_requests(mut self, enabled: bool) -> Self {
        self.skip_failed_requests = Some(enabled);
        self
    }

    /// Decide success with an async predicate over the finished response.
    pub fn request_was_successful_with<F>(mut self, predicate: F) -> Self
    where
        F: for<'a> Fn(&'a Request, &'a Response) -> BoxFuture<'a, std::result::Result<bool, BoxError>>
            + Send
            + Sync
            + 'static,
    {
        self.request_was_successful = Some(Arc::new(predicate));
        self
    }

    /// Decide success with a synchronous predicate over the finished response.
    pub fn request_was_successful<F>(self, predicate: F) -> Self
    where
        F: Fn(&Request, &Response) -> bool + Send + Sync + 'static,
    {
        self.request_was_successful_with(move |request, response| {
            let successful = predicate(request, response);
            Box::pin(futures::future::ready(Ok(successful)))
        })
    }

    /// Replace the rejection handler.
    pub fn handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Request, &mut Response, &Rejection) -> std::result::Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Deprecated: called when a client first goes over the limit.
    pub fn on_limit_reached<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Request, &RateLimitInfo) + Send + Sync + 'static,
    {
        self.on_limit_reached = Some(Arc::new(callback));
        self
    }

    /// Enable or disable validation checks.
    pub fn validate(mut self, validate: impl Into<ValidateConfig>) -> Self {
        self.validate = Some(validate.into());
        self
    }

    /// Observe every validation result in addition to the log output.
    pub fn on_validation<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ValidationResult) + Send + Sync + 'static,
    {
        self.on_validation = Some(Arc::new(hook));
        self
    }

    /// Build the validation checks these options ask for.
    pub(crate) fn validations(&self) -> Validations {
        Validations::new(
            self.validate.clone().unwrap_or_default(),
            self.on_validation.clone(),
        )
    }
}

/// Fully resolved, immutable limiter configuration.
#[derive(Clone)]
pub struct ResolvedConfig {
    /// Length of the counting window
    pub window: Duration,
    /// Requests allowed per window
    pub limit: Setting<u64>,
    /// Body sent with a rejection
    pub message: Setting<Value>,
    /// Status code sent with a rejection
    pub status_code: StatusCode,
    /// Emit `X-RateLimit-*` headers
    pub legacy_headers: bool,
    /// IETF header draft to emit
    pub standard_headers: StandardHeaders,
    /// Draft-8 policy name; `None` means `"{limit}-in-{secs}sec"`
    pub identifier: Option<Setting<String>>,
    /// Counting store
    pub store: Arc<dyn Store>,
    /// Let requests through when the store fails
    pub pass_on_store_error: bool,
    /// Client key derivation
    pub key_generator: KeyGenerator,
    /// Request property the outcome is attached under
    pub request_property_name: String,
    /// Bypass predicate
    pub skip: Setting<bool>,
    /// Uncount successful requests
    pub skip_successful_requests: bool,
    /// Uncount failed requests
    pub skip_failed_requests: bool,
    /// Success predicate; `None` means status below 400
    pub request_was_successful: Option<ResponseFn<bool>>,
    /// Rejection handler
    pub handler: Handler,
    /// Deprecated limit-reached callback
    pub on_limit_reached: Option<LimitReachedFn>,
}

impl fmt::Debug for ResolvedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedConfig")
            .field("window", &self.window)
            .field("limit", &self.limit)
            .field("message", &self.message)
            .field("status_code", &self.status_code)
            .field("legacy_headers", &self.legacy_headers)
            .field("standard_headers", &self.standard_headers)
            .field("identifier", &self.identifier)
            .field("pass_on_store_error", &self.pass_on_store_error)
            .field("key_generator", &self.key_generator)
            .field("request_property_name", &self.request_property_name)
            .field("skip", &self.skip)
            .field("skip_successful_requests", &self.skip_successful_requests)
            .field("skip_failed_requests", &self.skip_failed_requests)
            .finish_non_exhaustive()
    }
}

impl ResolvedConfig {
    /// Resolve `options`, running the construction-time checks in `validations`.
    pub fn resolve(options: Options, validations: &Validations) -> Result<Self> {
        validations.creation_stack();
        validations.validations_config();
        validations.unknown_options(&options.unknown_options);
        validations.on_limit_reached(options.on_limit_reached.is_some());
        validations.ipv6_subnet_or_key_generator(
            options.key_generator.is_some() && options.ipv6_subnet.is_some(),
        );

        let window = options.window.unwrap_or(DEFAULT_WINDOW);
        if window.is_zero() {
            return Err(RateLimitError::Config(
                "window must be at least 1ms".to_string(),
            ));
        }
        validations.window_ms(window);
        if window.as_millis() > MAX_WINDOW_MS {
            return Err(RateLimitError::Config(format!(
                "window must be at most {MAX_WINDOW_MS}ms, got {}ms",
                window.as_millis()
            )));
        }
        if let Some(code) = options.invalid_status_code {
            return Err(RateLimitError::Config(format!(
                "status_code must be a valid HTTP status, got {code}"
            )));
        }

        let standard_headers = match options.standard_headers {
            None => StandardHeaders::Off,
            Some(HeaderSelection::Draft(draft)) => draft,
            Some(HeaderSelection::Named(name)) => {
                validations.headers_draft_version(&name);
                name.parse::<StandardHeaders>()
                    .map_err(RateLimitError::Config)?
            }
        };

        let ipv6_subnet = options.ipv6_subnet.unwrap_or(Some(DEFAULT_IPV6_SUBNET));
        if let Some(bits) = ipv6_subnet {
            if !(1..=128).contains(&bits) {
                return Err(RateLimitError::Config(format!(
                    "ipv6_subnet must be between 1 and 128, got {bits}"
                )));
            }
        }
        let key_generator = match options.key_generator {
            Some(generator) => KeyGenerator::Custom(generator),
            None => {
                validations.ipv6_subnet(ipv6_subnet);
                KeyGenerator::Default { ipv6_subnet }
            }
        };

        let skip_successful_requests = options.skip_successful_requests.unwrap_or(false);
        let skip_failed_requests = options.skip_failed_requests.unwrap_or(false);

        let store = options
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn Store>);
        if (skip_successful_requests || skip_failed_requests) && !store.capabilities().decrement {
            return Err(RateLimitError::Config(
                "the store must implement `decrement` to use skip_successful_requests or \
                 skip_failed_requests"
                    .to_string(),
            ));
        }
        validations.unshared_store(&store);
        store.init(&StoreOptions { window });

        let config = Self {
            window,
            limit: options
                .limit
                .or(options.max)
                .unwrap_or(Setting::Fixed(DEFAULT_LIMIT)),
            message: options
                .message
                .unwrap_or_else(|| Setting::Fixed(Value::String(DEFAULT_MESSAGE.to_string()))),
            status_code: options.status_code.unwrap_or(StatusCode::TOO_MANY_REQUESTS),
            legacy_headers: options.legacy_headers.or(options.headers).unwrap_or(true),
            standard_headers,
            identifier: options.identifier,
            store,
            pass_on_store_error: options.pass_on_store_error.unwrap_or(false),
            key_generator,
            request_property_name: options
                .request_property_name
                .unwrap_or_else(|| DEFAULT_REQUEST_PROPERTY.to_string()),
            skip: options.skip.unwrap_or(Setting::Fixed(false)),
            skip_successful_requests,
            skip_failed_requests,
            request_was_successful: options.request_was_successful,
            handler: options.handler.unwrap_or_else(|| Arc::new(default_handler)),
            on_limit_reached: options.on_limit_reached,
        };

        debug!(
            window_ms = config.window.as_millis() as u64,
            limit = ?config.limit,
            standard_headers = %config.standard_headers,
            legacy_headers = config.legacy_headers,
            "Resolved rate limiter options"
        );
        Ok(config)
    }

    /// Whether either uncounting flag is set.
    pub fn uncounts(&self) -> bool {
        self.skip_successful_requests || self.skip_failed_requests
    }

    /// Draft-8 policy name for a request with the given resolved limit.
    pub async fn resolve_identifier(&self, request: &Request, limit: u64) -> Result<String> {
        match &self.identifier {
            Some(identifier) => identifier.resolve(request).await,
            None => Ok(format!("{}-in-{}sec", limit, window_seconds(self.window))),
        }
    }

    /// Whether a finished request counts as successful.
    pub async fn was_successful(&self, request: &Request, response: &Response) -> Result<bool> {
        match &self.request_was_successful {
            Some(predicate) => predicate(request, response)
                .await
                .map_err(RateLimitError::Callback),
            None => Ok(response.status.as_u16() < 400),
        }
    }
}
