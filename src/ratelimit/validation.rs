//! Misconfiguration diagnostics.
//!
//! Each check inspects either the options at construction time or the first
//! request a limiter sees, and logs what it finds. Checks never change
//! whether a request is allowed. After the first request the whole set turns
//! itself off; two requests racing through as "first" may both log, which is
//! harmless.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{error, warn};

use super::exchange::{in_request_scope, Request, TrustProxy};
use super::headers::SUPPORTED_DRAFTS;
use super::store::Store;

/// Largest window a timer can be scheduled for, in milliseconds.
pub const MAX_WINDOW_MS: u128 = i32::MAX as u128;

/// Names of every check, as accepted in the `validate` map.
pub const CHECKS: [&str; 17] = [
    "ip",
    "trustProxy",
    "xForwardedForHeader",
    "positiveHits",
    "unsharedStore",
    "singleCount",
    "limit",
    "headersDraftVersion",
    "headersResetTime",
    "validationsConfig",
    "creationStack",
    "keyGeneratorIpFallback",
    "ipv6Subnet",
    "ipv6SubnetOrKeyGenerator",
    "windowMs",
    "unknownOptions",
    "onLimitReached",
];

/// Stores bound to a limiter anywhere in this process.
static BOUND_STORES: Mutex<Vec<Weak<dyn Store>>> = parking_lot::const_mutex(Vec::new());

/// How serious a diagnostic is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Likely misconfiguration
    Error,
    /// Deprecated or surprising behavior
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => f.write_str("error"),
            Severity::Warning => f.write_str("warning"),
        }
    }
}

/// One diagnostic produced by a check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    /// Check name
    pub check: &'static str,
    /// Stable error code
    pub code: &'static str,
    /// Severity
    pub severity: Severity,
    /// Human-readable explanation
    pub message: String,
}

/// Observer called for every diagnostic, in addition to logging.
pub type ValidationHook = Arc<dyn Fn(&ValidationResult) + Send + Sync>;

/// Which checks are enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidateConfig {
    /// All checks on or all off
    All(bool),
    /// Per-check switches; unlisted checks use `default`
    PerCheck {
        /// Fallback for unlisted checks
        default: bool,
        /// Explicit switches keyed by check name
        checks: HashMap<String, bool>,
    },
}

impl Default for ValidateConfig {
    fn default() -> Self {
        ValidateConfig::All(true)
    }
}

impl From<bool> for ValidateConfig {
    fn from(enabled: bool) -> Self {
        ValidateConfig::All(enabled)
    }
}

impl From<HashMap<String, bool>> for ValidateConfig {
    fn from(mut checks: HashMap<String, bool>) -> Self {
        let default = checks.remove("default").unwrap_or(true);
        ValidateConfig::PerCheck { default, checks }
    }
}

impl ValidateConfig {
    fn allows(&self, check: &str) -> bool {
        match self {
            ValidateConfig::All(enabled) => *enabled,
            ValidateConfig::PerCheck { default, checks } => {
                checks.get(check).copied().unwrap_or(*default)
            }
        }
    }

    fn any_enabled(&self) -> bool {
        match self {
            ValidateConfig::All(enabled) => *enabled,
            ValidateConfig::PerCheck { default, checks } => {
                *default || checks.values().any(|enabled| *enabled)
            }
        }
    }
}

/// The set of checks owned by one limiter.
pub struct Validations {
    enabled: AtomicBool,
    config: ValidateConfig,
    hook: Option<ValidationHook>,
}

impl fmt::Debug for Validations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validations")
            .field("enabled", &self.enabled.load(Ordering::Relaxed))
            .field("config", &self.config)
            .finish()
    }
}

impl Validations {
    /// Create the checks for a limiter.
    pub fn new(config: ValidateConfig, hook: Option<ValidationHook>) -> Self {
        Self {
            enabled: AtomicBool::new(config.any_enabled()),
            config,
            hook,
        }
    }

    /// Whether any check can still run.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Turn every check off for good.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    fn runs(&self, check: &str) -> bool {
        self.is_enabled() && self.config.allows(check)
    }

    fn report(&self, check: &'static str, code: &'static str, severity: Severity, message: String) {
        match severity {
            Severity::Error => error!(check, code, "{}", message),
            Severity::Warning => warn!(check, code, "{}", message),
        }

        if let Some(hook) = &self.hook {
            hook(&ValidationResult {
                check,
                code,
                severity,
                message,
            });
        }
    }

    /// The client address is missing, unparsable, or carries a port.
    pub fn ip(&self, ip: Option<&str>) {
        if !self.runs("ip") {
            return;
        }

        match ip {
            None => self.report(
                "ip",
                "ERR_ERL_UNDEFINED_IP_ADDRESS",
                Severity::Error,
                "The request has no client address. This might indicate a misconfiguration \
                 or the connection being destroyed prematurely."
                    .to_string(),
            ),
            Some(ip) if ip.parse::<IpAddr>().is_ok() => {}
            Some(ip) if ip.parse::<SocketAddr>().is_ok() => self.report(
                "ip",
                "ERR_ERL_INVALID_IP_ADDRESS",
                Severity::Error,
                format!(
                    "The client address ({ip}) includes a port, so every connection gets its \
                     own key. Strip the port or supply a custom key generator."
                ),
            ),
            Some(ip) => self.report(
                "ip",
                "ERR_ERL_INVALID_IP_ADDRESS",
                Severity::Error,
                format!(
                    "An invalid client address ({ip}) was detected. Consider supplying a custom \
                     key generator."
                ),
            ),
        }
    }

    /// The host trusts every forwarding hop.
    pub fn trust_proxy(&self, request: &Request) {
        if !self.runs("trustProxy") || request.trust_proxy != TrustProxy::All {
            return;
        }

        self.report(
            "trustProxy",
            "ERR_ERL_PERMISSIVE_TRUST_PROXY",
            Severity::Error,
            "The trust proxy setting trusts every hop, which lets anyone trivially bypass \
             IP-based rate limiting."
                .to_string(),
        );
    }

    /// `X-Forwarded-For` is present but the host ignores it.
    pub fn x_forwarded_for_header(&self, request: &Request) {
        if !self.runs("xForwardedForHeader")
            || request.trust_proxy != TrustProxy::Off
            || request.header("x-forwarded-for").is_none()
        {
            return;
        }

        self.report(
            "xForwardedForHeader",
            "ERR_ERL_UNEXPECTED_X_FORWARDED_FOR",
            Severity::Error,
            "The X-Forwarded-For header is set but the trust proxy setting is off. Clients \
             behind the proxy will all share the proxy's address."
                .to_string(),
        );
    }

    /// The store returned a hit count below one after incrementing.
    pub fn positive_hits(&self, hits: u64) {
        if !self.runs("positiveHits") || hits >= 1 {
            return;
        }

        self.report(
            "positiveHits",
            "ERR_ERL_INVALID_HITS",
            Severity::Error,
            format!("The hit count returned from the store must be a positive integer, got {hits}."),
        );
    }

    /// The store is already bound to another limiter.
    pub fn unshared_store(&self, store: &Arc<dyn Store>) {
        if !self.runs("unsharedStore") {
            return;
        }

        let address = Arc::as_ptr(store) as *const ();
        let mut bound = BOUND_STORES.lock();
        bound.retain(|weak| weak.strong_count() > 0);

        if bound.iter().any(|weak| weak.as_ptr() as *const () == address) {
            let hint = if store.local_keys() { "" } else { " (with a unique prefix)" };
            self.report(
                "unsharedStore",
                "ERR_ERL_STORE_REUSE",
                Severity::Error,
                format!(
                    "A store instance must not be shared across rate limiters. Create a new \
                     store{hint} for each limiter instead."
                ),
            );
            return;
        }

        bound.push(Arc::downgrade(store));
    }

    /// The same request was counted twice under one key in one store.
    pub fn single_count(&self, request: &mut Request, store: &Arc<dyn Store>, key: &str) {
        if !self.runs("singleCount") {
            return;
        }

        let instance = || format!("{:p}", Arc::as_ptr(store) as *const ());
        let store_id = if store.local_keys() {
            instance()
        } else {
            store.prefix().unwrap_or_else(instance)
        };

        if !request.record_count(&store_id, key) {
            self.report(
                "singleCount",
                "ERR_ERL_DOUBLE_COUNT",
                Severity::Error,
                format!("The hit count for {key} was incremented more than once for a single request."),
            );
        }
    }

    /// A zero limit blocks every request.
    pub fn limit(&self, limit: u64) {
        if !self.runs("limit") || limit != 0 {
            return;
        }

        self.report(
            "limit",
            "WRN_ERL_MAX_ZERO",
            Severity::Warning,
            "The limit is 0, so every request will be blocked.".to_string(),
        );
    }

    /// An unsupported header draft was requested.
    pub fn headers_draft_version(&self, version: &str) {
        if !self.runs("headersDraftVersion") || SUPPORTED_DRAFTS.contains(&version) {
            return;
        }

        self.report(
            "headersDraftVersion",
            "ERR_ERL_HEADERS_UNSUPPORTED_DRAFT_VERSION",
            Severity::Error,
            format!(
                "standard_headers: only the following drafts are supported: {}.",
                SUPPORTED_DRAFTS.join(", ")
            ),
        );
    }

    /// A header draft needs a reset time the store did not provide.
    pub fn headers_reset_time(&self, reset_time: Option<DateTime<Utc>>) {
        if !self.runs("headersResetTime") || reset_time.is_some() {
            return;
        }

        self.report(
            "headersResetTime",
            "ERR_ERL_HEADERS_NO_RESET",
            Severity::Error,
            "The selected standard headers draft requires a reset time, but the store did not \
             provide one. The window length will be used instead, which may make clients wait \
             longer than necessary."
                .to_string(),
        );
    }

    /// The `validate` map names checks that do not exist.
    pub fn validations_config(&self) {
        if !self.runs("validationsConfig") {
            return;
        }

        let ValidateConfig::PerCheck { checks, .. } = &self.config else {
            return;
        };

        let mut unknown: Vec<&String> = checks
            .keys()
            .filter(|name| !CHECKS.contains(&name.as_str()))
            .collect();
        unknown.sort();

        for name in unknown {
            self.report(
                "validationsConfig",
                "ERR_ERL_UNKNOWN_VALIDATION",
                Severity::Error,
                format!(
                    "validate.{name} is not a known check. Supported checks are: {}.",
                    CHECKS.join(", ")
                ),
            );
        }
    }

    /// The limiter is being built while a request is handled.
    pub fn creation_stack(&self) {
        if !self.runs("creationStack") || !in_request_scope() {
            return;
        }

        self.report(
            "creationStack",
            "ERR_ERL_CREATED_IN_REQUEST_HANDLER",
            Severity::Error,
            "A rate limiter was created while handling a request. Create limiters once at \
             startup, otherwise every request gets a fresh, empty count."
                .to_string(),
        );
    }

    /// A custom key generator returned a full IPv6 address.
    pub fn key_generator_ip_fallback(&self, request: &Request, key: &str) {
        if !self.runs("keyGeneratorIpFallback") {
            return;
        }

        let Some(addr) = request
            .client_ip
            .as_deref()
            .and_then(|ip| ip.parse::<Ipv6Addr>().ok())
            .filter(|addr| addr.to_ipv4_mapped().is_none())
        else {
            return;
        };

        let exposes_address = key
            .split(|c: char| !(c.is_ascii_hexdigit() || c == ':' || c == '.'))
            .filter_map(|part| part.parse::<Ipv6Addr>().ok())
            .any(|part| part == addr);

        if exposes_address {
            self.report(
                "keyGeneratorIpFallback",
                "ERR_ERL_KEY_GEN_IPV6",
                Severity::Error,
                "The custom key generator appears to use the full client IPv6 address. Use \
                 ip_key() to group addresses by subnet, or IPv6 clients can bypass the limit \
                 by rotating addresses."
                    .to_string(),
            );
        }
    }

    /// The IPv6 subnet is outside the usual allocation sizes.
    pub fn ipv6_subnet(&self, subnet: Option<u8>) {
        let Some(subnet) = subnet else {
            return;
        };
        if !self.runs("ipv6Subnet") || (32..=64).contains(&subnet) {
            return;
        }

        self.report(
            "ipv6Subnet",
            "ERR_ERL_IPV6_SUBNET",
            Severity::Error,
            format!(
                "Unexpected ipv6_subnet value: {subnet}. Expected an integer between 32 and 64 \
                 (usually 48-64)."
            ),
        );
    }

    /// Both an explicit subnet and a custom key generator were configured.
    pub fn ipv6_subnet_or_key_generator(&self, conflicting: bool) {
        if !self.runs("ipv6SubnetOrKeyGenerator") || !conflicting {
            return;
        }

        self.report(
            "ipv6SubnetOrKeyGenerator",
            "ERR_ERL_IPV6SUBNET_OR_KEYGENERATOR",
            Severity::Error,
            "Incompatible options: ipv6_subnet is ignored when a custom key generator is set."
                .to_string(),
        );
    }

    /// The window is too long for the store's timer.
    pub fn window_ms(&self, window: Duration) {
        if !self.runs("windowMs") || window.as_millis() <= MAX_WINDOW_MS {
            return;
        }

        self.report(
            "windowMs",
            "ERR_ERL_WINDOW_MS",
            Severity::Error,
            format!(
                "Invalid window_ms value: {}. Must be between 1 and {MAX_WINDOW_MS}.",
                window.as_millis()
            ),
        );
    }

    /// The settings contain keys nothing reads.
    pub fn unknown_options(&self, keys: &[String]) {
        if !self.runs("unknownOptions") {
            return;
        }

        for key in keys {
            self.report(
                "unknownOptions",
                "ERR_ERL_UNKNOWN_OPTION",
                Severity::Error,
                format!("Unexpected configuration option: {key}"),
            );
        }
    }

    /// The deprecated `on_limit_reached` callback is in use.
    pub fn on_limit_reached(&self, configured: bool) {
        if !self.runs("onLimitReached") || !configured {
            return;
        }

        self.report(
            "onLimitReached",
            "WRN_ERL_DEPRECATED_ON_LIMIT_REACHED",
            Severity::Warning,
            "on_limit_reached is deprecated. Use a custom handler and check \
             RateLimitInfo::just_reached instead."
                .to_string(),
        );
    }
}
