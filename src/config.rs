//! File and environment configuration for rate limiters.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RateLimitError, Result};

/// Prefix for environment variable overrides, e.g. `RATEWALL_LIMIT=10`.
pub const ENV_PREFIX: &str = "RATEWALL";

/// Data-only limiter settings, as loaded from YAML or the environment.
///
/// Every field is optional. Callbacks (key generator, skip predicate,
/// handler, ...) cannot be expressed here and are attached to the
/// [`Options`](crate::ratelimit::Options) built from these settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RateLimitSettings {
    /// Window length in milliseconds
    #[serde(default)]
    pub window_ms: Option<u64>,

    /// Requests allowed per window
    #[serde(default)]
    pub limit: Option<u64>,

    /// Legacy alias for `limit`
    #[serde(default)]
    pub max: Option<u64>,

    /// Body sent with a rejection (string or any JSON value)
    #[serde(default)]
    pub message: Option<serde_json::Value>,

    /// Status code sent with a rejection
    #[serde(default)]
    pub status_code: Option<u16>,

    /// Emit `X-RateLimit-*` headers
    #[serde(default)]
    pub legacy_headers: Option<bool>,

    /// Legacy alias for `legacy_headers`
    #[serde(default)]
    pub headers: Option<bool>,

    /// `false`, `true` (draft-6), or a draft name
    #[serde(default)]
    pub standard_headers: Option<StandardHeadersSetting>,

    /// Draft-8 policy name
    #[serde(default)]
    pub identifier: Option<String>,

    /// Let requests through when the store fails
    #[serde(default)]
    pub pass_on_store_error: Option<bool>,

    /// Request property the outcome is attached under
    #[serde(default)]
    pub request_property_name: Option<String>,

    /// Uncount requests that end successfully
    #[serde(default)]
    pub skip_successful_requests: Option<bool>,

    /// Uncount requests that fail
    #[serde(default)]
    pub skip_failed_requests: Option<bool>,

    /// `true`/`false`, or per-check switches with an optional `default`
    #[serde(default)]
    pub validate: Option<ValidateSetting>,

    /// IPv6 prefix length, or `false` to key by full address
    #[serde(default)]
    pub ipv6_subnet: Option<Ipv6SubnetSetting>,

    /// Sub-windows for the default in-memory store; unset means fixed window
    #[serde(default)]
    pub memory_buckets: Option<usize>,

    /// Keys nothing reads, reported by the `unknownOptions` check
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

/// The `standard_headers` setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StandardHeadersSetting {
    /// `true` selects draft-6, `false` disables
    Enabled(bool),
    /// A draft name such as `"draft-7"`
    Draft(String),
}

/// The `validate` setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValidateSetting {
    /// Every check on or off
    All(bool),
    /// Per-check switches
    PerCheck(HashMap<String, bool>),
}

/// The `ipv6_subnet` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Ipv6SubnetSetting {
    /// Prefix length in bits
    Prefix(u8),
    /// `false` keys by full address, `true` uses the default prefix
    Enabled(bool),
}

impl RateLimitSettings {
    /// Parse settings from a YAML document.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).map_err(|e| RateLimitError::Config(e.to_string()))
    }

    /// Load settings from a file, with `RATEWALL_*` environment overrides.
    ///
    /// The format is taken from the file extension (YAML, JSON, TOML, ...).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(RateLimitError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("settings file {} not found", path.display()),
            )));
        }

        config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| RateLimitError::Config(e.to_string()))
    }
}
