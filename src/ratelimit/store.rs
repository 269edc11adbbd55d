//! Counting store trait for abstracting in-memory and external backends.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;

/// Hit count and reset time for a single client key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRateLimitInfo {
    /// Hits recorded for the key in the current window
    pub total_hits: u64,
    /// When the count next drops to zero. Legacy stores may not know.
    pub reset_time: Option<DateTime<Utc>>,
}

/// Options handed to a store's setup hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Length of the counting window
    pub window: Duration,
}

/// Optional operations a store implements.
///
/// The limiter checks these once, at construction time, against the
/// features requested by its configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// `decrement` is implemented (required for uncounting requests)
    pub decrement: bool,
    /// `get` is implemented
    pub get: bool,
    /// `reset_all` is implemented
    pub reset_all: bool,
}

impl Capabilities {
    /// Every optional operation is implemented.
    pub fn all() -> Self {
        Self {
            decrement: true,
            get: true,
            reset_all: true,
        }
    }
}

/// Trait for counting store implementations.
///
/// `increment` and `reset_key` are required. `decrement`, `get` and
/// `reset_all` default to [`StoreError::Unsupported`]; a store that
/// overrides them must advertise so through [`Store::capabilities`].
///
/// Concurrent increments for the same key must not lose updates. The
/// limiter never serializes store calls itself.
#[async_trait]
pub trait Store: Send + Sync {
    /// Setup hook, called once by the options resolver with the final window.
    fn init(&self, _options: &StoreOptions) {}

    /// Optional operations this store implements.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Whether keys live in this process only (as opposed to a shared backend).
    fn local_keys(&self) -> bool {
        false
    }

    /// Key prefix used by external stores to namespace their records.
    fn prefix(&self) -> Option<String> {
        None
    }

    /// Add one hit for `key` and return the updated record.
    async fn increment(&self, key: &str) -> Result<ClientRateLimitInfo, StoreError>;

    /// Remove one hit for `key`.
    async fn decrement(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Unsupported("decrement"))
    }

    /// Drop the record for `key`.
    async fn reset_key(&self, key: &str) -> Result<(), StoreError>;

    /// Read the record for `key` without changing it.
    ///
    /// `Ok(None)` means the key has no record, which is distinct from a
    /// record holding zero hits.
    async fn get(&self, _key: &str) -> Result<Option<ClientRateLimitInfo>, StoreError> {
        Err(StoreError::Unsupported("get"))
    }

    /// Drop every record.
    async fn reset_all(&self) -> Result<(), StoreError> {
        Err(StoreError::Unsupported("reset_all"))
    }
}
