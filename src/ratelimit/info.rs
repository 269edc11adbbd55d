//! Per-request rate limit outcome.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::store::ClientRateLimitInfo;

/// Result of counting one request, attached to the request for downstream use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    /// Maximum hits allowed in the window
    pub limit: u64,
    /// Hits recorded so far, including this request
    pub used: u64,
    /// Hits left before requests are blocked
    pub remaining: u64,
    /// When the client's count resets, if the store knows
    pub reset_time: Option<DateTime<Utc>>,
    /// The client key this request was counted under
    pub key: String,
}

impl RateLimitInfo {
    /// Build the outcome from a store record and the resolved limit.
    pub fn new(limit: u64, record: ClientRateLimitInfo, key: impl Into<String>) -> Self {
        Self {
            limit,
            used: record.total_hits,
            remaining: limit.saturating_sub(record.total_hits),
            reset_time: record.reset_time,
            key: key.into(),
        }
    }

    /// Whether this request went over the limit.
    pub fn is_exceeded(&self) -> bool {
        self.used > self.limit
    }

    /// Whether this request is the first one over the limit.
    pub fn just_reached(&self) -> bool {
        self.used == self.limit.saturating_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(total_hits: u64) -> ClientRateLimitInfo {
        ClientRateLimitInfo {
            total_hits,
            reset_time: None,
        }
    }

    #[test]
    fn test_remaining_saturates_at_zero() {
        let info = RateLimitInfo::new(2, record(1), "k");
        assert_eq!(info.remaining, 1);
        assert!(!info.is_exceeded());

        let info = RateLimitInfo::new(2, record(5), "k");
        assert_eq!(info.remaining, 0);
        assert!(info.is_exceeded());
    }

    #[test]
    fn test_just_reached_only_on_transition() {
        assert!(!RateLimitInfo::new(2, record(2), "k").just_reached());
        assert!(RateLimitInfo::new(2, record(3), "k").just_reached());
        assert!(!RateLimitInfo::new(2, record(4), "k").just_reached());
    }

    #[test]
    fn test_serializes_for_downstream_handlers() {
        let info = RateLimitInfo::new(10, record(3), "1.2.3.4");
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["limit"], 10);
        assert_eq!(json["remaining"], 7);
        assert_eq!(json["key"], "1.2.3.4");
    }
}
