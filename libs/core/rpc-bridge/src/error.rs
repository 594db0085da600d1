//! Bridge error types and the failure taxonomy
//!
//! Every failure the bridge can observe is sorted into an [`ErrorKind`]:
//! - **Decode**: malformed envelope, terminal for the delivery, no result possible
//! - **Validation** / **DataConflict** / **NotFound**: fail fast, never retried
//! - **ResourceExhausted**: backpressure from the backend, retried in-lane with backoff
//! - **Unclassified**: anything else, logged loudly and treated as possibly transient
//! - **Transport**: broker faults at the subscription level, handled by the subscription loop

use crate::cache::CacheError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// Classified failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Decode,
    Validation,
    DataConflict,
    NotFound,
    ResourceExhausted,
    Unclassified,
    Transport,
}

impl ErrorKind {
    /// Maximum in-lane retries of the operation for this kind
    pub fn max_retries(&self) -> u32 {
        match self {
            ErrorKind::ResourceExhausted => 3,
            ErrorKind::Unclassified => 1,
            _ => 0,
        }
    }

    /// Base delay in milliseconds for in-lane retries
    pub fn base_delay_ms(&self) -> u64 {
        match self {
            ErrorKind::ResourceExhausted => 200,
            ErrorKind::Unclassified => 100,
            _ => 0,
        }
    }

    /// Maximum delay in milliseconds for in-lane retries
    pub fn max_delay_ms(&self) -> u64 {
        match self {
            ErrorKind::ResourceExhausted => 2_000,
            ErrorKind::Unclassified => 1_000,
            _ => 0,
        }
    }

    /// Exponential backoff delay before retry number `attempt` (0-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms();
        let delay = base.saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(delay.min(self.max_delay_ms()))
    }

    /// Whether another in-lane attempt is allowed after `attempts` retries
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_retries()
    }

    /// Domain-level absence is not an infrastructure failure
    pub fn is_benign(&self) -> bool {
        matches!(self, ErrorKind::NotFound)
    }
}

/// Bridge errors
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Envelope could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Serialization of an outgoing message failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A result could not be emitted on the response channel
    #[error("Publish error: {0}")]
    Publish(String),

    /// Broker-level failure outside of Redis itself
    #[error("Transport error: {0}")]
    Transport(String),

    /// Cache layer failure
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

impl BridgeError {
    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Decode(_) => ErrorKind::Decode,
            BridgeError::Redis(_) | BridgeError::Transport(_) | BridgeError::Publish(_) => {
                ErrorKind::Transport
            }
            BridgeError::Cache(_) => ErrorKind::ResourceExhausted,
            BridgeError::Serialization(_) | BridgeError::Config(_) | BridgeError::Shutdown => {
                ErrorKind::Unclassified
            }
        }
    }

    /// Consumer group is missing (stream was deleted or never created)
    pub fn is_nogroup_error(&self) -> bool {
        matches!(self, BridgeError::Redis(e) if e.to_string().contains("NOGROUP"))
    }

    /// Connection dropped or refused
    pub fn is_connection_error(&self) -> bool {
        match self {
            BridgeError::Redis(e) => {
                e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error()
            }
            BridgeError::Transport(_) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_fast_kinds_never_retry() {
        for kind in [
            ErrorKind::Validation,
            ErrorKind::DataConflict,
            ErrorKind::NotFound,
            ErrorKind::Decode,
        ] {
            assert_eq!(kind.max_retries(), 0);
            assert!(!kind.should_retry(0));
        }
    }

    #[test]
    fn test_backoff_calculation() {
        // ResourceExhausted: 200ms, 400ms, 800ms, 1600ms, 2000ms (max)
        let kind = ErrorKind::ResourceExhausted;
        assert_eq!(kind.backoff_delay(0), Duration::from_millis(200));
        assert_eq!(kind.backoff_delay(1), Duration::from_millis(400));
        assert_eq!(kind.backoff_delay(3), Duration::from_millis(1600));
        assert_eq!(kind.backoff_delay(10), Duration::from_millis(2000));

        assert_eq!(ErrorKind::Validation.backoff_delay(2), Duration::ZERO);
    }

    #[test]
    fn test_should_retry() {
        assert!(ErrorKind::ResourceExhausted.should_retry(0));
        assert!(ErrorKind::ResourceExhausted.should_retry(2));
        assert!(!ErrorKind::ResourceExhausted.should_retry(3));

        assert!(ErrorKind::Unclassified.should_retry(0));
        assert!(!ErrorKind::Unclassified.should_retry(1));
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ErrorKind::NotFound.to_string(), "NOT_FOUND");
        assert_eq!(ErrorKind::DataConflict.as_ref(), "DATA_CONFLICT");
        let parsed: ErrorKind = "RESOURCE_EXHAUSTED".parse().unwrap();
        assert_eq!(parsed, ErrorKind::ResourceExhausted);
    }

    #[test]
    fn test_bridge_error_kind() {
        assert_eq!(BridgeError::Decode("bad".into()).kind(), ErrorKind::Decode);
        assert_eq!(BridgeError::Publish("down".into()).kind(), ErrorKind::Transport);
        assert!(BridgeError::Transport("closed".into()).is_connection_error());
        assert!(!BridgeError::Decode("bad".into()).is_connection_error());
    }
}
