//! Shared key/value store used for idempotency claims and read-through results
//!
//! Two key families share one store:
//! - `idempotent:<operation>:<requestId>`: idempotency claims ([`IdempotencyGuard`])
//! - `<resource>:g<generation>:<queryShape>`: read-through results ([`ResultCache`])

mod idempotency;
mod memory;
mod redis_store;
mod result_cache;

pub use idempotency::{Claim, ClaimRecord, ClaimState, IdempotencyGuard};
pub use memory::InMemoryCache;
pub use redis_store::RedisCache;
pub use result_cache::{CacheLookup, ResultCache};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Cache layer errors. All of them mean "the store could not answer".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("corrupt cache value under {0}")]
    Corrupt(String),
}

impl From<::redis::RedisError> for CacheError {
    fn from(err: ::redis::RedisError) -> Self {
        CacheError::Unavailable(err.to_string())
    }
}

/// Narrow interface onto the externally owned cache store.
///
/// `set_if_absent` and `compare_and_swap` must be atomic with respect to
/// every other caller of the same store.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Returns `true` when this caller created the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Replace `key` with `new` only if it currently holds `expected`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    /// Atomically increment a counter, creating it at 1.
    async fn incr(&self, key: &str) -> Result<i64, CacheError>;

    /// Delete every key starting with `prefix`, returning how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError>;

    /// Liveness probe.
    async fn ping(&self) -> Result<(), CacheError>;
}
