//! Shared test utilities
//!
//! - `TestRedis`: Redis container with automatic cleanup (feature: "redis")
//! - `TestDataBuilder`: deterministic request ids and entity names (always available)
//! - `assertions`: custom assertion helpers (always available)
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["redis"] }
//! ```
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRedis};
//!
//! #[tokio::test]
//! async fn my_redis_test() {
//!     let redis = TestRedis::new().await;
//!     let builder = TestDataBuilder::from_test_name("my_redis_test");
//!
//!     let request_id = builder.request_id(1);
//!     let player = builder.name("player", "main");
//! }
//! ```

use uuid::Uuid;

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Builder for test data with deterministic randomization
///
/// Tests stay reproducible because everything derives from one seed.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Seed from the test name. The recommended constructor.
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_insert_player");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Deterministic correlation id; `n` tells requests of one test apart.
    pub fn request_id(&self, n: u64) -> String {
        let seed = self.seed.wrapping_add(n);
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..].copy_from_slice(&n.to_be_bytes());
        Uuid::from_bytes(bytes).to_string()
    }

    /// Unique name for a test entity.
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(7);
    /// assert_eq!(builder.name("player", "main"), "test-player-7-main");
    /// ```
    pub fn name(&self, prefix: &str, suffix: &str) -> String {
        format!("test-{}-{}-{}", prefix, self.seed, suffix)
    }

    /// Queue name unique to this test, safe to share a Redis instance.
    pub fn queue(&self, resource: &str, verb: &str) -> String {
        format!("{}-{}-{}", resource, self.seed, verb)
    }
}

/// Test assertion helpers
pub mod assertions {
    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }

    /// Assert that `haystack` contains `needle`, ignoring case
    pub fn assert_contains_ci(haystack: &str, needle: &str, context: &str) {
        assert!(
            haystack.to_lowercase().contains(&needle.to_lowercase()),
            "{}: expected {:?} to contain {:?}",
            context,
            haystack,
            needle
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_builder_deterministic() {
        let builder1 = TestDataBuilder::new(42);
        let builder2 = TestDataBuilder::new(42);

        assert_eq!(builder1.request_id(1), builder2.request_id(1));
        assert_eq!(builder1.name("player", "a"), builder2.name("player", "a"));
    }

    #[test]
    fn test_request_ids_differ_per_request() {
        let builder = TestDataBuilder::from_test_name("ids");
        assert_ne!(builder.request_id(1), builder.request_id(2));
    }

    #[test]
    fn test_data_builder_different_names() {
        let builder1 = TestDataBuilder::from_test_name("test1");
        let builder2 = TestDataBuilder::from_test_name("test2");

        assert_ne!(builder1.request_id(0), builder2.request_id(0));
        assert_ne!(builder1.queue("player", "insert"), builder2.queue("player", "insert"));
    }

    #[test]
    fn test_assert_contains_ci() {
        assertions::assert_contains_ci("Player Ghost NOT FOUND", "not found", "error message");
    }
}
