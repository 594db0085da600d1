//! Read-through cache for side-effect free verbs
//!
//! Keys carry the resource generation: `<resource>:g<generation>:<shape>`.
//! A mutation bumps `cache-gen:<resource>` before evicting the resource's
//! keys, so a read that was computed before the mutation and stored after it
//! lands under a generation nobody reads any more.

use super::{CacheError, CacheStore};
use crate::operation::Verb;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default lifetime of a cached read.
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(60);

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(Value),
    /// Not cached; store the computed value under `key`.
    Miss { key: String },
    /// The generation could not be read, so nothing may be cached.
    Bypass,
}

#[derive(Clone)]
pub struct ResultCache {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            ttl: DEFAULT_RESULT_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Query shape for a read verb. String payloads are used as-is.
    pub fn query_shape(verb: Verb, payload: &Value) -> String {
        match (verb, payload) {
            (Verb::GetAll, _) => verb.to_string(),
            (_, Value::String(name)) => format!("{}:{}", verb, name),
            (_, Value::Null) => verb.to_string(),
            (_, other) => format!("{}:{}", verb, other),
        }
    }

    fn generation_key(resource: &str) -> String {
        format!("cache-gen:{}", resource)
    }

    async fn generation(&self, resource: &str) -> Result<i64, CacheError> {
        let key = Self::generation_key(resource);
        match self.store.get(&key).await? {
            Some(raw) => raw.parse().map_err(|_| CacheError::Corrupt(key)),
            None => Ok(0),
        }
    }

    pub async fn lookup(&self, resource: &str, shape: &str) -> CacheLookup {
        let generation = match self.generation(resource).await {
            Ok(generation) => generation,
            Err(e) => {
                debug!(resource = %resource, error = %e, "Result cache bypassed");
                return CacheLookup::Bypass;
            }
        };

        let key = format!("{}:g{}:{}", resource, generation, shape);
        match self.store.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => CacheLookup::Hit(value),
                Err(e) => {
                    warn!(key = %key, error = %e, "Discarding unreadable cached result");
                    CacheLookup::Miss { key }
                }
            },
            Ok(None) => CacheLookup::Miss { key },
            Err(e) => {
                debug!(key = %key, error = %e, "Result cache bypassed");
                CacheLookup::Bypass
            }
        }
    }

    /// Store a computed read. Failures are logged and swallowed.
    pub async fn store(&self, key: &str, value: &Value) {
        let encoded = match serde_json::to_string(value) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(key = %key, error = %e, "Cannot encode result for caching");
                return;
            }
        };
        if let Err(e) = self.store.set(key, &encoded, self.ttl).await {
            debug!(key = %key, error = %e, "Failed to cache result");
        }
    }

    /// Invalidate every cached read of `resource`.
    ///
    /// If the generation bump fails, already cached entries stay readable
    /// until their TTL runs out; the error is returned so callers can log it.
    pub async fn invalidate(&self, resource: &str) -> Result<(), CacheError> {
        let generation = self.store.incr(&Self::generation_key(resource)).await?;
        let evicted = self.store.delete_prefix(&format!("{}:", resource)).await?;
        debug!(
            resource = %resource,
            generation = generation,
            evicted = evicted,
            "Invalidated result cache"
        );
        Ok(())
    }
}
