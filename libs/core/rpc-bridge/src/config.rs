//! Bridge configuration
//!
//! [`SubscriptionConfig`] describes one queue's consumer and is built with
//! `with_*` methods. [`BridgeSettings`] is the process-wide view loaded from
//! the environment; it expands into one subscription per (resource, verb).

use crate::envelope::Destination;
use crate::operation::Verb;
use crate::retry::RetryPolicy;
use core_config::{ConfigError, FromEnv, env_flag, env_list, env_or_default, env_parse};
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_READ_CONCURRENCY: usize = 3;
pub const DEFAULT_WRITE_CONCURRENCY: usize = 1;
pub const DEFAULT_BACKEND_POOL_SIZE: usize = 10;

/// Queue serving `verb` for `resource`, e.g. `player-get-by-name`.
pub fn queue_name(resource: &str, verb: Verb) -> String {
    format!("{}-{}", resource, verb)
}

/// Configuration for one queue's subscription
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionConfig {
    pub queue: String,
    pub resource: String,
    pub verb: Verb,
    /// Concurrency ceiling N
    pub concurrency: usize,
    /// Priority queues retry subscription faults forever
    pub priority: bool,
    /// Longest blocking read
    pub block: Duration,
    /// Idle time after which a pending entry may be claimed by anyone
    pub claim_timeout: Duration,
    /// How often to look for claimable entries
    pub claim_interval: Duration,
    /// How long draining waits for in-flight lanes
    pub drain_timeout: Duration,
    pub retry: RetryPolicy,
}

impl SubscriptionConfig {
    pub fn new(resource: impl Into<String>, verb: Verb) -> Self {
        let resource = resource.into();
        Self {
            queue: queue_name(&resource, verb),
            resource,
            verb,
            concurrency: verb.ceiling(DEFAULT_READ_CONCURRENCY, DEFAULT_WRITE_CONCURRENCY),
            priority: false,
            block: Duration::from_secs(1),
            claim_timeout: Duration::from_secs(30),
            claim_interval: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }

    /// Override the queue name
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Mark as priority; subscription retries become unbounded
    pub fn with_priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    pub fn with_claim_interval(mut self, interval: Duration) -> Self {
        self.claim_interval = interval;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Policy applied to subscription faults
    pub fn effective_retry(&self) -> RetryPolicy {
        if self.priority {
            self.retry.clone().unbounded()
        } else {
            self.retry.clone()
        }
    }
}

/// Process-wide bridge settings
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeSettings {
    /// `BRIDGE_BROKER_ENABLED`
    pub broker_enabled: bool,
    /// `BRIDGE_REACTIVE_ENABLED`
    pub reactive_enabled: bool,
    pub source: String,
    pub result_destination: Destination,
    pub consumer_group: String,
    pub consumer_id: String,
    pub resources: Vec<String>,
    pub legacy_resources: Vec<String>,
    pub priority_queues: Vec<String>,
    pub read_concurrency: usize,
    pub write_concurrency: usize,
    pub backend_pool_size: usize,
    pub wave_delay: Duration,
    pub drain_timeout: Duration,
    pub block: Duration,
    /// Response timeout on the blocking reader connections; must exceed `block`
    pub read_response_timeout: Duration,
    pub claim_timeout: Duration,
    pub claim_liveness: Duration,
    pub idempotency_ttl: Duration,
    pub cache_ttl: Duration,
    pub health_port: u16,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            broker_enabled: true,
            reactive_enabled: true,
            source: "rpc-bridge".to_string(),
            result_destination: Destination::new("bridge.results", "result"),
            consumer_group: "bridge_workers".to_string(),
            consumer_id: generated_consumer_id(),
            resources: vec!["player".to_string()],
            legacy_resources: Vec::new(),
            priority_queues: Vec::new(),
            read_concurrency: DEFAULT_READ_CONCURRENCY,
            write_concurrency: DEFAULT_WRITE_CONCURRENCY,
            backend_pool_size: DEFAULT_BACKEND_POOL_SIZE,
            wave_delay: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(10),
            block: Duration::from_secs(1),
            read_response_timeout: Duration::from_secs(5),
            claim_timeout: Duration::from_secs(30),
            claim_liveness: Duration::from_secs(60),
            idempotency_ttl: Duration::from_secs(300),
            cache_ttl: Duration::from_secs(60),
            health_port: 8090,
        }
    }
}

fn generated_consumer_id() -> String {
    format!("bridge-{}", Uuid::new_v4())
}

impl BridgeSettings {
    /// Reject ceilings that leave the backend pool no headroom, and read
    /// timings that would lose deliveries
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, ceiling) in [
            ("BRIDGE_READ_CONCURRENCY", self.read_concurrency),
            ("BRIDGE_WRITE_CONCURRENCY", self.write_concurrency),
        ] {
            if ceiling == 0 {
                return Err(ConfigError::Invalid {
                    key: key.to_string(),
                    details: "concurrency ceiling must be at least 1".to_string(),
                });
            }
            if ceiling >= self.backend_pool_size {
                return Err(ConfigError::Invalid {
                    key: key.to_string(),
                    details: format!(
                        "ceiling {} must stay below BACKEND_POOL_SIZE {}",
                        ceiling, self.backend_pool_size
                    ),
                });
            }
        }

        if self.resources.is_empty() {
            return Err(ConfigError::Invalid {
                key: "BRIDGE_RESOURCES".to_string(),
                details: "at least one resource is required".to_string(),
            });
        }

        // BLOCK 0 waits forever and would hold the reader through shutdown
        if self.block.is_zero() {
            return Err(ConfigError::Invalid {
                key: "BRIDGE_BLOCK_MS".to_string(),
                details: "blocking read must be at least 1 ms".to_string(),
            });
        }
        if self.block >= self.read_response_timeout {
            return Err(ConfigError::Invalid {
                key: "BRIDGE_READ_RESPONSE_TIMEOUT_MS".to_string(),
                details: format!(
                    "response timeout {:?} must exceed BRIDGE_BLOCK_MS {:?}",
                    self.read_response_timeout, self.block
                ),
            });
        }

        Ok(())
    }

    /// Whether any subscription should run at all
    pub fn consumers_enabled(&self) -> bool {
        self.broker_enabled && self.reactive_enabled
    }

    /// One subscription per configured resource and verb
    pub fn subscriptions(&self) -> Vec<SubscriptionConfig> {
        self.resources
            .iter()
            .flat_map(|resource| Verb::all().map(move |verb| (resource, verb)))
            .map(|(resource, verb)| {
                let config = SubscriptionConfig::new(resource.as_str(), verb);
                let priority = self.priority_queues.contains(&config.queue);
                config
                    .with_concurrency(verb.ceiling(self.read_concurrency, self.write_concurrency))
                    .with_priority(priority)
                    .with_block(self.block)
                    .with_claim_timeout(self.claim_timeout)
                    .with_drain_timeout(self.drain_timeout)
            })
            .collect()
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_millis() as u64).map(Duration::from_millis)
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}

impl FromEnv for BridgeSettings {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let consumer_id = match env_or_default("BRIDGE_CONSUMER_ID", "").trim() {
            "" => defaults.consumer_id.clone(),
            id => id.to_string(),
        };

        let settings = Self {
            broker_enabled: env_flag("BRIDGE_BROKER_ENABLED", defaults.broker_enabled)?,
            reactive_enabled: env_flag("BRIDGE_REACTIVE_ENABLED", defaults.reactive_enabled)?,
            source: env_or_default("BRIDGE_SOURCE", &defaults.source),
            result_destination: Destination::new(
                env_or_default("BRIDGE_RESULT_EXCHANGE", &defaults.result_destination.exchange),
                env_or_default(
                    "BRIDGE_RESULT_ROUTING_KEY",
                    &defaults.result_destination.routing_key,
                ),
            ),
            consumer_group: env_or_default("BRIDGE_CONSUMER_GROUP", &defaults.consumer_group),
            consumer_id,
            resources: env_list("BRIDGE_RESOURCES", "player"),
            legacy_resources: env_list("BRIDGE_LEGACY_RESOURCES", ""),
            priority_queues: env_list("BRIDGE_PRIORITY_QUEUES", ""),
            read_concurrency: env_parse("BRIDGE_READ_CONCURRENCY", defaults.read_concurrency)?,
            write_concurrency: env_parse("BRIDGE_WRITE_CONCURRENCY", defaults.write_concurrency)?,
            backend_pool_size: env_parse("BACKEND_POOL_SIZE", defaults.backend_pool_size)?,
            wave_delay: env_millis("BRIDGE_WAVE_DELAY_MS", defaults.wave_delay)?,
            drain_timeout: env_millis("BRIDGE_DRAIN_TIMEOUT_MS", defaults.drain_timeout)?,
            block: env_millis("BRIDGE_BLOCK_MS", defaults.block)?,
            read_response_timeout: env_millis(
                "BRIDGE_READ_RESPONSE_TIMEOUT_MS",
                defaults.read_response_timeout,
            )?,
            claim_timeout: env_millis("BRIDGE_CLAIM_TIMEOUT_MS", defaults.claim_timeout)?,
            claim_liveness: env_secs("BRIDGE_CLAIM_LIVENESS_SECS", defaults.claim_liveness)?,
            idempotency_ttl: env_secs("BRIDGE_IDEMPOTENCY_TTL_SECS", defaults.idempotency_ttl)?,
            cache_ttl: env_secs("BRIDGE_CACHE_TTL_SECS", defaults.cache_ttl)?,
            health_port: env_parse("BRIDGE_HEALTH_PORT", defaults.health_port)?,
        };

        settings.validate()?;
        Ok(settings)
    }
}
