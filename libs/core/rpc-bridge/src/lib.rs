//! RPC Bridge
//!
//! Request/response over Redis Streams. Callers append a request envelope to a
//! per-operation queue; a fleet of workers consumes the queue, runs the
//! operation once per `requestId` and publishes a correlated result.
//!
//! ## Features
//!
//! - **Idempotent processing**: a claim per `(queue, requestId)` keeps
//!   redeliveries from repeating side effects
//! - **Correlated results**: one shared result stream, plus optional legacy
//!   per-resource success/error streams
//! - **Bounded lanes**: a fixed concurrency ceiling per queue
//! - **Classified failures**: fail-fast, retry in-lane, or dead-letter
//! - **Staggered startup**: subscriptions start in waves
//! - **Health endpoints**: liveness, readiness, subscription states, metrics
//!   and dead-letter admin
//!
//! ## Example
//!
//! ```ignore
//! use rpc_bridge::{
//!     Bootstrap, BridgeContext, BridgeSettings, ReaderConnections, RedisCache, RedisStreamBroker,
//! };
//!
//! let settings = BridgeSettings::from_env()?;
//! let readers = ReaderConnections::new(&redis_config, settings.read_response_timeout)?;
//! let broker = Arc::new(RedisStreamBroker::new(commands, readers, &settings.consumer_group, &settings.consumer_id));
//! let store = Arc::new(RedisCache::new(cache));
//! let context = BridgeContext::new(broker, store, &settings);
//!
//! let running = Bootstrap::new(context, settings)
//!     .with_operation(Arc::new(my_operation))
//!     .start()
//!     .await?;
//! // ...
//! running.shutdown().await;
//! ```

mod bootstrap;
pub mod broker;
pub mod cache;
mod classify;
mod config;
pub mod connection;
mod context;
mod dead_letter;
mod envelope;
mod error;
mod handler;
mod health;
pub mod metrics;
mod operation;
mod outcome;
mod publisher;
mod retry;
mod subscription;

pub use bootstrap::{Bootstrap, RunningBridge, ShutdownSummary};
pub use broker::{Broker, Delivery, InMemoryBroker, RedisStreamBroker};
pub use cache::{
    CacheError, CacheLookup, CacheStore, Claim, IdempotencyGuard, InMemoryCache, RedisCache,
    ResultCache,
};
pub use classify::ErrorClassifier;
pub use config::{BridgeSettings, SubscriptionConfig, queue_name};
pub use connection::{ReaderConnections, connect, connect_with_retry, default_connect_policy};
pub use context::BridgeContext;
pub use dead_letter::{DeadLetterEntry, DeadLetterQueue, DeadLetterStats, dead_letter_stream};
pub use envelope::{Destination, RequestEnvelope, ResultMessage, ResultStatus};
pub use error::{BridgeError, ErrorKind};
pub use handler::{DeliveryHandler, Handled};
pub use health::{HealthState, health_router};
pub use metrics::{BridgeMetrics, init_metrics};
pub use operation::{Operation, OperationError, Verb, Wave};
pub use outcome::AckOutcome;
pub use publisher::{ResultPublisher, legacy_destination};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use subscription::{Subscription, SubscriptionState, SubscriptionStatus};
