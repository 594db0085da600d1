//! Broker binding
//!
//! The bridge only talks to the broker through [`Broker`]. The production
//! binding is Redis Streams with consumer groups ([`RedisStreamBroker`]); the
//! in-memory binding ([`InMemoryBroker`]) backs tests.
//!
//! A queue is a stream consumed by one shared consumer group. Publishing to a
//! [`Destination`] appends to the stream `<exchange>:<routing_key>`.

mod memory;
mod redis_streams;

pub use memory::InMemoryBroker;
pub use redis_streams::RedisStreamBroker;

use crate::dead_letter::{DeadLetterEntry, DeadLetterStats};
use crate::envelope::Destination;
use crate::error::BridgeError;
use crate::outcome::AckOutcome;
use async_trait::async_trait;
use std::time::Duration;

/// One message handed out by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned entry id. Stable across redeliveries of the same entry.
    pub id: String,
    /// Queue the entry was read from.
    pub queue: String,
    /// Raw message bytes.
    pub payload: Vec<u8>,
    /// How many times the entry has been handed out, including this one.
    pub delivery_count: u64,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Create the consumer group for `queue` if it does not exist yet.
    async fn ensure_queue(&self, queue: &str) -> Result<(), BridgeError>;

    /// Entries previously handed to this consumer and never settled.
    async fn recover(&self, queue: &str, count: usize) -> Result<Vec<Delivery>, BridgeError>;

    /// Wait up to `block` for at most `count` new entries.
    async fn receive(
        &self,
        queue: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, BridgeError>;

    /// Take over at most `count` entries idle for longer than `min_idle`.
    async fn claim_abandoned(
        &self,
        queue: &str,
        count: usize,
        min_idle: Duration,
    ) -> Result<Vec<Delivery>, BridgeError>;

    /// Apply the handler's decision. `reason` is recorded on dead letters.
    async fn settle(
        &self,
        delivery: &Delivery,
        outcome: AckOutcome,
        reason: Option<&str>,
    ) -> Result<(), BridgeError>;

    /// Append a message to a destination, returning the new entry id.
    async fn publish(&self, destination: &Destination, payload: &[u8])
    -> Result<String, BridgeError>;

    async fn ping(&self) -> Result<(), BridgeError>;

    async fn dead_letter_stats(&self, queue: &str) -> Result<DeadLetterStats, BridgeError>;

    async fn dead_letters(
        &self,
        queue: &str,
        count: usize,
    ) -> Result<Vec<DeadLetterEntry>, BridgeError>;

    /// Move up to `count` dead letters back onto `queue`.
    async fn replay_dead_letters(&self, queue: &str, count: usize) -> Result<usize, BridgeError>;
}
