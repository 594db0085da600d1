//! Redis Streams binding
//!
//! - `ensure_queue`: `XGROUP CREATE ... MKSTREAM`, tolerating `BUSYGROUP`
//! - `recover`: `XREADGROUP ... 0` (this consumer's unsettled entries)
//! - `receive`: `XREADGROUP ... BLOCK ... >` on the queue's own reader
//! - `claim_abandoned`: `XPENDING` + `XCLAIM` past the idle threshold
//! - `settle`: `XACK`; discards are dead-lettered first; requeues stay pending

use super::{Broker, Delivery};
use crate::connection::ReaderConnections;
use crate::dead_letter::{DeadLetterEntry, DeadLetterQueue, DeadLetterStats};
use crate::envelope::Destination;
use crate::error::BridgeError;
use crate::outcome::AckOutcome;
use async_trait::async_trait;
use redis::RedisResult;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Field carrying the message bytes on every entry.
pub const PAYLOAD_FIELD: &str = "payload";

type Fields = Vec<(String, Vec<u8>)>;
// Deleted entries come back with nil fields
type Entries = Vec<(String, Option<Fields>)>;
type StreamReply = Vec<(String, Entries)>;

/// `redis` carries every non-blocking command; blocking reads go through
/// `readers` so they never stall publishes or dead-lettering.
pub struct RedisStreamBroker {
    redis: ConnectionManager,
    readers: ReaderConnections,
    group: String,
    consumer_id: String,
    max_length: u64,
}

impl RedisStreamBroker {
    pub fn new(
        redis: ConnectionManager,
        readers: ReaderConnections,
        group: impl Into<String>,
        consumer_id: impl Into<String>,
    ) -> Self {
        Self {
            redis,
            readers,
            group: group.into(),
            consumer_id: consumer_id.into(),
            max_length: 100_000,
        }
    }

    /// Approximate `MAXLEN` applied on publish.
    pub fn with_max_length(mut self, max_length: u64) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    fn dead_letter_queue(&self, queue: &str) -> DeadLetterQueue {
        DeadLetterQueue::new(self.redis.clone(), queue)
    }

    async fn read_group(
        &self,
        queue: &str,
        count: usize,
        block: Option<Duration>,
        start: &str,
    ) -> Result<Vec<Delivery>, BridgeError> {
        let mut conn = match block {
            Some(_) => self.readers.for_queue(queue).await?,
            None => self.redis.clone(),
        };

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(&self.group).arg(&self.consumer_id);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(queue)
            .arg(start);

        let reply: Option<StreamReply> = cmd.query_async(&mut conn).await?;
        let entries = reply
            .unwrap_or_default()
            .into_iter()
            .flat_map(|(_, entries)| entries)
            .collect::<Vec<_>>();

        let mut deliveries = Vec::with_capacity(entries.len());
        for (id, fields) in entries {
            if let Some(delivery) = self.to_delivery(queue, id, fields, 1).await? {
                deliveries.push(delivery);
            }
        }
        Ok(deliveries)
    }

    /// Turn a raw entry into a delivery. Entries without a payload field can
    /// never be handled, so they are acknowledged and dropped here.
    async fn to_delivery(
        &self,
        queue: &str,
        id: String,
        fields: Option<Fields>,
        delivery_count: u64,
    ) -> Result<Option<Delivery>, BridgeError> {
        let payload = fields.and_then(|fields| {
            fields
                .into_iter()
                .find(|(name, _)| name == PAYLOAD_FIELD)
                .map(|(_, value)| value)
        });

        match payload {
            Some(payload) => Ok(Some(Delivery {
                id,
                queue: queue.to_string(),
                payload,
                delivery_count,
            })),
            None => {
                warn!(queue = %queue, delivery_id = %id, "Entry has no payload field, dropping");
                self.ack(queue, &id).await?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, queue: &str, id: &str) -> Result<(), BridgeError> {
        let mut conn = self.redis.clone();
        let _: i64 = redis::cmd("XACK")
            .arg(queue)
            .arg(&self.group)
            .arg(id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisStreamBroker {
    async fn ensure_queue(&self, queue: &str) -> Result<(), BridgeError> {
        let mut conn = self.redis.clone();

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(queue)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(queue = %queue, group = %self.group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(queue = %queue, group = %self.group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(BridgeError::Redis(e)),
        }
    }

    async fn recover(&self, queue: &str, count: usize) -> Result<Vec<Delivery>, BridgeError> {
        let mut deliveries = self.read_group(queue, count, None, "0").await?;
        // Anything we own and never settled has been handed out before
        for delivery in &mut deliveries {
            delivery.delivery_count = 2;
        }
        if !deliveries.is_empty() {
            info!(queue = %queue, count = deliveries.len(), "Recovered unsettled deliveries");
        }
        Ok(deliveries)
    }

    async fn receive(
        &self,
        queue: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, BridgeError> {
        self.read_group(queue, count, Some(block), ">").await
    }

    async fn claim_abandoned(
        &self,
        queue: &str,
        count: usize,
        min_idle: Duration,
    ) -> Result<Vec<Delivery>, BridgeError> {
        let mut conn = self.redis.clone();
        let min_idle_ms = min_idle.as_millis() as u64;

        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(queue)
            .arg(&self.group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        if pending.is_empty() {
            return Ok(vec![]);
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(queue)
            .arg(&self.group)
            .arg(&self.consumer_id)
            .arg(min_idle_ms);
        for (id, _, _, _) in &pending {
            cmd.arg(id);
        }
        let claimed: Entries = cmd.query_async(&mut conn).await?;

        let mut deliveries = Vec::with_capacity(claimed.len());
        for (id, fields) in claimed {
            // XCLAIM bumps the counter XPENDING reported
            let delivery_count = pending
                .iter()
                .find(|(pending_id, _, _, _)| *pending_id == id)
                .map(|(_, _, _, times)| times + 1)
                .unwrap_or(2);
            if let Some(delivery) = self.to_delivery(queue, id, fields, delivery_count).await? {
                deliveries.push(delivery);
            }
        }

        if !deliveries.is_empty() {
            warn!(queue = %queue, count = deliveries.len(), "Claimed abandoned deliveries");
        }
        Ok(deliveries)
    }

    async fn settle(
        &self,
        delivery: &Delivery,
        outcome: AckOutcome,
        reason: Option<&str>,
    ) -> Result<(), BridgeError> {
        match outcome {
            AckOutcome::Ack => self.ack(&delivery.queue, &delivery.id).await,
            AckOutcome::NackDiscard => {
                self.dead_letter_queue(&delivery.queue)
                    .push(delivery, reason.unwrap_or("discarded"))
                    .await?;
                self.ack(&delivery.queue, &delivery.id).await
            }
            AckOutcome::NackRequeue => {
                debug!(
                    queue = %delivery.queue,
                    delivery_id = %delivery.id,
                    "Left delivery pending for redelivery"
                );
                Ok(())
            }
        }
    }

    async fn publish(
        &self,
        destination: &Destination,
        payload: &[u8],
    ) -> Result<String, BridgeError> {
        let mut conn = self.redis.clone();
        let id: String = redis::cmd("XADD")
            .arg(destination.stream_key())
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_length)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| BridgeError::Publish(format!("{}: {}", destination, e)))?;

        debug!(destination = %destination, entry_id = %id, "Published message");
        Ok(id)
    }

    async fn ping(&self) -> Result<(), BridgeError> {
        let mut conn = self.redis.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(BridgeError::Transport(format!("unexpected PING response: {}", pong)))
        }
    }

    async fn dead_letter_stats(&self, queue: &str) -> Result<DeadLetterStats, BridgeError> {
        self.dead_letter_queue(queue).stats().await
    }

    async fn dead_letters(
        &self,
        queue: &str,
        count: usize,
    ) -> Result<Vec<DeadLetterEntry>, BridgeError> {
        self.dead_letter_queue(queue).list(count).await
    }

    async fn replay_dead_letters(&self, queue: &str, count: usize) -> Result<usize, BridgeError> {
        self.dead_letter_queue(queue).replay(count).await
    }
}
