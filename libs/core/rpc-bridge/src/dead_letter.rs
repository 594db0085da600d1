//! Dead letters for discarded deliveries
//!
//! Every `NackDiscard` on the Redis binding appends the raw bytes and the
//! reason to `<queue>:dlq` before the entry is acknowledged. Operators can
//! inspect the stream and replay entries onto the source queue.

use crate::broker::Delivery;
use crate::error::BridgeError;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const FIELD_PAYLOAD: &str = "payload";
const FIELD_RECORD: &str = "record";

type DeadLetterEntries = Vec<(String, Vec<(String, Vec<u8>)>)>;

/// Dead letter stream name for a queue.
pub fn dead_letter_stream(queue: &str) -> String {
    format!("{}:dlq", queue)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeadLetterRecord {
    original_id: String,
    reason: String,
    delivery_count: u64,
    failed_at: DateTime<Utc>,
}

/// A dead-lettered delivery as shown to operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub dlq_id: String,
    pub queue: String,
    pub original_id: String,
    pub reason: String,
    pub delivery_count: u64,
    pub failed_at: DateTime<Utc>,
    /// Raw bytes, lossily decoded as UTF-8.
    pub payload: String,
}

impl DeadLetterEntry {
    /// Build an entry for a delivery being discarded now.
    pub fn from_delivery(dlq_id: impl Into<String>, delivery: &Delivery, reason: &str) -> Self {
        Self {
            dlq_id: dlq_id.into(),
            queue: delivery.queue.clone(),
            original_id: delivery.id.clone(),
            reason: reason.to_string(),
            delivery_count: delivery.delivery_count,
            failed_at: Utc::now(),
            payload: String::from_utf8_lossy(&delivery.payload).into_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterStats {
    pub stream_name: String,
    pub length: u64,
    pub oldest_entry_id: Option<String>,
    pub newest_entry_id: Option<String>,
}

/// Redis-backed dead letter stream for one queue.
#[derive(Clone)]
pub struct DeadLetterQueue {
    redis: ConnectionManager,
    queue: String,
    stream: String,
    max_length: u64,
}

impl DeadLetterQueue {
    pub fn new(redis: ConnectionManager, queue: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            redis,
            stream: dead_letter_stream(&queue),
            queue,
            max_length: 10_000,
        }
    }

    pub fn with_max_length(mut self, max_length: u64) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn stream_name(&self) -> &str {
        &self.stream
    }

    /// Append a discarded delivery.
    pub async fn push(&self, delivery: &Delivery, reason: &str) -> Result<String, BridgeError> {
        let record = DeadLetterRecord {
            original_id: delivery.id.clone(),
            reason: reason.to_string(),
            delivery_count: delivery.delivery_count,
            failed_at: Utc::now(),
        };
        let record = serde_json::to_string(&record)?;
        let mut conn = self.redis.clone();

        let dlq_id: String = redis::cmd("XADD")
            .arg(&self.stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_length)
            .arg("*")
            .arg(FIELD_PAYLOAD)
            .arg(delivery.payload.as_slice())
            .arg(FIELD_RECORD)
            .arg(&record)
            .query_async(&mut conn)
            .await?;

        info!(
            queue = %self.queue,
            delivery_id = %delivery.id,
            dlq_id = %dlq_id,
            reason = %reason,
            "Dead-lettered delivery"
        );
        Ok(dlq_id)
    }

    pub async fn stats(&self) -> Result<DeadLetterStats, BridgeError> {
        let mut conn = self.redis.clone();
        let length: u64 = conn.xlen(&self.stream).await?;

        let oldest: DeadLetterEntries = redis::cmd("XRANGE")
            .arg(&self.stream)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await?;
        let newest: DeadLetterEntries = redis::cmd("XREVRANGE")
            .arg(&self.stream)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await?;

        Ok(DeadLetterStats {
            stream_name: self.stream.clone(),
            length,
            oldest_entry_id: oldest.into_iter().next().map(|(id, _)| id),
            newest_entry_id: newest.into_iter().next().map(|(id, _)| id),
        })
    }

    /// Oldest `count` entries.
    pub async fn list(&self, count: usize) -> Result<Vec<DeadLetterEntry>, BridgeError> {
        Ok(self
            .range(count)
            .await?
            .into_iter()
            .map(|(entry, _)| entry)
            .collect())
    }

    /// Move the oldest `count` entries back onto the source queue.
    pub async fn replay(&self, count: usize) -> Result<usize, BridgeError> {
        let mut conn = self.redis.clone();
        let mut replayed = 0;

        for (entry, payload) in self.range(count).await? {
            let _: String = redis::cmd("XADD")
                .arg(&self.queue)
                .arg("*")
                .arg(FIELD_PAYLOAD)
                .arg(payload.as_slice())
                .query_async(&mut conn)
                .await?;
            let _: u64 = conn.xdel(&self.stream, &[entry.dlq_id.as_str()]).await?;
            replayed += 1;
        }

        if replayed > 0 {
            info!(queue = %self.queue, count = replayed, "Replayed dead letters");
        }
        Ok(replayed)
    }

    async fn range(&self, count: usize) -> Result<Vec<(DeadLetterEntry, Vec<u8>)>, BridgeError> {
        let mut conn = self.redis.clone();
        let entries: DeadLetterEntries = redis::cmd("XRANGE")
            .arg(&self.stream)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        let mut parsed = Vec::with_capacity(entries.len());
        for (dlq_id, fields) in entries {
            match parse_entry(&self.queue, &dlq_id, fields) {
                Some(entry) => parsed.push(entry),
                None => warn!(dlq_id = %dlq_id, "Skipping malformed dead letter"),
            }
        }
        Ok(parsed)
    }
}

fn parse_entry(
    queue: &str,
    dlq_id: &str,
    fields: Vec<(String, Vec<u8>)>,
) -> Option<(DeadLetterEntry, Vec<u8>)> {
    let mut payload = None;
    let mut record = None;
    for (name, value) in fields {
        match name.as_str() {
            FIELD_PAYLOAD => payload = Some(value),
            FIELD_RECORD => record = serde_json::from_slice::<DeadLetterRecord>(&value).ok(),
            _ => {}
        }
    }

    let (payload, record) = (payload?, record?);
    let entry = DeadLetterEntry {
        dlq_id: dlq_id.to_string(),
        queue: queue.to_string(),
        original_id: record.original_id,
        reason: record.reason,
        delivery_count: record.delivery_count,
        failed_at: record.failed_at,
        payload: String::from_utf8_lossy(&payload).into_owned(),
    };
    Some((entry, payload))
}
