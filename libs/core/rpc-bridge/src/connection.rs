//! Redis connection setup

use crate::retry::{RetryPolicy, retry_with_backoff};
use core_config::redis::RedisConfig;
use redis::Client;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Startup policy: 5 attempts from 200 ms up to 5 s.
pub fn default_connect_policy() -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(200), Duration::from_secs(5)).with_max_attempts(5)
}

/// Open a connection manager and verify it with PING.
pub async fn connect(config: &RedisConfig) -> redis::RedisResult<ConnectionManager> {
    let url = config.connection_url();
    info!(database = ?config.database, "Connecting to Redis");

    let client = Client::open(url.as_str())?;
    let manager = ConnectionManager::new(client).await?;

    let mut conn = manager.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;

    info!("Connected to Redis");
    Ok(manager)
}

/// [`connect`] with jittered exponential backoff.
pub async fn connect_with_retry(
    config: &RedisConfig,
    policy: &RetryPolicy,
) -> redis::RedisResult<ConnectionManager> {
    retry_with_backoff(|| connect(config), policy).await
}

/// Dedicated connections for blocking stream reads, one per queue.
///
/// A connection parked in `XREADGROUP ... BLOCK` answers nothing else until
/// the block ends, so cache and publish traffic never shares these. Their
/// response timeout must outlast the block or replies get dropped after
/// Redis has already assigned the entries.
#[derive(Clone)]
pub struct ReaderConnections {
    client: Client,
    config: ConnectionManagerConfig,
    response_timeout: Duration,
    connections: Arc<Mutex<HashMap<String, ConnectionManager>>>,
}

impl ReaderConnections {
    pub fn new(config: &RedisConfig, response_timeout: Duration) -> redis::RedisResult<Self> {
        let client = Client::open(config.connection_url().as_str())?;
        Ok(Self {
            client,
            config: ConnectionManagerConfig::new().set_response_timeout(Some(response_timeout)),
            response_timeout,
            connections: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// The reader for `queue`, opened on first use.
    pub async fn for_queue(&self, queue: &str) -> redis::RedisResult<ConnectionManager> {
        let mut connections = self.connections.lock().await;
        if let Some(conn) = connections.get(queue) {
            return Ok(conn.clone());
        }

        let conn = ConnectionManager::new_with_config(self.client.clone(), self.config.clone())
            .await?;
        debug!(queue = %queue, "Opened blocking reader connection");
        connections.insert(queue.to_string(), conn.clone());
        Ok(conn)
    }

    pub async fn open_count(&self) -> usize {
        self.connections.lock().await.len()
    }
}
