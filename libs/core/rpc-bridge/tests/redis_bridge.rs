//! Bridge against a real Redis
//!
//! Run with: cargo test -p rpc-bridge --test redis_bridge -- --ignored

use async_trait::async_trait;
use core_config::redis::RedisConfig;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::StreamRangeReply;
use rpc_bridge::*;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use test_utils::{TestDataBuilder, TestRedis};

struct Echo {
    calls: AtomicUsize,
}

#[async_trait]
impl Operation for Echo {
    fn resource(&self) -> &str {
        "player"
    }

    async fn execute(&self, verb: Verb, payload: Value) -> Result<Value, OperationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match (verb, payload.as_str()) {
            (Verb::GetByName, Some("Ghost")) => Err(OperationError::NotFound("player Ghost".into())),
            _ => Ok(json!({ "verb": verb.to_string(), "payload": payload })),
        }
    }
}

async fn results(conn: &mut ConnectionManager, stream: &str) -> Vec<ResultMessage> {
    let reply: StreamRangeReply = conn.xrange_all(stream).await.unwrap();
    reply
        .ids
        .iter()
        .filter_map(|entry| entry.get::<Vec<u8>>("payload"))
        .map(|bytes| ResultMessage::decode(&bytes).unwrap())
        .collect()
}

async fn wait_for_result(
    conn: &mut ConnectionManager,
    stream: &str,
    request_id: &str,
) -> ResultMessage {
    for _ in 0..200 {
        if let Some(found) = results(conn, stream)
            .await
            .into_iter()
            .find(|r| r.request_id() == request_id)
        {
            return found;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("no result for {}", request_id);
}

fn broker(redis: &TestRedis, settings: &BridgeSettings) -> RedisStreamBroker {
    let readers = ReaderConnections::new(
        &RedisConfig::new(redis.connection_string()),
        settings.read_response_timeout,
    )
    .unwrap();
    RedisStreamBroker::new(
        redis.connection(),
        readers,
        &settings.consumer_group,
        &settings.consumer_id,
    )
}

async fn send(conn: &mut ConnectionManager, queue: &str, envelope: &RequestEnvelope) -> String {
    conn.xadd(queue, "*", &[("payload", envelope.encode().unwrap())])
        .await
        .unwrap()
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_round_trip_over_redis_streams() {
    let redis = TestRedis::new().await;
    let builder = TestDataBuilder::from_test_name("test_round_trip_over_redis_streams");
    let settings = BridgeSettings {
        wave_delay: Duration::from_millis(1),
        block: Duration::from_millis(50),
        drain_timeout: Duration::from_secs(1),
        ..BridgeSettings::default()
    };

    let broker = Arc::new(broker(&redis, &settings));
    let store = Arc::new(RedisCache::new(redis.connection()));
    let context = BridgeContext::new(broker.clone(), store, &settings);
    let echo = Arc::new(Echo {
        calls: AtomicUsize::new(0),
    });
    let running = Bootstrap::new(context, settings.clone())
        .with_operation(echo.clone())
        .start()
        .await
        .unwrap();

    let mut conn = redis.connection();
    let result_stream = settings.result_destination.stream_key();
    let found_id = builder.request_id(1);
    let missing_id = builder.request_id(2);

    let found = RequestEnvelope::with_request_id(&found_id, "/player/get-by-name", "POST", json!("Alice"));
    send(&mut conn, "player-get-by-name", &found).await;
    // The same request a second time
    send(&mut conn, "player-get-by-name", &found).await;
    let missing =
        RequestEnvelope::with_request_id(&missing_id, "/player/get-by-name", "POST", json!("Ghost"));
    send(&mut conn, "player-get-by-name", &missing).await;
    conn.xadd::<_, _, _, _, String>("player-get-by-name", "*", &[("payload", "not json")])
        .await
        .unwrap();

    let ok = wait_for_result(&mut conn, &result_stream, &found_id).await;
    assert!(ok.is_completed());
    assert_eq!(ok.data().unwrap()["payload"], "Alice");

    let failed = wait_for_result(&mut conn, &result_stream, &missing_id).await;
    assert_eq!(failed.status(), ResultStatus::Failed);

    for _ in 0..40 {
        if broker.dead_letter_stats("player-get-by-name").await.unwrap().length == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let stats = broker.dead_letter_stats("player-get-by-name").await.unwrap();
    assert_eq!(stats.length, 1);
    assert_eq!(stats.stream_name, "player-get-by-name:dlq");

    // One execution per request id, however many entries carried it
    assert_eq!(echo.calls.load(Ordering::SeqCst), 2);

    let summary = running.shutdown().await;
    assert_eq!(summary.failed, 0);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_blocking_reads_leave_cache_and_publish_responsive() {
    let redis = TestRedis::new().await;
    let builder =
        TestDataBuilder::from_test_name("test_blocking_reads_leave_cache_and_publish_responsive");
    // Past the client's default 500 ms response timeout
    let settings = BridgeSettings {
        wave_delay: Duration::from_millis(1),
        block: Duration::from_millis(1500),
        read_response_timeout: Duration::from_secs(3),
        drain_timeout: Duration::from_secs(3),
        ..BridgeSettings::default()
    };
    settings.validate().unwrap();

    let broker = Arc::new(broker(&redis, &settings));
    let store = Arc::new(RedisCache::new(redis.connection()));
    let context = BridgeContext::new(broker.clone(), store.clone(), &settings);
    let echo = Arc::new(Echo {
        calls: AtomicUsize::new(0),
    });
    let running = Bootstrap::new(context, settings.clone())
        .with_operation(echo.clone())
        .start()
        .await
        .unwrap();

    // Every subscription is parked in a blocking read by now
    tokio::time::sleep(Duration::from_millis(300)).await;
    for _ in 0..5 {
        let started = std::time::Instant::now();
        store.get("bridge:idle-check").await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(250));
    }
    broker.ping().await.unwrap();

    // Arrives mid-block, after the default response timeout would have fired
    tokio::time::sleep(Duration::from_millis(400)).await;
    let mut conn = redis.connection();
    let request_id = builder.request_id(1);
    let request =
        RequestEnvelope::with_request_id(&request_id, "/player/get-by-name", "POST", json!("Alice"));
    send(&mut conn, "player-get-by-name", &request).await;

    let result = wait_for_result(
        &mut conn,
        &settings.result_destination.stream_key(),
        &request_id,
    )
    .await;
    assert!(result.is_completed());
    assert_eq!(echo.calls.load(Ordering::SeqCst), 1);

    let summary = running.shutdown().await;
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.aborted, 0);
}
