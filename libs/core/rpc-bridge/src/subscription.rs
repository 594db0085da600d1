//! Per-queue consumer loop
//!
//! A [`Subscription`] owns one queue. It reads only as many entries as it has
//! free lanes, runs each delivery through the [`DeliveryHandler`] on its own
//! task, and settles it with the broker before giving the lane back.
//! Entries already held by a lane are never dispatched again from `recover`
//! or `claim_abandoned`, so a retry after a read failure leaves in-flight
//! work alone.
//!
//! ```text
//! Starting -> Active -> Draining -> Stopped
//!               |  ^
//!               v  |
//!             Retrying -> Stopped (retries exhausted)
//! ```

use crate::broker::{Broker, Delivery};
use crate::config::SubscriptionConfig;
use crate::context::BridgeContext;
use crate::error::BridgeError;
use crate::handler::DeliveryHandler;
use crate::metrics::BridgeMetrics;
use crate::operation::Operation;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use strum::{AsRefStr, Display};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Upper bound on own pending entries replayed at start.
const RECOVER_BATCH: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Starting,
    Active,
    Retrying,
    Draining,
    Stopped,
}

impl SubscriptionState {
    /// Gauge value for the state.
    pub fn code(&self) -> u8 {
        match self {
            SubscriptionState::Starting => 0,
            SubscriptionState::Active => 1,
            SubscriptionState::Retrying => 2,
            SubscriptionState::Draining => 3,
            SubscriptionState::Stopped => 4,
        }
    }
}

/// Snapshot published on the subscription's status channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionStatus {
    pub queue: String,
    pub state: SubscriptionState,
    pub concurrency: usize,
    /// Consecutive subscription-level failures.
    pub retries: u32,
    pub last_error: Option<String>,
}

impl SubscriptionStatus {
    /// Stopped because the retry budget ran out rather than on shutdown.
    pub fn is_failed(&self) -> bool {
        self.state == SubscriptionState::Stopped && self.last_error.is_some()
    }
}

/// Resolves once shutdown is signalled or the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Delivery ids currently held by a lane, counted so a same-id redelivery
/// running alongside the original does not clear it early.
#[derive(Clone, Default)]
struct InLanes(Arc<Mutex<HashMap<String, usize>>>);

impl InLanes {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self, id: &str) -> LaneGuard {
        *self.lock().entry(id.to_string()).or_insert(0) += 1;
        LaneGuard {
            lanes: self.clone(),
            id: id.to_string(),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }
}

/// Releases the id when the lane finishes or is aborted.
struct LaneGuard {
    lanes: InLanes,
    id: String,
}

impl Drop for LaneGuard {
    fn drop(&mut self) {
        let mut held = self.lanes.lock();
        if let Some(count) = held.get_mut(&self.id) {
            *count -= 1;
            if *count == 0 {
                held.remove(&self.id);
            }
        }
    }
}

pub struct Subscription {
    config: SubscriptionConfig,
    broker: Arc<dyn Broker>,
    handler: Arc<DeliveryHandler>,
    lanes: Arc<Semaphore>,
    in_lanes: InLanes,
    status: watch::Sender<SubscriptionStatus>,
    metrics: BridgeMetrics,
}

impl Subscription {
    pub fn new(
        context: &BridgeContext,
        operation: Arc<dyn Operation>,
        config: SubscriptionConfig,
    ) -> Self {
        let handler = DeliveryHandler::new(context, operation, &config);
        let (status, _) = watch::channel(SubscriptionStatus {
            queue: config.queue.clone(),
            state: SubscriptionState::Starting,
            concurrency: config.concurrency,
            retries: 0,
            last_error: None,
        });

        Self {
            broker: context.broker.clone(),
            handler: Arc::new(handler),
            lanes: Arc::new(Semaphore::new(config.concurrency)),
            in_lanes: InLanes::default(),
            metrics: BridgeMetrics::new(&config.queue),
            status,
            config,
        }
    }

    pub fn queue(&self) -> &str {
        &self.config.queue
    }

    pub fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    /// Watch the subscription's state.
    pub fn status(&self) -> watch::Receiver<SubscriptionStatus> {
        self.status.subscribe()
    }

    /// Consume until `shutdown` flips to true or retries run out.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> SubscriptionStatus {
        info!(
            queue = %self.config.queue,
            concurrency = self.config.concurrency,
            priority = self.config.priority,
            "Starting subscription"
        );

        let policy = self.config.effective_retry();
        let mut lanes = JoinSet::new();
        let mut retries = 0u32;
        let mut failure = None;

        loop {
            let error = match self.consume(&mut lanes, &mut shutdown, &mut retries).await {
                Ok(()) => break,
                Err(e) => e,
            };

            retries += 1;
            if !policy.allows(retries) {
                error!(
                    queue = %self.config.queue,
                    retries = retries - 1,
                    error = %error,
                    "Subscription retries exhausted, stopping"
                );
                failure = Some(error.to_string());
                break;
            }

            let delay = policy.delay(retries);
            warn!(
                queue = %self.config.queue,
                retry = retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Subscription error, backing off"
            );
            self.metrics.subscription_retry();
            self.transition(SubscriptionState::Retrying, |status| {
                status.retries = retries;
                status.last_error = Some(error.to_string());
            });

            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.drain(&mut lanes).await;
        self.transition(SubscriptionState::Stopped, |status| {
            status.last_error = failure;
        });
        info!(queue = %self.config.queue, "Subscription stopped");
        self.status.borrow().clone()
    }

    /// The read loop. Returns `Ok` on shutdown.
    async fn consume(
        &self,
        lanes: &mut JoinSet<()>,
        shutdown: &mut watch::Receiver<bool>,
        retries: &mut u32,
    ) -> Result<(), BridgeError> {
        let queue = self.config.queue.as_str();
        self.broker.ensure_queue(queue).await?;

        let recovered = self.not_in_lanes(self.broker.recover(queue, RECOVER_BATCH).await?);
        if !recovered.is_empty() {
            info!(queue = %queue, count = recovered.len(), "Replaying own pending entries");
        }
        for delivery in recovered {
            let Some(permit) = self.acquire_lane(shutdown).await else {
                return Ok(());
            };
            self.dispatch(lanes, permit, delivery);
        }

        self.transition(SubscriptionState::Active, |_| {});
        let mut last_claim = Instant::now();

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            self.reap(lanes);

            if last_claim.elapsed() >= self.config.claim_interval {
                last_claim = Instant::now();
                let free = self.lanes.available_permits();
                if free > 0 {
                    match self
                        .broker
                        .claim_abandoned(queue, free, self.config.claim_timeout)
                        .await
                    {
                        Ok(claimed) => {
                            let claimed = self.not_in_lanes(claimed);
                            if !claimed.is_empty() {
                                info!(queue = %queue, count = claimed.len(), "Claimed abandoned entries");
                            }
                            self.dispatch_all(lanes, claimed, shutdown).await;
                        }
                        Err(e) => debug!(queue = %queue, error = %e, "Failed to claim abandoned entries"),
                    }
                }
            }

            // Wait for a free lane before reading
            let Some(permit) = self.acquire_lane(shutdown).await else {
                return Ok(());
            };
            let free = 1 + self.lanes.available_permits();

            let deliveries = match self.broker.receive(queue, free, self.config.block).await {
                Ok(deliveries) => deliveries,
                Err(e) if e.is_nogroup_error() => {
                    warn!(queue = %queue, "Consumer group missing, recreating");
                    self.broker.ensure_queue(queue).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if *retries > 0 {
                info!(queue = %queue, retries = *retries, "Subscription recovered");
                *retries = 0;
                self.transition(SubscriptionState::Active, |status| {
                    status.retries = 0;
                    status.last_error = None;
                });
            }

            let mut deliveries = deliveries.into_iter();
            match deliveries.next() {
                Some(first) => self.dispatch(lanes, permit, first),
                None => continue,
            }
            self.dispatch_all(lanes, deliveries, shutdown).await;
        }
    }

    /// Drop entries a lane is already working on.
    fn not_in_lanes(&self, deliveries: Vec<Delivery>) -> Vec<Delivery> {
        deliveries
            .into_iter()
            .filter(|delivery| {
                let held = self.in_lanes.contains(&delivery.id);
                if held {
                    debug!(
                        queue = %delivery.queue,
                        delivery_id = %delivery.id,
                        "Skipping entry already in a lane"
                    );
                }
                !held
            })
            .collect()
    }

    async fn dispatch_all(
        &self,
        lanes: &mut JoinSet<()>,
        deliveries: impl IntoIterator<Item = Delivery>,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        for delivery in deliveries {
            match self.acquire_lane(shutdown).await {
                Some(permit) => self.dispatch(lanes, permit, delivery),
                // Left pending for redelivery
                None => return,
            }
        }
    }

    /// A free lane, or `None` once shutdown is requested.
    async fn acquire_lane(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<OwnedSemaphorePermit> {
        if let Ok(permit) = self.lanes.clone().try_acquire_owned() {
            return Some(permit);
        }
        tokio::select! {
            permit = self.lanes.clone().acquire_owned() => permit.ok(),
            _ = shutdown_requested(shutdown) => None,
        }
    }

    /// Run one delivery on its own lane. The permit is held through settlement.
    fn dispatch(&self, lanes: &mut JoinSet<()>, permit: OwnedSemaphorePermit, delivery: Delivery) {
        let handler = self.handler.clone();
        let broker = self.broker.clone();
        let metrics = self.metrics.clone();
        let lane_budget = self.lanes.clone();
        let concurrency = self.config.concurrency;
        let held = self.in_lanes.enter(&delivery.id);

        metrics.in_flight(concurrency - lane_budget.available_permits());
        lanes.spawn(async move {
            let _held = held;
            let handled = handler.handle(&delivery).await;
            if let Err(e) = broker
                .settle(&delivery, handled.outcome, handled.reason.as_deref())
                .await
            {
                warn!(
                    queue = %delivery.queue,
                    delivery_id = %delivery.id,
                    outcome = %handled.outcome,
                    error = %e,
                    "Failed to settle delivery"
                );
            }
            metrics.delivery_settled(handled.outcome);
            debug!(
                queue = %delivery.queue,
                delivery_id = %delivery.id,
                outcome = %handled.outcome,
                "Delivery settled"
            );
            drop(permit);
            metrics.in_flight(concurrency - lane_budget.available_permits());
        });
    }

    fn reap(&self, lanes: &mut JoinSet<()>) {
        while let Some(joined) = lanes.try_join_next() {
            if let Err(e) = joined {
                error!(queue = %self.config.queue, error = %e, "Delivery task failed");
            }
        }
    }

    async fn drain(&self, lanes: &mut JoinSet<()>) {
        self.transition(SubscriptionState::Draining, |_| {});
        if lanes.is_empty() {
            return;
        }

        info!(queue = %self.config.queue, in_flight = lanes.len(), "Draining in-flight deliveries");
        let queue = self.config.queue.as_str();
        let finished = tokio::time::timeout(self.config.drain_timeout, async {
            while let Some(joined) = lanes.join_next().await {
                if let Err(e) = joined {
                    error!(queue = %queue, error = %e, "Delivery task failed");
                }
            }
        })
        .await;

        if finished.is_err() {
            warn!(
                queue = %queue,
                remaining = lanes.len(),
                "Drain timed out, abandoning deliveries to redelivery"
            );
            lanes.abort_all();
            while lanes.join_next().await.is_some() {}
        }
    }

    fn transition(&self, state: SubscriptionState, update: impl FnOnce(&mut SubscriptionStatus)) {
        self.status.send_modify(|status| {
            status.state = state;
            update(status);
        });
        self.metrics.subscription_state(state.code());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::cache::InMemoryCache;
    use crate::config::BridgeSettings;
    use crate::envelope::RequestEnvelope;
    use crate::operation::{OperationError, Verb};
    use crate::outcome::AckOutcome;
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Echo {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Operation for Echo {
        fn resource(&self) -> &str {
            "player"
        }

        async fn execute(&self, _verb: Verb, payload: Value) -> Result<Value, OperationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(payload)
        }
    }

    /// Holds every call until `gate` is opened.
    struct Gated {
        calls: AtomicU32,
        started: Notify,
        gate: Notify,
    }

    #[async_trait]
    impl Operation for Gated {
        fn resource(&self) -> &str {
            "player"
        }

        async fn execute(&self, _verb: Verb, payload: Value) -> Result<Value, OperationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            self.gate.notified().await;
            Ok(payload)
        }
    }

    fn gated(
        broker: &InMemoryBroker,
        cache: &InMemoryCache,
        config: SubscriptionConfig,
    ) -> (Subscription, Arc<Gated>) {
        let context = BridgeContext::new(
            Arc::new(broker.clone()),
            Arc::new(cache.clone()),
            &BridgeSettings::default(),
        );
        let op = Arc::new(Gated {
            calls: AtomicU32::new(0),
            started: Notify::new(),
            gate: Notify::new(),
        });
        (Subscription::new(&context, op.clone(), config), op)
    }

    async fn enqueue_lookup(broker: &InMemoryBroker, name: &str) -> String {
        let envelope = RequestEnvelope::new("/player/get-by-name", "POST", json!(name));
        broker
            .enqueue("player-get-by-name", &envelope.encode().unwrap())
            .await
    }

    fn subscription(broker: &InMemoryBroker, config: SubscriptionConfig) -> (Subscription, Arc<Echo>) {
        let context = BridgeContext::new(
            Arc::new(broker.clone()),
            Arc::new(InMemoryCache::new()),
            &BridgeSettings::default(),
        );
        let echo = Arc::new(Echo {
            calls: AtomicU32::new(0),
        });
        (Subscription::new(&context, echo.clone(), config), echo)
    }

    fn fast(config: SubscriptionConfig) -> SubscriptionConfig {
        config
            .with_block(Duration::from_millis(10))
            .with_retry(
                RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(5))
                    .with_max_attempts(2),
            )
    }

    async fn wait_for_settlements(broker: &InMemoryBroker, queue: &str, count: usize) {
        for _ in 0..200 {
            if broker.settlements(queue).await.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {} settlements on {}", count, queue);
    }

    #[test]
    fn test_state_codes_are_distinct() {
        let codes: std::collections::HashSet<u8> = [
            SubscriptionState::Starting,
            SubscriptionState::Active,
            SubscriptionState::Retrying,
            SubscriptionState::Draining,
            SubscriptionState::Stopped,
        ]
        .iter()
        .map(|s| s.code())
        .collect();
        assert_eq!(codes.len(), 5);
        assert_eq!(SubscriptionState::Retrying.to_string(), "retrying");
    }

    #[tokio::test]
    async fn test_processes_and_stops_on_shutdown() {
        let broker = InMemoryBroker::new();
        let (sub, echo) = subscription(&broker, fast(SubscriptionConfig::new("player", Verb::Insert)));
        let mut status = sub.status();
        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn(sub.run(shutdown));

        let envelope = RequestEnvelope::new("/player/insert", "POST", json!({"name": "Alice"}));
        broker.enqueue("player-insert", &envelope.encode().unwrap()).await;
        wait_for_settlements(&broker, "player-insert", 1).await;

        assert!(broker.has_group("player-insert").await);
        assert_eq!(status.borrow_and_update().state, SubscriptionState::Active);

        stop.send(true).unwrap();
        let last = handle.await.unwrap();
        assert_eq!(last.state, SubscriptionState::Stopped);
        assert!(!last.is_failed());
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            broker.settlements("player-insert").await[0].1,
            AckOutcome::Ack
        );
    }

    #[tokio::test]
    async fn test_exhausted_retries_stop_subscription() {
        let broker = InMemoryBroker::new();
        broker.fail_next_receives(100);
        let (sub, _) = subscription(&broker, fast(SubscriptionConfig::new("player", Verb::GetAll)));
        let (_stop, shutdown) = watch::channel(false);

        let last = tokio::time::timeout(Duration::from_secs(5), sub.run(shutdown))
            .await
            .unwrap();

        assert!(last.is_failed());
        assert!(last.last_error.unwrap().contains("injected"));
    }

    #[tokio::test]
    async fn test_priority_queue_outlasts_the_retry_budget() {
        let broker = InMemoryBroker::new();
        broker.fail_next_receives(5);
        let config = fast(SubscriptionConfig::new("player", Verb::GetAll)).with_priority(true);
        let (sub, echo) = subscription(&broker, config);
        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn(sub.run(shutdown));

        let envelope = RequestEnvelope::new("/player/get-all", "GET", Value::Null);
        broker.enqueue("player-get-all", &envelope.encode().unwrap()).await;
        wait_for_settlements(&broker, "player-get-all", 1).await;

        stop.send(true).unwrap();
        let last = handle.await.unwrap();
        assert!(!last.is_failed());
        assert_eq!(last.retries, 0);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retrying_state_is_published() {
        let broker = InMemoryBroker::new();
        broker.fail_next_receives(1);
        let config = SubscriptionConfig::new("player", Verb::Exists)
            .with_block(Duration::from_millis(10))
            .with_retry(RetryPolicy::new(Duration::from_millis(100), Duration::from_millis(100)));
        let (sub, _) = subscription(&broker, config);
        let mut status = sub.status();
        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn(sub.run(shutdown));

        let retrying = tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| s.state == SubscriptionState::Retrying),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(retrying.retries, 1);

        stop.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_does_not_redispatch_entries_in_lanes() {
        let broker = InMemoryBroker::new();
        // Degraded cache, so nothing but lane tracking stops a second run
        let cache = InMemoryCache::new();
        cache.set_available(false);
        let config = fast(SubscriptionConfig::new("player", Verb::GetByName));
        let (sub, op) = gated(&broker, &cache, config);
        let mut status = sub.status();
        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn(sub.run(shutdown));

        let id = enqueue_lookup(&broker, "Alice").await;
        tokio::time::timeout(Duration::from_secs(2), op.started.notified())
            .await
            .unwrap();

        // Read failure while the entry is still in its lane; the retry
        // replays own pending entries
        broker.fail_next_receives(1);
        tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| s.state == SubscriptionState::Retrying),
        )
        .await
        .unwrap()
        .unwrap();
        tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| s.state == SubscriptionState::Active),
        )
        .await
        .unwrap()
        .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        op.gate.notify_one();
        wait_for_settlements(&broker, "player-get-by-name", 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(op.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            broker.settlements("player-get-by-name").await,
            vec![(id, AckOutcome::Ack)]
        );

        stop.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight_settlement() {
        let broker = InMemoryBroker::new();
        let (sub, op) = gated(
            &broker,
            &InMemoryCache::new(),
            fast(SubscriptionConfig::new("player", Verb::GetByName)),
        );
        let mut status = sub.status();
        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn(sub.run(shutdown));

        let id = enqueue_lookup(&broker, "Alice").await;
        tokio::time::timeout(Duration::from_secs(2), op.started.notified())
            .await
            .unwrap();

        stop.send(true).unwrap();
        tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| s.state == SubscriptionState::Draining),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(broker.settlements("player-get-by-name").await.is_empty());

        op.gate.notify_one();
        let last = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(last.state, SubscriptionState::Stopped);
        assert_eq!(
            broker.settlements("player-get-by-name").await,
            vec![(id, AckOutcome::Ack)]
        );
        assert_eq!(broker.unsettled("player-get-by-name").await, 0);
    }

    #[tokio::test]
    async fn test_drain_timeout_leaves_entry_unsettled() {
        let broker = InMemoryBroker::new();
        let config = fast(SubscriptionConfig::new("player", Verb::GetByName))
            .with_drain_timeout(Duration::from_millis(50));
        let (sub, op) = gated(&broker, &InMemoryCache::new(), config);
        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn(sub.run(shutdown));

        enqueue_lookup(&broker, "Alice").await;
        tokio::time::timeout(Duration::from_secs(2), op.started.notified())
            .await
            .unwrap();

        // The gate never opens
        stop.send(true).unwrap();
        let last = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(last.state, SubscriptionState::Stopped);
        assert!(!last.is_failed());
        assert_eq!(op.calls.load(Ordering::SeqCst), 1);
        assert!(broker.settlements("player-get-by-name").await.is_empty());
        assert_eq!(broker.unsettled("player-get-by-name").await, 1);
    }
}
