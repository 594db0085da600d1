//! In-process broker
//!
//! Streams are plain queues held in memory. A requeued delivery becomes
//! visible again after `redelivery_delay` with its delivery count bumped,
//! which is what a broker redelivering an unacknowledged message looks like
//! from the consumer's side. Every stream keeps the full history of what was
//! appended to it so tests can inspect published results.
//!
//! Failure injection: [`InMemoryBroker::fail_next_receives`] and
//! [`InMemoryBroker::set_publish_failing`].

use super::{Broker, Delivery};
use crate::dead_letter::{DeadLetterEntry, DeadLetterStats, dead_letter_stream};
use crate::envelope::Destination;
use crate::error::BridgeError;
use crate::outcome::AckOutcome;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Default)]
struct StreamState {
    history: Vec<Vec<u8>>,
    ready: VecDeque<Delivery>,
    delayed: Vec<(Instant, Delivery)>,
    unsettled: HashMap<String, Delivery>,
    settlements: Vec<(String, AckOutcome)>,
    dead: Vec<DeadLetterEntry>,
}

impl StreamState {
    fn promote_delayed(&mut self, now: Instant) {
        let (due, waiting): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|(at, _)| *at <= now);
        self.delayed = waiting;
        self.ready.extend(due.into_iter().map(|(_, delivery)| delivery));
    }
}

#[derive(Default)]
struct State {
    streams: HashMap<String, StreamState>,
    groups: HashSet<String>,
    // Creation order, for startup assertions
    group_log: Vec<(String, Instant)>,
    next_id: u64,
}

impl State {
    fn append(&mut self, stream: &str, payload: &[u8]) -> String {
        self.next_id += 1;
        let id = format!("{}-0", self.next_id);
        let entry = self.streams.entry(stream.to_string()).or_default();
        entry.history.push(payload.to_vec());
        entry.ready.push_back(Delivery {
            id: id.clone(),
            queue: stream.to_string(),
            payload: payload.to_vec(),
            delivery_count: 1,
        });
        id
    }
}

fn entry_sequence(id: &str) -> u64 {
    id.split('-')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(u64::MAX)
}

/// Broker double with at-least-once redelivery semantics.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
    redelivery_delay: Duration,
    failing_receives: Arc<AtomicUsize>,
    publish_failing: Arc<AtomicBool>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            notify: Arc::new(Notify::new()),
            redelivery_delay: Duration::from_millis(20),
            failing_receives: Arc::new(AtomicUsize::new(0)),
            publish_failing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    /// Append raw bytes to a queue, as a caller would.
    pub async fn enqueue(&self, queue: &str, payload: &[u8]) -> String {
        let id = self.state.lock().await.append(queue, payload);
        self.notify.notify_waiters();
        id
    }

    /// Hand an entry that was already delivered out again, as the broker does
    /// when a consumer's lease on it lapses.
    pub async fn redeliver(&self, queue: &str, delivery_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(stream) = state.streams.get_mut(queue) else {
            return false;
        };
        let Some(delivery) = stream.unsettled.get(delivery_id) else {
            return false;
        };
        let mut again = delivery.clone();
        again.delivery_count += 1;
        stream.ready.push_back(again);
        drop(state);
        self.notify.notify_waiters();
        true
    }

    /// Everything ever appended to `destination`.
    pub async fn published(&self, destination: &Destination) -> Vec<Vec<u8>> {
        self.history(&destination.stream_key()).await
    }

    pub async fn history(&self, stream: &str) -> Vec<Vec<u8>> {
        let state = self.state.lock().await;
        state
            .streams
            .get(stream)
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    /// Settlement decisions for `queue`, in order.
    pub async fn settlements(&self, queue: &str) -> Vec<(String, AckOutcome)> {
        let state = self.state.lock().await;
        state
            .streams
            .get(queue)
            .map(|s| s.settlements.clone())
            .unwrap_or_default()
    }

    /// Entries waiting to be handed out, including delayed redeliveries.
    pub async fn backlog(&self, queue: &str) -> usize {
        let state = self.state.lock().await;
        state
            .streams
            .get(queue)
            .map(|s| s.ready.len() + s.delayed.len())
            .unwrap_or(0)
    }

    /// Entries handed out and not yet settled.
    pub async fn unsettled(&self, queue: &str) -> usize {
        let state = self.state.lock().await;
        state
            .streams
            .get(queue)
            .map(|s| s.unsettled.len())
            .unwrap_or(0)
    }

    pub async fn has_group(&self, queue: &str) -> bool {
        self.state.lock().await.groups.contains(queue)
    }

    /// Queues whose group was created, in creation order, with the time.
    pub async fn groups_created(&self) -> Vec<(String, Instant)> {
        self.state.lock().await.group_log.clone()
    }

    /// Make the next `count` receive calls fail with a transport error.
    pub fn fail_next_receives(&self, count: usize) {
        self.failing_receives.store(count, Ordering::SeqCst);
    }

    pub fn set_publish_failing(&self, failing: bool) {
        self.publish_failing.store(failing, Ordering::SeqCst);
    }

    fn take_receive_failure(&self) -> bool {
        self.failing_receives
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn ensure_queue(&self, queue: &str) -> Result<(), BridgeError> {
        let mut state = self.state.lock().await;
        if state.groups.insert(queue.to_string()) {
            state.group_log.push((queue.to_string(), Instant::now()));
        }
        state.streams.entry(queue.to_string()).or_default();
        Ok(())
    }

    /// Everything handed out and not settled yet, oldest first. There is a
    /// single consumer, so that is all "own pending" entries.
    async fn recover(&self, queue: &str, count: usize) -> Result<Vec<Delivery>, BridgeError> {
        let state = self.state.lock().await;
        let Some(stream) = state.streams.get(queue) else {
            return Ok(vec![]);
        };

        let mut pending: Vec<Delivery> = stream.unsettled.values().cloned().collect();
        pending.sort_by_key(|delivery| entry_sequence(&delivery.id));
        pending.truncate(count);
        for delivery in &mut pending {
            delivery.delivery_count += 1;
        }
        Ok(pending)
    }

    async fn receive(
        &self,
        queue: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, BridgeError> {
        if self.take_receive_failure() {
            return Err(BridgeError::Transport(format!("{}: injected receive failure", queue)));
        }

        let deadline = Instant::now() + block;
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                let stream = state.streams.entry(queue.to_string()).or_default();
                stream.promote_delayed(Instant::now());

                let take = count.min(stream.ready.len());
                if take > 0 {
                    let batch: Vec<Delivery> = stream.ready.drain(..take).collect();
                    for delivery in &batch {
                        stream.unsettled.insert(delivery.id.clone(), delivery.clone());
                    }
                    return Ok(batch);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(vec![]);
            }
            let _ = tokio::time::timeout((deadline - now).min(POLL_INTERVAL), notified).await;
        }
    }

    async fn claim_abandoned(
        &self,
        _queue: &str,
        _count: usize,
        _min_idle: Duration,
    ) -> Result<Vec<Delivery>, BridgeError> {
        Ok(vec![])
    }

    async fn settle(
        &self,
        delivery: &Delivery,
        outcome: AckOutcome,
        reason: Option<&str>,
    ) -> Result<(), BridgeError> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let dlq_id = format!("{}-0", state.next_id);
        let stream = state.streams.entry(delivery.queue.clone()).or_default();

        stream.unsettled.remove(&delivery.id);
        stream.settlements.push((delivery.id.clone(), outcome));

        match outcome {
            AckOutcome::Ack => {}
            AckOutcome::NackDiscard => {
                stream.dead.push(DeadLetterEntry::from_delivery(
                    dlq_id,
                    delivery,
                    reason.unwrap_or("discarded"),
                ));
            }
            AckOutcome::NackRequeue => {
                let mut again = delivery.clone();
                again.delivery_count += 1;
                stream
                    .delayed
                    .push((Instant::now() + self.redelivery_delay, again));
            }
        }
        Ok(())
    }

    async fn publish(
        &self,
        destination: &Destination,
        payload: &[u8],
    ) -> Result<String, BridgeError> {
        if self.publish_failing.load(Ordering::SeqCst) {
            return Err(BridgeError::Publish(format!("{}: broker unreachable", destination)));
        }
        Ok(self.enqueue(&destination.stream_key(), payload).await)
    }

    async fn ping(&self) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn dead_letter_stats(&self, queue: &str) -> Result<DeadLetterStats, BridgeError> {
        let state = self.state.lock().await;
        let dead = state.streams.get(queue).map(|s| s.dead.as_slice()).unwrap_or(&[]);
        Ok(DeadLetterStats {
            stream_name: dead_letter_stream(queue),
            length: dead.len() as u64,
            oldest_entry_id: dead.first().map(|e| e.dlq_id.clone()),
            newest_entry_id: dead.last().map(|e| e.dlq_id.clone()),
        })
    }

    async fn dead_letters(
        &self,
        queue: &str,
        count: usize,
    ) -> Result<Vec<DeadLetterEntry>, BridgeError> {
        let state = self.state.lock().await;
        Ok(state
            .streams
            .get(queue)
            .map(|s| s.dead.iter().take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn replay_dead_letters(&self, queue: &str, count: usize) -> Result<usize, BridgeError> {
        let mut state = self.state.lock().await;
        let entries: Vec<DeadLetterEntry> = match state.streams.get_mut(queue) {
            Some(stream) => {
                let take = count.min(stream.dead.len());
                stream.dead.drain(..take).collect()
            }
            None => return Ok(0),
        };
        for entry in &entries {
            state.append(queue, entry.payload.as_bytes());
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(entries.len())
    }
}
