//! Per-delivery processing
//!
//! [`DeliveryHandler::handle`] turns one delivery into an [`AckOutcome`]:
//!
//! | Situation | Result message | Outcome |
//! |---|---|---|
//! | undecodable bytes | none | NackDiscard |
//! | request already completed | cached result replayed | Ack |
//! | in flight under another delivery | none | Ack |
//! | in flight under this same delivery | none | NackRequeue |
//! | success | completed | Ack |
//! | not found | failed | Ack |
//! | validation, conflict, exhausted retries | failed | NackDiscard |
//! | result could not be published | none | NackRequeue |
//!
//! The outcome record is written to the idempotency ledger before the result
//! is published, so a redelivery after a failed publish replays it instead of
//! running the operation again.

use crate::broker::Delivery;
use crate::cache::{CacheLookup, Claim, IdempotencyGuard, ResultCache};
use crate::classify::ErrorClassifier;
use crate::config::SubscriptionConfig;
use crate::context::BridgeContext;
use crate::envelope::{RequestEnvelope, ResultMessage};
use crate::error::ErrorKind;
use crate::metrics::BridgeMetrics;
use crate::operation::{Operation, OperationError, Verb};
use crate::outcome::AckOutcome;
use crate::publisher::ResultPublisher;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Decision for one delivery plus the reason recorded on dead letters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handled {
    pub outcome: AckOutcome,
    pub reason: Option<String>,
}

impl Handled {
    fn ack() -> Self {
        Self {
            outcome: AckOutcome::Ack,
            reason: None,
        }
    }

    fn requeue(reason: impl Into<String>) -> Self {
        Self {
            outcome: AckOutcome::NackRequeue,
            reason: Some(reason.into()),
        }
    }

    fn discard(reason: impl Into<String>) -> Self {
        Self {
            outcome: AckOutcome::NackDiscard,
            reason: Some(reason.into()),
        }
    }
}

/// Outcome for a classified operation failure.
fn failure_outcome(kind: ErrorKind) -> AckOutcome {
    if kind.is_benign() {
        AckOutcome::Ack
    } else {
        AckOutcome::NackDiscard
    }
}

#[derive(Clone)]
pub struct DeliveryHandler {
    operation: Arc<dyn Operation>,
    verb: Verb,
    resource: String,
    queue: String,
    guard: IdempotencyGuard,
    results: ResultCache,
    publisher: ResultPublisher,
    classifier: Arc<ErrorClassifier>,
    metrics: BridgeMetrics,
}

impl DeliveryHandler {
    pub fn new(
        context: &BridgeContext,
        operation: Arc<dyn Operation>,
        config: &SubscriptionConfig,
    ) -> Self {
        Self {
            operation,
            verb: config.verb,
            resource: config.resource.clone(),
            queue: config.queue.clone(),
            guard: context.guard.clone(),
            results: context.results.clone(),
            publisher: context.publisher.clone(),
            classifier: context.classifier.clone(),
            metrics: BridgeMetrics::new(&config.queue),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub async fn handle(&self, delivery: &Delivery) -> Handled {
        self.metrics.delivery_received();

        let envelope = match RequestEnvelope::decode(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    queue = %self.queue,
                    delivery_id = %delivery.id,
                    raw = %String::from_utf8_lossy(&delivery.payload),
                    error = %e,
                    "Discarding undecodable delivery"
                );
                return Handled::discard(format!("{}: {}", ErrorKind::Decode, e));
            }
        };
        let request_id = envelope.request_id.as_str();

        let protected = match self.guard.claim(&self.queue, request_id, &delivery.id).await {
            Claim::Acquired => true,
            Claim::Reclaimed { previous_owner } => {
                info!(
                    queue = %self.queue,
                    request_id = %request_id,
                    previous_owner = ?previous_owner,
                    "Processing reclaimed request"
                );
                true
            }
            Claim::Completed(result) => return self.replay(&result).await,
            Claim::InFlight {
                same_delivery: true,
                owner,
            } => {
                debug!(
                    queue = %self.queue,
                    request_id = %request_id,
                    owner = %owner,
                    "Same delivery still in flight elsewhere, deferring"
                );
                return Handled::requeue("claim held by a live processor");
            }
            Claim::InFlight {
                same_delivery: false,
                owner,
            } => {
                self.metrics.duplicate_observed();
                debug!(
                    queue = %self.queue,
                    request_id = %request_id,
                    owner = %owner,
                    "Duplicate of an in-flight request, acknowledging"
                );
                return Handled::ack();
            }
            Claim::Degraded(e) => {
                self.metrics.degraded();
                warn!(
                    queue = %self.queue,
                    request_id = %request_id,
                    error = %e,
                    "Cache unavailable, processing without idempotency protection"
                );
                false
            }
        };

        match self.produce(envelope.payload).await {
            Ok(data) => {
                let result = self.publisher.completed(request_id, data);
                if protected {
                    self.record(request_id, &delivery.id, &result).await;
                }
                self.emit(&result, Handled::ack()).await
            }
            Err((err, kind)) => {
                self.log_failure(request_id, &err, kind);
                let result = self.publisher.failed(request_id, &err.to_string());
                if protected {
                    if kind.max_retries() == 0 {
                        self.record(request_id, &delivery.id, &result).await;
                    } else if let Err(e) = self.guard.release(&self.queue, request_id).await {
                        debug!(request_id = %request_id, error = %e, "Failed to release claim");
                    }
                }
                let handled = match failure_outcome(kind) {
                    AckOutcome::Ack => Handled::ack(),
                    _ => Handled::discard(format!("{}: {}", kind, err)),
                };
                self.emit(&result, handled).await
            }
        }
    }

    /// Serve a read from the result cache or run the operation.
    async fn produce(&self, payload: Value) -> Result<Value, (OperationError, ErrorKind)> {
        if !self.verb.is_read() {
            let data = self.execute(payload).await?;
            if let Err(e) = self.results.invalidate(&self.resource).await {
                warn!(resource = %self.resource, error = %e, "Result cache invalidation failed");
            }
            return Ok(data);
        }

        let shape = ResultCache::query_shape(self.verb, &payload);
        match self.results.lookup(&self.resource, &shape).await {
            CacheLookup::Hit(data) => {
                self.metrics.cache_lookup(true);
                Ok(data)
            }
            CacheLookup::Miss { key } => {
                self.metrics.cache_lookup(false);
                let data = self.execute(payload).await?;
                self.results.store(&key, &data).await;
                Ok(data)
            }
            CacheLookup::Bypass => self.execute(payload).await,
        }
    }

    /// Run the operation, retrying retryable kinds in-lane.
    async fn execute(&self, payload: Value) -> Result<Value, (OperationError, ErrorKind)> {
        let mut retries = 0;
        loop {
            let started = Instant::now();
            match self.operation.execute(self.verb, payload.clone()).await {
                Ok(data) => {
                    self.metrics.operation_finished(started.elapsed(), None);
                    return Ok(data);
                }
                Err(err) => {
                    let kind = self.classifier.classify(&err);
                    self.metrics.operation_finished(started.elapsed(), Some(kind));
                    if !kind.should_retry(retries) {
                        return Err((err, kind));
                    }

                    let delay = kind.backoff_delay(retries);
                    retries += 1;
                    self.metrics.operation_retried(kind);
                    debug!(
                        queue = %self.queue,
                        error_kind = %kind,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying operation"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn record(&self, request_id: &str, delivery_id: &str, result: &ResultMessage) {
        if let Err(e) = self
            .guard
            .complete(&self.queue, request_id, delivery_id, result)
            .await
        {
            warn!(request_id = %request_id, error = %e, "Failed to record outcome");
        }
    }

    async fn replay(&self, result: &ResultMessage) -> Handled {
        debug!(
            queue = %self.queue,
            request_id = %result.request_id(),
            "Request already completed, replaying result"
        );
        self.emit(result, Handled::ack()).await
    }

    /// Publish `result`; a publish failure overrides `handled` with a requeue.
    async fn emit(&self, result: &ResultMessage, handled: Handled) -> Handled {
        match self.publisher.publish(&self.resource, result).await {
            Ok(()) => {
                self.metrics.result_published(result.status().as_ref());
                handled
            }
            Err(e) => {
                error!(
                    queue = %self.queue,
                    request_id = %result.request_id(),
                    error = %e,
                    "Failed to publish result, leaving delivery for redelivery"
                );
                Handled::requeue(e.to_string())
            }
        }
    }

    fn log_failure(&self, request_id: &str, err: &OperationError, kind: ErrorKind) {
        match kind {
            ErrorKind::Unclassified => error!(
                queue = %self.queue,
                request_id = %request_id,
                error_kind = %kind,
                error = %err,
                "Operation failed with an unclassified error"
            ),
            ErrorKind::NotFound => info!(
                queue = %self.queue,
                request_id = %request_id,
                error = %err,
                "Requested entity not found"
            ),
            _ => warn!(
                queue = %self.queue,
                request_id = %request_id,
                error_kind = %kind,
                error = %err,
                "Operation failed"
            ),
        }
    }
}
