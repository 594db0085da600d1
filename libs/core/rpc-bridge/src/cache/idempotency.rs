//! Idempotency claims keyed by `(operation, requestId)`
//!
//! A claim is a JSON [`ClaimRecord`] stored with `set_if_absent`. The first
//! writer becomes the processor; everyone else is an observer. Once the
//! processor has an outcome it overwrites the record with `completed` and the
//! result, so later redeliveries replay the outcome instead of re-running the
//! operation.
//!
//! An `in_flight` record older than the liveness threshold belongs to a
//! worker that died before finishing. It is reclaimed with compare-and-swap so
//! that only one of several racing observers takes it over.

use super::{CacheError, CacheStore};
use crate::envelope::ResultMessage;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default lifetime of a claim key.
pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(300);

/// Default age after which an in-flight claim counts as abandoned.
pub const DEFAULT_CLAIM_LIVENESS: Duration = Duration::from_secs(60);

const KEY_PREFIX: &str = "idempotent";
const MAX_CLAIM_ROUNDS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimState {
    InFlight,
    Completed,
}

/// Stored claim value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub state: ClaimState,
    pub owner: String,
    pub delivery_id: String,
    pub claimed_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultMessage>,
}

impl ClaimRecord {
    fn in_flight(owner: &str, delivery_id: &str) -> Self {
        Self {
            state: ClaimState::InFlight,
            owner: owner.to_string(),
            delivery_id: delivery_id.to_string(),
            claimed_at_ms: Utc::now().timestamp_millis(),
            result: None,
        }
    }

    fn age(&self) -> Duration {
        let elapsed = Utc::now().timestamp_millis() - self.claimed_at_ms;
        Duration::from_millis(elapsed.max(0) as u64)
    }
}

/// Result of trying to claim a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// This caller created the claim and must process the request.
    Acquired,
    /// An abandoned or unreadable claim was taken over; process the request.
    Reclaimed { previous_owner: Option<String> },
    /// Someone else is processing the request right now.
    ///
    /// `same_delivery` is true when the stored claim was made for the very
    /// delivery being examined, i.e. the broker handed the same entry out again.
    InFlight { same_delivery: bool, owner: String },
    /// The request already has an outcome.
    Completed(ResultMessage),
    /// The store could not answer; proceed without protection.
    Degraded(CacheError),
}

impl Claim {
    /// Whether the caller should run the operation.
    pub fn should_process(&self) -> bool {
        matches!(
            self,
            Claim::Acquired | Claim::Reclaimed { .. } | Claim::Degraded(_)
        )
    }
}

/// De-duplication ledger on top of a [`CacheStore`].
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn CacheStore>,
    owner: String,
    ttl: Duration,
    liveness: Duration,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn CacheStore>, owner: impl Into<String>) -> Self {
        Self {
            store,
            owner: owner.into(),
            ttl: DEFAULT_IDEMPOTENCY_TTL,
            liveness: DEFAULT_CLAIM_LIVENESS,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_liveness(mut self, liveness: Duration) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// `idempotent:<operation>:<requestId>`
    pub fn key(operation: &str, request_id: &str) -> String {
        format!("{}:{}:{}", KEY_PREFIX, operation, request_id)
    }

    /// Try to become the processor for `request_id`.
    pub async fn claim(&self, operation: &str, request_id: &str, delivery_id: &str) -> Claim {
        let key = Self::key(operation, request_id);
        let fresh = match serde_json::to_string(&ClaimRecord::in_flight(&self.owner, delivery_id))
        {
            Ok(encoded) => encoded,
            Err(e) => return Claim::Degraded(CacheError::Corrupt(e.to_string())),
        };

        for _ in 0..MAX_CLAIM_ROUNDS {
            match self.store.set_if_absent(&key, &fresh, self.ttl).await {
                Ok(true) => return Claim::Acquired,
                Ok(false) => {}
                Err(e) => return Claim::Degraded(e),
            }

            let raw = match self.store.get(&key).await {
                Ok(Some(raw)) => raw,
                // Expired between the two calls
                Ok(None) => continue,
                Err(e) => return Claim::Degraded(e),
            };

            let previous_owner = match serde_json::from_str::<ClaimRecord>(&raw) {
                Ok(record) => {
                    let live = record.age() < self.liveness;
                    match (record.state, record.result) {
                        (ClaimState::Completed, Some(result)) => return Claim::Completed(result),
                        (ClaimState::InFlight, _) if live => {
                            return Claim::InFlight {
                                same_delivery: record.delivery_id == delivery_id,
                                owner: record.owner,
                            };
                        }
                        _ => Some(record.owner),
                    }
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Unreadable idempotency claim, reclaiming");
                    None
                }
            };

            match self
                .store
                .compare_and_swap(&key, &raw, &fresh, self.ttl)
                .await
            {
                Ok(true) => {
                    warn!(
                        key = %key,
                        previous_owner = ?previous_owner,
                        "Reclaimed abandoned idempotency claim"
                    );
                    return Claim::Reclaimed { previous_owner };
                }
                // Lost the race to another observer; look again
                Ok(false) => continue,
                Err(e) => return Claim::Degraded(e),
            }
        }

        debug!(key = %key, "Idempotency claim still contended, deferring");
        Claim::InFlight {
            same_delivery: true,
            owner: "contended".to_string(),
        }
    }

    /// Record the outcome so later redeliveries replay it.
    pub async fn complete(
        &self,
        operation: &str,
        request_id: &str,
        delivery_id: &str,
        result: &ResultMessage,
    ) -> Result<(), CacheError> {
        let record = ClaimRecord {
            state: ClaimState::Completed,
            owner: self.owner.clone(),
            delivery_id: delivery_id.to_string(),
            claimed_at_ms: Utc::now().timestamp_millis(),
            result: Some(result.clone()),
        };
        let encoded =
            serde_json::to_string(&record).map_err(|e| CacheError::Corrupt(e.to_string()))?;
        self.store
            .set(&Self::key(operation, request_id), &encoded, self.ttl)
            .await
    }

    /// Drop the claim so a future delivery processes the request from scratch.
    pub async fn release(&self, operation: &str, request_id: &str) -> Result<(), CacheError> {
        self.store.delete(&Self::key(operation, request_id)).await
    }
}
