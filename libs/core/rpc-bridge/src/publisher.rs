//! Result publishing
//!
//! Every outcome goes to the one shared result destination. Resources flagged
//! as legacy additionally get a copy on `<resource>-response` with routing key
//! `success` or `error`. The shared destination is authoritative: failing to
//! publish there is an error the caller must act on, a failed legacy copy is
//! only logged.

use crate::broker::Broker;
use crate::envelope::{Destination, ResultMessage};
use crate::error::BridgeError;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_SOURCE: &str = "rpc-bridge";

/// Legacy per-resource response destination.
pub fn legacy_destination(resource: &str, success: bool) -> Destination {
    Destination::new(
        format!("{}-response", resource),
        if success { "success" } else { "error" },
    )
}

#[derive(Clone)]
pub struct ResultPublisher {
    broker: Arc<dyn Broker>,
    destination: Destination,
    source: String,
    legacy_resources: HashSet<String>,
}

impl ResultPublisher {
    pub fn new(broker: Arc<dyn Broker>, destination: Destination) -> Self {
        Self {
            broker,
            destination,
            source: DEFAULT_SOURCE.to_string(),
            legacy_resources: HashSet::new(),
        }
    }

    /// Tag identifying this worker fleet on every result.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Also mirror results for these resources onto their legacy channels.
    pub fn with_legacy_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.legacy_resources = resources.into_iter().map(Into::into).collect();
        self
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_legacy(&self, resource: &str) -> bool {
        self.legacy_resources.contains(resource)
    }

    pub fn completed(&self, request_id: &str, data: Value) -> ResultMessage {
        ResultMessage::completed(request_id, data, &self.source)
    }

    pub fn failed(&self, request_id: &str, error: &str) -> ResultMessage {
        ResultMessage::failed(request_id, error, &self.source)
    }

    /// Emit `result` on the shared destination, then on the legacy channel
    /// of `resource` when it is flagged.
    pub async fn publish(&self, resource: &str, result: &ResultMessage) -> Result<(), BridgeError> {
        let bytes = result.encode()?;

        let entry_id = self
            .broker
            .publish(&self.destination, &bytes)
            .await
            .map_err(|e| match e {
                BridgeError::Publish(_) => e,
                other => BridgeError::Publish(other.to_string()),
            })?;
        debug!(
            request_id = %result.request_id(),
            status = %result.status(),
            entry_id = %entry_id,
            "Published result"
        );

        if self.is_legacy(resource) {
            let legacy = legacy_destination(resource, result.is_completed());
            if let Err(e) = self.broker.publish(&legacy, &bytes).await {
                warn!(
                    request_id = %result.request_id(),
                    destination = %legacy,
                    error = %e,
                    "Failed to publish legacy response"
                );
            }
        }

        Ok(())
    }

    pub async fn publish_completed(
        &self,
        resource: &str,
        request_id: &str,
        data: Value,
    ) -> Result<ResultMessage, BridgeError> {
        let result = self.completed(request_id, data);
        self.publish(resource, &result).await?;
        Ok(result)
    }

    pub async fn publish_failed(
        &self,
        resource: &str,
        request_id: &str,
        error: &str,
    ) -> Result<ResultMessage, BridgeError> {
        let result = self.failed(request_id, error);
        self.publish(resource, &result).await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::envelope::ResultStatus;
    use serde_json::json;

    fn results() -> Destination {
        Destination::new("bridge.results", "result")
    }

    #[tokio::test]
    async fn test_publish_completed_on_shared_destination() {
        let broker = InMemoryBroker::new();
        let publisher = ResultPublisher::new(Arc::new(broker.clone()), results());

        publisher
            .publish_completed("player", "r1", json!({"name": "Alice"}))
            .await
            .unwrap();

        let published = broker.published(&results()).await;
        assert_eq!(published.len(), 1);
        let message = ResultMessage::decode(&published[0]).unwrap();
        assert_eq!(message.request_id(), "r1");
        assert_eq!(message.status(), ResultStatus::Completed);
        assert_eq!(message.source(), DEFAULT_SOURCE);
        assert!(broker.published(&legacy_destination("player", true)).await.is_empty());
    }

    #[tokio::test]
    async fn test_legacy_resources_get_a_copy() {
        let broker = InMemoryBroker::new();
        let publisher = ResultPublisher::new(Arc::new(broker.clone()), results())
            .with_source("players-fleet")
            .with_legacy_resources(["player"]);

        publisher
            .publish_failed("player", "r2", "player Ghost not found")
            .await
            .unwrap();

        let legacy = broker.published(&legacy_destination("player", false)).await;
        assert_eq!(legacy.len(), 1);
        let message = ResultMessage::decode(&legacy[0]).unwrap();
        assert_eq!(message.error(), Some("player Ghost not found"));
        assert_eq!(message.source(), "players-fleet");
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_a_publish_error() {
        let broker = InMemoryBroker::new();
        broker.set_publish_failing(true);
        let publisher = ResultPublisher::new(Arc::new(broker), results());

        let err = publisher
            .publish_completed("player", "r3", json!(true))
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::Publish(_)));
    }

    #[test]
    fn test_legacy_destination() {
        assert_eq!(
            legacy_destination("player", true).stream_key(),
            "player-response:success"
        );
        assert_eq!(legacy_destination("player", false).routing_key, "error");
    }
}
