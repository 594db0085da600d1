use crate::broker::Broker;
use crate::cache::{CacheStore, IdempotencyGuard, ResultCache};
use crate::classify::ErrorClassifier;
use crate::config::BridgeSettings;
use crate::publisher::ResultPublisher;
use std::sync::Arc;

/// Shared infrastructure handed to every subscription.
///
/// Owns no connection state of its own; the broker and cache store are
/// injected by the caller.
#[derive(Clone)]
pub struct BridgeContext {
    pub broker: Arc<dyn Broker>,
    pub store: Arc<dyn CacheStore>,
    pub publisher: ResultPublisher,
    pub guard: IdempotencyGuard,
    pub results: ResultCache,
    pub classifier: Arc<ErrorClassifier>,
}

impl BridgeContext {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn CacheStore>,
        settings: &BridgeSettings,
    ) -> Self {
        let publisher = ResultPublisher::new(broker.clone(), settings.result_destination.clone())
            .with_source(&settings.source)
            .with_legacy_resources(settings.legacy_resources.iter().cloned());
        let guard = IdempotencyGuard::new(store.clone(), &settings.consumer_id)
            .with_ttl(settings.idempotency_ttl)
            .with_liveness(settings.claim_liveness);
        let results = ResultCache::new(store.clone()).with_ttl(settings.cache_ttl);

        Self {
            broker,
            store,
            publisher,
            guard,
            results,
            classifier: Arc::new(ErrorClassifier::new()),
        }
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }
}
