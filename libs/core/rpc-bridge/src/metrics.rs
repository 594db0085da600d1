//! Prometheus metrics for bridge subscriptions

use crate::error::ErrorKind;
use crate::outcome::AckOutcome;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder. Later calls are no-ops.
pub fn init_metrics() -> Result<(), BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<_, BuildError>(handle)
    })?;
    Ok(())
}

pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> Option<String> {
    prometheus_handle().map(|h| h.render())
}

/// Per-queue metrics helper
#[derive(Clone)]
pub struct BridgeMetrics {
    queue: String,
}

impl BridgeMetrics {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn delivery_received(&self) {
        counter!("rpc_bridge_deliveries_received_total", "queue" => self.queue.clone())
            .increment(1);
    }

    pub fn delivery_settled(&self, outcome: AckOutcome) {
        counter!(
            "rpc_bridge_deliveries_settled_total",
            "queue" => self.queue.clone(),
            "outcome" => outcome.as_ref().to_string()
        )
        .increment(1);
    }

    pub fn result_published(&self, status: &str) {
        counter!(
            "rpc_bridge_results_published_total",
            "queue" => self.queue.clone(),
            "status" => status.to_string()
        )
        .increment(1);
    }

    pub fn operation_finished(&self, duration: Duration, kind: Option<ErrorKind>) {
        let kind = kind.map(|k| k.as_ref().to_string()).unwrap_or_else(|| "OK".to_string());
        histogram!(
            "rpc_bridge_operation_duration_seconds",
            "queue" => self.queue.clone(),
            "kind" => kind
        )
        .record(duration.as_secs_f64());
    }

    pub fn operation_retried(&self, kind: ErrorKind) {
        counter!(
            "rpc_bridge_operation_retries_total",
            "queue" => self.queue.clone(),
            "kind" => kind.as_ref().to_string()
        )
        .increment(1);
    }

    pub fn in_flight(&self, lanes: usize) {
        gauge!("rpc_bridge_in_flight", "queue" => self.queue.clone()).set(lanes as f64);
    }

    pub fn degraded(&self) {
        counter!("rpc_bridge_degraded_total", "queue" => self.queue.clone()).increment(1);
    }

    pub fn duplicate_observed(&self) {
        counter!("rpc_bridge_duplicates_total", "queue" => self.queue.clone()).increment(1);
    }

    pub fn cache_lookup(&self, hit: bool) {
        counter!(
            "rpc_bridge_cache_lookups_total",
            "queue" => self.queue.clone(),
            "result" => if hit { "hit" } else { "miss" }
        )
        .increment(1);
    }

    /// Numeric code of the subscription state.
    pub fn subscription_state(&self, code: u8) {
        gauge!("rpc_bridge_subscription_state", "queue" => self.queue.clone()).set(code as f64);
    }

    pub fn subscription_retry(&self) {
        counter!("rpc_bridge_subscription_retries_total", "queue" => self.queue.clone())
            .increment(1);
    }
}
