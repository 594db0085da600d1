//! Health, subscription status and dead-letter admin endpoints
//!
//! - Liveness: `/health`, `/healthz`
//! - Readiness: `/ready`, `/readyz` (broker and cache probes)
//! - Subscription states: `/subscriptions`
//! - Prometheus metrics: `/metrics`
//! - Dead letters: `/admin/dlq/{queue}/stats`, `/admin/dlq/{queue}/messages`,
//!   `/admin/dlq/{queue}/replay`

use crate::broker::Broker;
use crate::cache::CacheStore;
use crate::metrics;
use crate::subscription::{SubscriptionState, SubscriptionStatus};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::watch;

const MAX_PAGE: usize = 100;

/// Shared state for the health router.
#[derive(Clone)]
pub struct HealthState {
    pub broker: Arc<dyn Broker>,
    pub store: Arc<dyn CacheStore>,
    pub app_name: String,
    pub app_version: String,
    subscriptions: Vec<watch::Receiver<SubscriptionStatus>>,
}

impl HealthState {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn CacheStore>,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            store,
            app_name: app_name.into(),
            app_version: app_version.into(),
            subscriptions: Vec::new(),
        }
    }

    pub fn with_subscriptions(
        mut self,
        subscriptions: Vec<watch::Receiver<SubscriptionStatus>>,
    ) -> Self {
        self.subscriptions = subscriptions;
        self
    }

    fn snapshot(&self) -> Vec<SubscriptionStatus> {
        self.subscriptions
            .iter()
            .map(|rx| rx.borrow().clone())
            .collect()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub version: String,
}

pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
    })
}

/// Ready while the broker answers. A cache outage only degrades readiness,
/// since deliveries keep flowing without idempotency protection.
pub async fn ready_handler(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    let broker = match state.broker.ping().await {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {}", e),
    };
    let cache = match state.store.ping().await {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {}", e),
    };

    let (code, status) = match (broker == "ok", cache == "ok") {
        (true, true) => (StatusCode::OK, "ready"),
        (true, false) => (StatusCode::OK, "degraded"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "not_ready"),
    };

    (
        code,
        Json(json!({
            "status": status,
            "checks": {
                "broker": broker,
                "cache": cache,
            }
        })),
    )
}

pub async fn subscriptions_handler(State(state): State<HealthState>) -> Json<Value> {
    let subscriptions = state.snapshot();
    let active = subscriptions
        .iter()
        .filter(|s| s.state == SubscriptionState::Active)
        .count();
    let failed = subscriptions.iter().filter(|s| s.is_failed()).count();

    Json(json!({
        "total": subscriptions.len(),
        "active": active,
        "failed": failed,
        "subscriptions": subscriptions,
    }))
}

pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::render_metrics() {
        Some(output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            output,
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized".to_string(),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct DlqListParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

#[derive(Debug, Deserialize)]
pub struct DlqReplayParams {
    #[serde(default = "default_limit")]
    pub count: usize,
}

fn default_limit() -> usize {
    10
}

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

/// `GET /admin/dlq/{queue}/stats`
pub async fn dlq_stats_handler(
    State(state): State<HealthState>,
    Path(queue): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    let stats = state
        .broker
        .dead_letter_stats(&queue)
        .await
        .map_err(internal_error)?;
    Ok(Json(stats))
}

/// `GET /admin/dlq/{queue}/messages?limit=10`
pub async fn dlq_list_handler(
    State(state): State<HealthState>,
    Path(queue): Path<String>,
    Query(params): Query<DlqListParams>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    let limit = params.limit.min(MAX_PAGE);
    let messages = state
        .broker
        .dead_letters(&queue, limit)
        .await
        .map_err(internal_error)?;

    Ok(Json(json!({
        "queue": queue,
        "limit": limit,
        "count": messages.len(),
        "messages": messages,
    })))
}

/// `POST /admin/dlq/{queue}/replay?count=10`
pub async fn dlq_replay_handler(
    State(state): State<HealthState>,
    Path(queue): Path<String>,
    Query(params): Query<DlqReplayParams>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    let count = params.count.min(MAX_PAGE);
    let replayed = state
        .broker
        .replay_dead_letters(&queue, count)
        .await
        .map_err(internal_error)?;

    Ok(Json(json!({
        "success": true,
        "queue": queue,
        "replayed": replayed,
    })))
}

/// Health, status, metrics and dead-letter admin routes.
pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/subscriptions", get(subscriptions_handler))
        .route("/metrics", get(metrics_handler))
        .route("/admin/dlq/{queue}/stats", get(dlq_stats_handler))
        .route("/admin/dlq/{queue}/messages", get(dlq_list_handler))
        .route("/admin/dlq/{queue}/replay", post(dlq_replay_handler))
        .with_state(state)
}
