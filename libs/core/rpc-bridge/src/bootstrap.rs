//! Staggered startup and bounded shutdown of every subscription
//!
//! Subscriptions start in waves (reads, then writes, then existence checks)
//! with `wave_delay` between waves so a freshly connected worker does not
//! create every consumer group at once.

use crate::config::BridgeSettings;
use crate::context::BridgeContext;
use crate::error::BridgeError;
use crate::operation::{Operation, Wave};
use crate::subscription::{Subscription, SubscriptionState, SubscriptionStatus};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Extra time on top of the drain timeout before loops are aborted.
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(2);

pub struct Bootstrap {
    context: BridgeContext,
    settings: BridgeSettings,
    operations: HashMap<String, Arc<dyn Operation>>,
}

impl Bootstrap {
    pub fn new(context: BridgeContext, settings: BridgeSettings) -> Self {
        Self {
            context,
            settings,
            operations: HashMap::new(),
        }
    }

    /// Register the operation serving its resource's queues.
    pub fn with_operation(mut self, operation: Arc<dyn Operation>) -> Self {
        self.operations
            .insert(operation.resource().to_string(), operation);
        self
    }

    /// Start every configured subscription, wave by wave.
    pub async fn start(&self) -> Result<RunningBridge, BridgeError> {
        let (shutdown, _) = watch::channel(false);
        let mut running = RunningBridge {
            shutdown,
            tasks: JoinSet::new(),
            statuses: Vec::new(),
            drain_timeout: self.settings.drain_timeout,
        };

        if !self.settings.consumers_enabled() {
            info!(
                broker_enabled = self.settings.broker_enabled,
                reactive_enabled = self.settings.reactive_enabled,
                "Consumers disabled, no subscriptions started"
            );
            return Ok(running);
        }

        for resource in &self.settings.resources {
            if !self.operations.contains_key(resource) {
                return Err(BridgeError::Config(format!(
                    "no operation registered for resource '{}'",
                    resource
                )));
            }
        }

        let configs = self.settings.subscriptions();
        for (index, wave) in Wave::ordered().enumerate() {
            let members: Vec<_> = configs.iter().filter(|c| c.verb.wave() == wave).collect();
            if members.is_empty() {
                continue;
            }
            if index > 0 && !self.settings.wave_delay.is_zero() {
                tokio::time::sleep(self.settings.wave_delay).await;
            }

            info!(wave = %wave, subscriptions = members.len(), "Starting subscription wave");
            for config in members {
                let Some(operation) = self.operations.get(&config.resource) else {
                    continue;
                };
                let subscription =
                    Subscription::new(&self.context, operation.clone(), config.clone());
                running.statuses.push(subscription.status());
                running
                    .tasks
                    .spawn(subscription.run(running.shutdown.subscribe()));
            }
        }

        info!(subscriptions = running.statuses.len(), "All subscription waves started");
        Ok(running)
    }
}

/// Handle on started subscriptions.
pub struct RunningBridge {
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<SubscriptionStatus>,
    statuses: Vec<watch::Receiver<SubscriptionStatus>>,
    drain_timeout: Duration,
}

impl RunningBridge {
    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// Status channels, for health reporting.
    pub fn status_receivers(&self) -> Vec<watch::Receiver<SubscriptionStatus>> {
        self.statuses.clone()
    }

    pub fn statuses(&self) -> Vec<SubscriptionStatus> {
        self.statuses.iter().map(|rx| rx.borrow().clone()).collect()
    }

    /// Signal every subscription and wait for them to stop.
    pub async fn shutdown(mut self) -> ShutdownSummary {
        info!(subscriptions = self.statuses.len(), "Shutting down subscriptions");
        let _ = self.shutdown.send(true);

        let deadline = self.drain_timeout + SHUTDOWN_MARGIN;
        let tasks = &mut self.tasks;
        let joined = tokio::time::timeout(deadline, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    warn!(error = %e, "Subscription task failed");
                }
            }
        })
        .await;

        let aborted = if joined.is_err() {
            let remaining = self.tasks.len();
            warn!(remaining = remaining, "Shutdown timed out, aborting subscriptions");
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
            remaining
        } else {
            0
        };

        let summary = ShutdownSummary::new(self.statuses(), aborted);
        info!(
            stopped = summary.stopped,
            failed = summary.failed,
            aborted = summary.aborted,
            "Subscriptions shut down"
        );
        summary
    }
}

/// Final states after shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownSummary {
    pub subscriptions: Vec<SubscriptionStatus>,
    /// Stopped cleanly.
    pub stopped: usize,
    /// Stopped after exhausting retries.
    pub failed: usize,
    /// Did not stop within the deadline.
    pub aborted: usize,
}

impl ShutdownSummary {
    fn new(subscriptions: Vec<SubscriptionStatus>, aborted: usize) -> Self {
        let failed = subscriptions.iter().filter(|s| s.is_failed()).count();
        let stopped = subscriptions
            .iter()
            .filter(|s| s.state == SubscriptionState::Stopped && !s.is_failed())
            .count();
        Self {
            subscriptions,
            stopped,
            failed,
            aborted,
        }
    }
}
