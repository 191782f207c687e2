use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::audit::AuditSink;
use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, DeliveryError, DeliveryOutcome};
use crate::telemetry::metric_inc;
use crate::types::{DeliveryKey, DeliveryState, DispatchReport, Event, EventId, Webhook, WebhookId};
use crate::worker::{deliver, DeliveryContext};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Upper bound on concurrent outbound requests per dispatch call.
    pub max_concurrency: usize,

    /// Total attempts per (webhook, event), including the first.
    pub max_attempts: u32,

    /// Deadline of a single HTTP attempt.
    pub attempt_timeout_ms: u64,

    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub retry_jitter_ms: u64,

    /// Serialized bodies above this size are rejected without sending.
    pub max_payload_bytes: usize,

    pub user_agent: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            max_attempts: 3,
            attempt_timeout_ms: 5_000,
            retry_base_ms: 100,
            retry_max_ms: 5_000,
            retry_jitter_ms: 50,
            max_payload_bytes: 256 * 1024,
            user_agent: concat!("event-automation/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Concurrent, failure-isolated webhook fan-out.
///
/// Every webhook handed to [`dispatch`](Self::dispatch) gets its own task.
/// A slow or failing endpoint only ever delays its own task; the report is
/// returned once every task has reached a terminal state or been cancelled.
pub struct WebhookDispatcher {
    ctx: Arc<DeliveryContext>,
}

impl WebhookDispatcher {
    pub fn new(config: DispatcherConfig, audit: Arc<dyn AuditSink>) -> Result<Self, ConfigError> {
        Self::with_clock(config, audit, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: DispatcherConfig,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            ctx: Arc::new(DeliveryContext {
                client,
                config,
                audit,
                clock,
                status: RwLock::new(HashMap::new()),
                in_flight: parking_lot::Mutex::new(HashSet::new()),
            }),
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.ctx.config
    }

    /// Deliver `event` to every webhook, waiting for all of them.
    pub async fn dispatch(&self, event: &Event, webhooks: &[Webhook]) -> DispatchReport {
        self.dispatch_until(event, webhooks, &CancellationToken::new())
            .await
    }

    /// Like [`dispatch`](Self::dispatch), but stops issuing attempts once
    /// `shutdown` is cancelled.
    ///
    /// Attempts already in flight run to completion (bounded by the attempt
    /// timeout) and their results are kept. Webhooks that had not reached a
    /// terminal state are counted as cancelled.
    pub async fn dispatch_until(
        &self,
        event: &Event,
        webhooks: &[Webhook],
        shutdown: &CancellationToken,
    ) -> DispatchReport {
        let targets = dedupe(webhooks);
        let mut report = DispatchReport::default();
        if targets.is_empty() {
            return report;
        }

        let permits = targets.len().min(self.ctx.config.max_concurrency).max(1);
        let semaphore = Arc::new(Semaphore::new(permits));
        let event = Arc::new(event.clone());
        let ids: Vec<WebhookId> = targets.iter().map(|w| w.id.clone()).collect();

        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            webhooks = targets.len(),
            permits,
            "dispatching event"
        );
        metric_inc("automation.dispatch.started");

        let mut tasks = JoinSet::new();
        for (index, webhook) in targets.into_iter().enumerate() {
            let ctx = Arc::clone(&self.ctx);
            let event = Arc::clone(&event);
            let semaphore = Arc::clone(&semaphore);
            let shutdown = shutdown.clone();
            let span = tracing::info_span!(
                "webhook_delivery",
                webhook_id = %webhook.id,
                event_id = %event.id,
            );
            tasks.spawn(
                async move {
                    let outcome = deliver(&ctx, &event, &webhook, &semaphore, &shutdown).await;
                    (index, outcome)
                }
                .instrument(span),
            );
        }

        let mut outcomes: Vec<Option<DeliveryOutcome>> = vec![None; ids.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(error) => {
                    tracing::error!(event_id = %event.id, %error, "delivery task aborted");
                }
            }
        }

        for (id, outcome) in ids.into_iter().zip(outcomes) {
            let outcome = outcome.unwrap_or_else(|| DeliveryOutcome::Failed {
                error: DeliveryError::Aborted("delivery task did not complete".to_string()),
                attempts: 0,
            });
            report.record(id, outcome);
        }

        tracing::info!(
            event_id = %event.id,
            total = report.total,
            successful = report.successful,
            failed = report.failed,
            cancelled = report.cancelled,
            "dispatch completed"
        );
        report
    }

    /// Current lifecycle state of one delivery, if it has been dispatched.
    pub async fn delivery_status(
        &self,
        webhook_id: &WebhookId,
        event_id: &EventId,
    ) -> Option<DeliveryState> {
        let key = DeliveryKey::new(webhook_id.clone(), event_id.clone());
        self.ctx.status.read().await.get(&key).cloned()
    }

    pub async fn delivery_status_for_event(
        &self,
        event_id: &EventId,
    ) -> HashMap<WebhookId, DeliveryState> {
        self.ctx
            .status
            .read()
            .await
            .iter()
            .filter(|(key, _)| &key.event_id == event_id)
            .map(|(key, state)| (key.webhook_id.clone(), state.clone()))
            .collect()
    }

    /// Drop the tracked states of an event whose deliveries are settled.
    ///
    /// Afterwards a new dispatch of the same event starts from scratch.
    pub async fn forget_event(&self, event_id: &EventId) -> usize {
        let mut status = self.ctx.status.write().await;
        let before = status.len();
        status.retain(|key, state| &key.event_id != event_id || !state.is_terminal());
        before - status.len()
    }
}

/// One task per webhook id; later duplicates are dropped.
fn dedupe(webhooks: &[Webhook]) -> Vec<Webhook> {
    let mut seen = HashSet::new();
    webhooks
        .iter()
        .filter(|w| seen.insert(w.id.clone()))
        .cloned()
        .collect()
}
