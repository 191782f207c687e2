//! Event processing loop.
//!
//! The engine is the explicit owner of every moving part: it is constructed
//! with its collaborators, started against an [`EventStream`], and stopped
//! through the returned [`EngineHandle`]. Nothing is process-global.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audit::AuditSink;
use crate::bus::EventStream;
use crate::cache::{CacheStats, EventCache};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::dispatcher::WebhookDispatcher;
use crate::error::{ConfigError, DeliveryError, RepositoryError};
use crate::matcher::match_rules;
use crate::repository::{RuleRepository, WebhookRepository};
use crate::telemetry::metric_inc;
use crate::types::{DispatchReport, Event, EventStatus, RuleId, Webhook, WebhookId};

/// What happened to one event.
#[derive(Debug, Clone)]
pub struct ProcessedEvent {
    /// The event with its final status.
    pub event: Event,

    /// Rules that fired, in execution order.
    pub matched_rules: Vec<RuleId>,

    pub report: DispatchReport,
}

pub struct AutomationEngine {
    config: EngineConfig,
    rules: Arc<dyn RuleRepository>,
    webhooks: Arc<dyn WebhookRepository>,
    dispatcher: WebhookDispatcher,
    cache: Arc<EventCache<Webhook>>,
    webhook_changes: Mutex<Option<broadcast::Receiver<WebhookId>>>,
    clock: Arc<dyn Clock>,
}

impl AutomationEngine {
    pub fn new(
        config: EngineConfig,
        rules: Arc<dyn RuleRepository>,
        webhooks: Arc<dyn WebhookRepository>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, ConfigError> {
        Self::with_clock(config, rules, webhooks, audit, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: EngineConfig,
        rules: Arc<dyn RuleRepository>,
        webhooks: Arc<dyn WebhookRepository>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let dispatcher =
            WebhookDispatcher::with_clock(config.dispatcher.clone(), audit, Arc::clone(&clock))?;
        let cache = Arc::new(EventCache::with_clock(&config.cache, Arc::clone(&clock)));
        let webhook_changes = Mutex::new(webhooks.watch());

        Ok(Self {
            config,
            rules,
            webhooks,
            dispatcher,
            cache,
            webhook_changes,
            clock,
        })
    }

    pub fn dispatcher(&self) -> &WebhookDispatcher {
        &self.dispatcher
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Forget a cached webhook after it was edited elsewhere.
    pub fn invalidate_webhook(&self, id: &WebhookId) -> bool {
        self.cache.delete(&webhook_cache_key(id))
    }

    /// Process one event with no shutdown signal.
    pub async fn process(&self, event: Event) -> ProcessedEvent {
        self.process_until(event, &CancellationToken::new()).await
    }

    /// Match, dispatch and settle one event.
    ///
    /// The event ends `processed` even when no rule matched or every
    /// delivery failed. It ends `failed` only when its rules could not be
    /// loaded. If `shutdown` cancelled any delivery the event stays
    /// `pending` and rule counters are untouched; processing it again
    /// resumes the unfinished deliveries.
    pub async fn process_until(
        &self,
        mut event: Event,
        shutdown: &CancellationToken,
    ) -> ProcessedEvent {
        if event.status != EventStatus::Pending {
            tracing::debug!(event_id = %event.id, status = ?event.status, "skipping settled event");
            return ProcessedEvent {
                event,
                matched_rules: Vec::new(),
                report: DispatchReport::default(),
            };
        }

        self.sync_webhook_cache();

        let rules = match self.rules.list_rules(&event.tenant_id).await {
            Ok(rules) => rules,
            Err(error) => {
                tracing::error!(
                    event_id = %event.id,
                    tenant_id = %event.tenant_id,
                    %error,
                    "failed to load automation rules"
                );
                metric_inc("automation.event.failed");
                self.settle(&mut event, EventStatus::Failed);
                return ProcessedEvent {
                    event,
                    matched_rules: Vec::new(),
                    report: DispatchReport::default(),
                };
            }
        };

        let matched = match_rules(&event, &rules);
        if matched.is_empty() {
            tracing::debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                "no automation rules matched"
            );
        }

        let mut seen = HashSet::new();
        let targets: Vec<WebhookId> = matched
            .iter()
            .flat_map(|rule| rule.webhook_targets())
            .filter(|id| seen.insert((*id).clone()))
            .cloned()
            .collect();

        let mut report = DispatchReport::default();
        let mut webhooks = Vec::with_capacity(targets.len());
        for id in targets {
            match self.resolve_webhook(&id).await {
                Ok(Some(webhook)) => webhooks.push(webhook),
                Ok(None) => {
                    tracing::warn!(event_id = %event.id, webhook_id = %id, "rule targets unknown webhook");
                    report.record_failure(id, DeliveryError::NotFound);
                }
                Err(error) => {
                    tracing::error!(event_id = %event.id, webhook_id = %id, %error, "webhook lookup failed");
                    report.record_failure(id, DeliveryError::Lookup(error.to_string()));
                }
            }
        }

        report.merge(
            self.dispatcher
                .dispatch_until(&event, &webhooks, shutdown)
                .await,
        );

        let matched_rules: Vec<RuleId> = matched.iter().map(|rule| rule.id.clone()).collect();
        if report.cancelled > 0 {
            tracing::info!(
                event_id = %event.id,
                cancelled = report.cancelled,
                "deliveries cancelled; event left pending"
            );
            return ProcessedEvent {
                event,
                matched_rules,
                report,
            };
        }

        // Counters move once per event, at settlement.
        let executed_at = self.clock.now();
        for rule in &matched_rules {
            if let Err(error) = self.rules.record_execution(rule, executed_at).await {
                tracing::warn!(rule_id = %rule, %error, "failed to record rule execution");
            }
        }

        self.dispatcher.forget_event(&event.id).await;
        self.settle(&mut event, EventStatus::Processed);
        metric_inc("automation.event.processed");

        ProcessedEvent {
            event,
            matched_rules,
            report,
        }
    }

    /// Deliver `event` to every active webhook of its tenant subscribed to
    /// its type, bypassing rules.
    ///
    /// The event's own status is left alone. Fetched webhooks refresh the
    /// cache.
    pub async fn notify_subscribers(
        &self,
        event: &Event,
        shutdown: &CancellationToken,
    ) -> Result<DispatchReport, RepositoryError> {
        self.sync_webhook_cache();

        let subscribers = self
            .webhooks
            .list_subscribed(&event.tenant_id, &event.event_type)
            .await?;
        for webhook in &subscribers {
            self.cache.set(webhook_cache_key(&webhook.id), webhook.clone());
        }

        let report = self
            .dispatcher
            .dispatch_until(event, &subscribers, shutdown)
            .await;
        if report.cancelled == 0 {
            self.dispatcher.forget_event(&event.id).await;
        }
        Ok(report)
    }

    /// Consume `stream` until it closes or `shutdown` fires.
    ///
    /// Returns the number of events processed.
    pub async fn run(&self, mut stream: EventStream, shutdown: CancellationToken) -> u64 {
        let mut processed = 0u64;
        loop {
            let event = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                next = stream.recv() => match next {
                    Some(event) => event,
                    None => break,
                },
            };

            let outcome = self.process_until(event, &shutdown).await;
            processed += 1;
            tracing::debug!(
                event_id = %outcome.event.id,
                status = ?outcome.event.status,
                rules = outcome.matched_rules.len(),
                delivered = outcome.report.successful,
                failed = outcome.report.failed,
                "event settled"
            );
        }

        stream.close();
        tracing::info!(processed, "automation loop stopped");
        processed
    }

    /// Spawn the processing loop and the cache sweeper.
    pub fn start(self: Arc<Self>, stream: EventStream) -> EngineHandle {
        let shutdown = CancellationToken::new();
        let sweeper = self.cache.spawn_sweeper(
            Duration::from_millis(self.config.cache.sweep_interval_ms),
            shutdown.clone(),
        );

        let token = shutdown.clone();
        let runner = tokio::spawn(async move { self.run(stream, token).await });

        EngineHandle {
            shutdown,
            runner,
            sweeper,
        }
    }

    /// Drop cached webhooks the repository reported as changed.
    fn sync_webhook_cache(&self) {
        let mut guard = self.webhook_changes.lock();
        let Some(changes) = guard.as_mut() else {
            return;
        };

        let closed = loop {
            match changes.try_recv() {
                Ok(id) => {
                    self.cache.delete(&webhook_cache_key(&id));
                }
                Err(TryRecvError::Empty) => break false,
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "webhook change feed lagged; clearing webhook cache");
                    self.cache.clear();
                }
                Err(TryRecvError::Closed) => break true,
            }
        };
        if closed {
            tracing::warn!("webhook change feed closed");
            *guard = None;
        }
    }

    async fn resolve_webhook(&self, id: &WebhookId) -> Result<Option<Webhook>, RepositoryError> {
        let key = webhook_cache_key(id);
        if let Some(webhook) = self.cache.get(&key) {
            return Ok(Some(webhook));
        }

        let webhook = self.webhooks.get_webhook(id).await?;
        if let Some(ref webhook) = webhook {
            self.cache.set(key, webhook.clone());
        }
        Ok(webhook)
    }

    fn settle(&self, event: &mut Event, status: EventStatus) {
        let now = self.clock.now();
        let result = match status {
            EventStatus::Failed => event.mark_failed(now),
            _ => event.mark_processed(now),
        };
        if let Err(error) = result {
            tracing::warn!(event_id = %event.id, %error, "event status not updated");
        }
    }
}

fn webhook_cache_key(id: &WebhookId) -> String {
    format!("webhook:{id}")
}

/// Running engine. Dropping the handle leaves the tasks running.
pub struct EngineHandle {
    shutdown: CancellationToken,
    runner: JoinHandle<u64>,
    sweeper: JoinHandle<()>,
}

impl EngineHandle {
    /// Token that stops the loop when cancelled; handy for wiring into
    /// a wider shutdown signal.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop issuing new work, wait for the loop to exit and return the
    /// number of events processed.
    pub async fn stop(self) -> u64 {
        self.shutdown.cancel();
        self.join().await
    }

    /// Wait for the stream to close, then stop the sweeper.
    pub async fn join(self) -> u64 {
        let processed = match self.runner.await {
            Ok(processed) => processed,
            Err(error) => {
                tracing::error!(%error, "automation loop panicked");
                0
            }
        };
        self.shutdown.cancel();
        if let Err(error) = self.sweeper.await {
            tracing::error!(%error, "cache sweeper panicked");
        }
        processed
    }
}
