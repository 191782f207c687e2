use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::audit::AuditSink;
use crate::clock::Clock;
use crate::dispatcher::DispatcherConfig;
use crate::error::{DeliveryError, DeliveryOutcome};
use crate::signing::{sign, SIGNATURE_HEADER};
use crate::telemetry::{metric_inc, metric_inc_webhook};
use crate::types::{
    AttemptOutcome, DeliveryAttempt, DeliveryKey, DeliveryState, Event, Webhook,
};

/// Shared, read-mostly context for all delivery tasks.
pub(crate) struct DeliveryContext {
    pub client: reqwest::Client,
    pub config: DispatcherConfig,
    pub audit: Arc<dyn AuditSink>,
    pub clock: Arc<dyn Clock>,

    /// Lifecycle of every (webhook, event) pair seen so far.
    pub status: RwLock<HashMap<DeliveryKey, DeliveryState>>,

    /// Pairs currently owned by a delivery task.
    pub in_flight: Mutex<HashSet<DeliveryKey>>,
}

/// Ownership of one pair for the lifetime of a delivery task.
struct Claim<'a> {
    ctx: &'a DeliveryContext,
    key: DeliveryKey,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.ctx.in_flight.lock().remove(&self.key);
    }
}

/// Wire body of a webhook notification.
#[derive(Serialize)]
struct WebhookPayload<'a> {
    webhook_id: &'a str,
    event: &'a str,
    data: &'a serde_json::Value,
}

/// Deliver one event to one webhook, retrying transient failures.
///
/// Each worker:
/// - Rejects inactive, unsubscribed or foreign webhooks without an HTTP call
/// - Serializes and signs the body once
/// - Holds a concurrency permit only while an attempt is in flight
/// - Appends every attempt to the audit sink
/// - Stops issuing attempts once `shutdown` fires
pub(crate) async fn deliver(
    ctx: &DeliveryContext,
    event: &Event,
    webhook: &Webhook,
    permits: &Semaphore,
    shutdown: &CancellationToken,
) -> DeliveryOutcome {
    let key = DeliveryKey::new(webhook.id.clone(), event.id.clone());

    let (mut attempt, _claim) = match claim(ctx, &key).await {
        Ok(claimed) => claimed,
        Err(outcome) => return outcome,
    };

    if let Err(error) = preflight(webhook, event) {
        return fail_without_request(ctx, &key, attempt, error).await;
    }

    let body = match build_body(webhook, event, ctx.config.max_payload_bytes) {
        Ok(body) => body,
        Err(error) => return fail_without_request(ctx, &key, attempt, error).await,
    };
    let signature = webhook
        .verify_signature
        .then(|| sign(&body, webhook.secret.as_bytes()));

    let max_attempts = ctx.config.max_attempts.max(1);

    loop {
        if shutdown.is_cancelled() {
            return cancelled(&key, attempt - 1);
        }

        let permit = tokio::select! {
            biased;
            () = shutdown.cancelled() => return cancelled(&key, attempt - 1),
            permit = permits.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return cancelled(&key, attempt - 1),
            },
        };

        set_status(ctx, &key, DeliveryState::Attempting { attempt }).await;
        let attempted_at = ctx.clock.now();
        let started = Instant::now();
        let result = send(ctx, webhook, body.clone(), signature.as_deref()).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        // Release the permit before any backoff.
        drop(permit);

        record_attempt(ctx, &key, attempt, attempted_at, duration_ms, &result).await;

        match result {
            Ok(status) => {
                set_status(ctx, &key, DeliveryState::Delivered { attempts: attempt }).await;
                metric_inc_webhook("automation.delivery.success", &webhook.id);
                tracing::info!(
                    webhook_id = %webhook.id,
                    event_id = %event.id,
                    attempt,
                    status,
                    "webhook delivered"
                );
                return DeliveryOutcome::Delivered { attempts: attempt };
            }

            Err(error) if !error.is_retryable() || attempt >= max_attempts => {
                set_status(
                    ctx,
                    &key,
                    DeliveryState::PermanentlyFailed {
                        attempts: attempt,
                        error: error.to_string(),
                    },
                )
                .await;
                metric_inc_webhook("automation.delivery.failed", &webhook.id);
                tracing::warn!(
                    webhook_id = %webhook.id,
                    event_id = %event.id,
                    attempt,
                    %error,
                    retryable = error.is_retryable(),
                    "webhook delivery failed permanently"
                );
                return DeliveryOutcome::Failed {
                    error,
                    attempts: attempt,
                };
            }

            Err(error) => {
                let delay = retry_delay(attempt, &ctx.config)
                    + jitter_delay(ctx.config.retry_jitter_ms);
                set_status(
                    ctx,
                    &key,
                    DeliveryState::Retrying {
                        attempt,
                        last_error: error.to_string(),
                    },
                )
                .await;
                metric_inc("automation.delivery.retry_scheduled");
                tracing::debug!(
                    webhook_id = %webhook.id,
                    event_id = %event.id,
                    attempt,
                    %error,
                    delay_ms = delay.as_millis() as u64,
                    "retrying webhook delivery"
                );

                tokio::select! {
                    () = shutdown.cancelled() => return cancelled(&key, attempt),
                    () = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

/// Decide where this delivery starts, or why it must not start.
///
/// Terminal pairs are never attempted again. A pair owned by another task
/// is reported as cancelled for this dispatch. A pair left in `Retrying` by
/// a cancelled dispatch resumes with the next attempt number.
async fn claim<'a>(
    ctx: &'a DeliveryContext,
    key: &DeliveryKey,
) -> Result<(u32, Claim<'a>), DeliveryOutcome> {
    let mut status = ctx.status.write().await;
    let current = status.get(key);

    match current {
        Some(DeliveryState::Delivered { attempts }) => {
            return Err(DeliveryOutcome::Delivered {
                attempts: *attempts,
            })
        }
        Some(DeliveryState::PermanentlyFailed { attempts, .. }) => {
            return Err(DeliveryOutcome::Failed {
                error: DeliveryError::AlreadyFailed,
                attempts: *attempts,
            })
        }
        _ => {}
    }

    let mut in_flight = ctx.in_flight.lock();
    if in_flight.contains(key) {
        let attempts = match current {
            Some(DeliveryState::Attempting { attempt }) => attempt.saturating_sub(1),
            Some(DeliveryState::Retrying { attempt, .. }) => *attempt,
            _ => 0,
        };
        tracing::debug!(
            webhook_id = %key.webhook_id,
            event_id = %key.event_id,
            "delivery already owned by another dispatch"
        );
        return Err(DeliveryOutcome::Cancelled { attempts });
    }

    // An `Attempting` pair nobody owns lost its task mid-attempt; numbering
    // moves past it.
    let next = match current {
        Some(DeliveryState::Retrying { attempt, .. })
        | Some(DeliveryState::Attempting { attempt }) => attempt + 1,
        _ => 1,
    };
    in_flight.insert(key.clone());
    drop(in_flight);

    status.insert(key.clone(), DeliveryState::Pending);
    Ok((
        next,
        Claim {
            ctx,
            key: key.clone(),
        },
    ))
}

fn preflight(webhook: &Webhook, event: &Event) -> Result<(), DeliveryError> {
    if !webhook.active {
        return Err(DeliveryError::Inactive);
    }
    if webhook.tenant_id != event.tenant_id {
        return Err(DeliveryError::TenantMismatch);
    }
    if !webhook.subscribed_events.matches(&event.event_type) {
        return Err(DeliveryError::NotSubscribed(event.event_type.clone()));
    }
    Ok(())
}

/// Serialize the wire body exactly once; the same bytes are signed and sent.
fn build_body(webhook: &Webhook, event: &Event, limit: usize) -> Result<Bytes, DeliveryError> {
    let payload = WebhookPayload {
        webhook_id: &webhook.id.0,
        event: &event.event_type,
        data: &event.payload,
    };
    let body = serde_json::to_vec(&payload)
        .map_err(|e| DeliveryError::InvalidRequest(e.to_string()))?;
    if body.len() > limit {
        return Err(DeliveryError::PayloadTooLarge {
            size: body.len(),
            limit,
        });
    }
    Ok(Bytes::from(body))
}

async fn send(
    ctx: &DeliveryContext,
    webhook: &Webhook,
    body: Bytes,
    signature: Option<&str>,
) -> Result<u16, DeliveryError> {
    let mut request = ctx
        .client
        .post(&webhook.url)
        .timeout(Duration::from_millis(ctx.config.attempt_timeout_ms.max(1)))
        .header(CONTENT_TYPE, "application/json")
        .body(body);

    if let Some(signature) = signature {
        request = request.header(SIGNATURE_HEADER, signature);
    }

    match request.send().await {
        Ok(resp) => {
            let status = resp.status();
            if status.is_success() {
                Ok(status.as_u16())
            } else if status.is_client_error() {
                Err(DeliveryError::ClientError(status.as_u16()))
            } else {
                Err(DeliveryError::ServerError(status.as_u16()))
            }
        }
        Err(err) if err.is_timeout() => Err(DeliveryError::Timeout),
        Err(err) if err.is_builder() => Err(DeliveryError::InvalidRequest(err.to_string())),
        Err(err) => Err(DeliveryError::Network(err.to_string())),
    }
}

async fn fail_without_request(
    ctx: &DeliveryContext,
    key: &DeliveryKey,
    attempt: u32,
    error: DeliveryError,
) -> DeliveryOutcome {
    let result = Err(error.clone());
    record_attempt(ctx, key, attempt, ctx.clock.now(), 0, &result).await;
    set_status(
        ctx,
        key,
        DeliveryState::PermanentlyFailed {
            attempts: attempt,
            error: error.to_string(),
        },
    )
    .await;
    metric_inc_webhook("automation.delivery.rejected", &key.webhook_id);
    tracing::info!(
        webhook_id = %key.webhook_id,
        event_id = %key.event_id,
        %error,
        "webhook delivery rejected before sending"
    );
    DeliveryOutcome::Failed {
        error,
        attempts: attempt,
    }
}

fn cancelled(key: &DeliveryKey, attempts: u32) -> DeliveryOutcome {
    tracing::debug!(
        webhook_id = %key.webhook_id,
        event_id = %key.event_id,
        attempts,
        "webhook delivery cancelled"
    );
    DeliveryOutcome::Cancelled { attempts }
}

async fn record_attempt(
    ctx: &DeliveryContext,
    key: &DeliveryKey,
    attempt_number: u32,
    attempted_at: DateTime<Utc>,
    duration_ms: u64,
    result: &Result<u16, DeliveryError>,
) {
    let (http_status, outcome, error) = match result {
        Ok(status) => (Some(*status), AttemptOutcome::Success, None),
        Err(DeliveryError::Timeout) => (
            None,
            AttemptOutcome::Timeout,
            Some(DeliveryError::Timeout.to_string()),
        ),
        Err(error) => (error.http_status(), AttemptOutcome::Failure, Some(error.to_string())),
    };

    let attempt = DeliveryAttempt {
        webhook_id: key.webhook_id.clone(),
        event_id: key.event_id.clone(),
        attempt_number,
        http_status,
        duration_ms,
        outcome,
        error,
        attempted_at,
    };

    if let Err(error) = ctx.audit.append(attempt).await {
        metric_inc("automation.audit.append_failed");
        tracing::error!(
            webhook_id = %key.webhook_id,
            event_id = %key.event_id,
            attempt_number,
            %error,
            "failed to append delivery attempt"
        );
    }
}

async fn set_status(ctx: &DeliveryContext, key: &DeliveryKey, state: DeliveryState) {
    ctx.status.write().await.insert(key.clone(), state);
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped at `retry_max_ms`.
pub(crate) fn retry_delay(attempt: u32, config: &DispatcherConfig) -> Duration {
    let base = config.retry_base_ms.max(1);
    let max = config.retry_max_ms.max(base);
    let pow = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(base.saturating_mul(pow).min(max))
}

fn jitter_delay(jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(fastrand::u64(0..=jitter_ms))
}
