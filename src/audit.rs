use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::error::AuditError;
use crate::types::{DeliveryAttempt, EventId, WebhookId};

/// Append-only destination for delivery attempt records.
///
/// Implementations must accept concurrent `append` calls. Backends that
/// cannot should be wrapped in a [`QueuedAuditSink`].
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, attempt: DeliveryAttempt) -> Result<(), AuditError>;
}

/// In-memory audit log for tests and lightweight deployments.
#[derive(Default)]
pub struct InMemoryAuditLog {
    attempts: Mutex<Vec<DeliveryAttempt>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attempts(&self) -> Vec<DeliveryAttempt> {
        self.attempts.lock().await.clone()
    }

    /// Attempts for one delivery, in append order.
    pub async fn attempts_for(
        &self,
        webhook_id: &WebhookId,
        event_id: &EventId,
    ) -> Vec<DeliveryAttempt> {
        self.attempts
            .lock()
            .await
            .iter()
            .filter(|a| &a.webhook_id == webhook_id && &a.event_id == event_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditLog {
    async fn append(&self, attempt: DeliveryAttempt) -> Result<(), AuditError> {
        self.attempts.lock().await.push(attempt);
        Ok(())
    }
}

/// Funnels appends through a single writer task.
///
/// `append` only enqueues; the writer forwards records to the inner sink one
/// at a time, in arrival order. Errors from the inner sink are logged by the
/// writer.
pub struct QueuedAuditSink {
    tx: mpsc::Sender<DeliveryAttempt>,
}

impl QueuedAuditSink {
    /// Start the writer task. It exits once every `QueuedAuditSink` handle
    /// is dropped and the queue has drained.
    pub fn spawn(inner: Arc<dyn AuditSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<DeliveryAttempt>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(attempt) = rx.recv().await {
                let webhook_id = attempt.webhook_id.clone();
                let event_id = attempt.event_id.clone();
                if let Err(error) = inner.append(attempt).await {
                    tracing::error!(
                        %webhook_id,
                        %event_id,
                        %error,
                        "failed to persist delivery attempt"
                    );
                }
            }
        });
        (Self { tx }, handle)
    }
}

#[async_trait]
impl AuditSink for QueuedAuditSink {
    async fn append(&self, attempt: DeliveryAttempt) -> Result<(), AuditError> {
        self.tx.send(attempt).await.map_err(|_| AuditError::Closed)
    }
}
