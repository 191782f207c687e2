use async_trait::async_trait;
use tokio_postgres::Client;

use crate::audit::AuditSink;
use crate::error::AuditError;
use crate::types::DeliveryAttempt;

/// Audit sink writing one row per delivery attempt.
///
/// The primary key on `(webhook_id, event_id, attempt_number)` keeps the
/// log append-only: a replayed row is ignored rather than overwritten.
pub struct PostgresAuditSink {
    client: Client,
}

impl PostgresAuditSink {
    pub async fn new(client: Client) -> Result<Self, tokio_postgres::Error> {
        client
            .execute(
                "CREATE TABLE IF NOT EXISTS webhook_delivery_attempts (
                    webhook_id TEXT NOT NULL,
                    event_id TEXT NOT NULL,
                    attempt_number INTEGER NOT NULL,
                    http_status INTEGER,
                    duration_ms BIGINT NOT NULL,
                    outcome TEXT NOT NULL,
                    error TEXT,
                    attempted_at TIMESTAMPTZ NOT NULL,
                    PRIMARY KEY (webhook_id, event_id, attempt_number)
                )",
                &[],
            )
            .await?;

        Ok(Self { client })
    }
}

#[async_trait]
impl AuditSink for PostgresAuditSink {
    async fn append(&self, attempt: DeliveryAttempt) -> Result<(), AuditError> {
        let attempt_number = i32::try_from(attempt.attempt_number)
            .map_err(|e| AuditError::Backend(e.to_string()))?;
        let http_status = attempt.http_status.map(i32::from);
        let duration_ms = i64::try_from(attempt.duration_ms).unwrap_or(i64::MAX);
        let outcome = serde_json::to_value(attempt.outcome)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default();

        self.client
            .execute(
                "INSERT INTO webhook_delivery_attempts
                    (webhook_id, event_id, attempt_number, http_status,
                     duration_ms, outcome, error, attempted_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT DO NOTHING",
                &[
                    &attempt.webhook_id.0,
                    &attempt.event_id.0,
                    &attempt_number,
                    &http_status,
                    &duration_ms,
                    &outcome,
                    &attempt.error,
                    &attempt.attempted_at,
                ],
            )
            .await
            .map_err(|e| AuditError::Backend(e.to_string()))?;

        Ok(())
    }
}
