//! Event-driven automation core.
//!
//! This crate decides which tenant-defined automations fire for an event
//! and delivers signed webhook notifications for them, **concurrently and
//! best-effort**.
//!
//! ## Components
//! - [`EventCache`]: bounded, TTL-based, hit-weighted cache
//! - [`match_rules`]: pure rule selection for an event
//! - [`sign`] / [`verify`]: HMAC-SHA256 over raw body bytes
//! - [`WebhookDispatcher`]: fan-out with bounded retry and an audit trail
//! - [`EventStatisticsAggregator`]: on-demand rollups
//! - [`AutomationEngine`]: wires the above to an [`EventStream`]
//!
//! ## Guarantees
//! - Per-webhook failure isolation
//! - Bounded outbound concurrency
//! - Every delivery attempt is audited
//! - At-least-once delivery with idempotent receivers
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Distributed coordination
//! - Durable queuing across restarts

mod audit;
#[cfg(feature = "postgres")]
mod audit_postgres;
mod bus;
mod cache;
mod clock;
mod config;
mod dispatcher;
mod engine;
mod error;
mod matcher;
mod repository;
mod signing;
mod stats;
mod telemetry;
mod types;
mod worker;

pub use audit::{AuditSink, InMemoryAuditLog, QueuedAuditSink};
#[cfg(feature = "postgres")]
pub use audit_postgres::PostgresAuditSink;
pub use bus::{EventBus, EventStream};
pub use cache::{CacheConfig, CacheStats, EventCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use dispatcher::{DispatcherConfig, WebhookDispatcher};
pub use engine::{AutomationEngine, EngineHandle, ProcessedEvent};
pub use error::{
    AuditError, ConfigError, DeliveryError, DeliveryFailure, DeliveryOutcome, EventError,
    RepositoryError, RuleError,
};
pub use matcher::{match_rules, record_execution, EventPattern};
pub use repository::{
    InMemoryRuleRepository, InMemoryWebhookRepository, RuleRepository, WebhookRepository,
};
pub use signing::{sign, verify, verify_webhook_request, VerificationError, SIGNATURE_HEADER};
pub use stats::{EventStatistics, EventStatisticsAggregator};
pub use types::{
    AttemptOutcome, AutomationRule, DeliveryAttempt, DeliveryKey, DeliveryState, DispatchReport,
    Event, EventId, EventPriority, EventStatus, RuleAction, RuleId, Subscription, TenantId,
    Webhook, WebhookId,
};
