use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, DeliveryFailure, DeliveryOutcome, EventError};

/// Unique identifier for an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub String);

/// Unique identifier for a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

/// Unique identifier for an automation rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(pub String);

/// Unique identifier for a webhook.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of webhook IDs with other string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WebhookId(pub String);

macro_rules! impl_id_display {
    ($($ty:ty),*) => {
        $(impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        })*
    };
}

impl_id_display!(EventId, TenantId, RuleId, WebhookId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Processed,
    Failed,
}

/// A domain occurrence routed through the automation core.
///
/// The payload is opaque to this crate; shape validation belongs to the
/// domain that produced the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub tenant_id: TenantId,

    /// Dot-namespaced type, e.g. `campaign.created`.
    #[serde(rename = "type")]
    pub event_type: String,

    pub category: String,
    pub priority: EventPriority,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub status: EventStatus,
}

impl Event {
    /// Create a pending event with medium priority, categorised by the first
    /// segment of its type.
    pub fn new(
        id: impl Into<String>,
        tenant_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let event_type = event_type.into();
        let category = event_type
            .split('.')
            .next()
            .unwrap_or_default()
            .to_string();
        Self {
            id: EventId(id.into()),
            tenant_id: TenantId(tenant_id.into()),
            event_type,
            category,
            priority: EventPriority::Medium,
            payload,
            created_at: Utc::now(),
            processed_at: None,
            status: EventStatus::Pending,
        }
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Transition `pending -> processed`.
    pub fn mark_processed(&mut self, at: DateTime<Utc>) -> Result<(), EventError> {
        self.transition(EventStatus::Processed, at)
    }

    /// Transition `pending -> failed`.
    pub fn mark_failed(&mut self, at: DateTime<Utc>) -> Result<(), EventError> {
        self.transition(EventStatus::Failed, at)
    }

    fn transition(&mut self, to: EventStatus, at: DateTime<Utc>) -> Result<(), EventError> {
        if self.status != EventStatus::Pending {
            return Err(EventError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.processed_at = Some(at);
        Ok(())
    }
}

/// What a rule does when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    /// Notify a registered webhook.
    Webhook { webhook_id: WebhookId },

    /// An action kind this core does not execute.
    #[serde(other)]
    Unsupported,
}

/// A tenant-defined binding from an event pattern to notification actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: RuleId,
    pub tenant_id: TenantId,
    pub name: String,

    /// Exact event type, or `*` for every event.
    pub event_pattern: String,

    pub enabled: bool,
    pub actions: Vec<RuleAction>,

    /// Lower runs first; rules without a priority run after those with one.
    #[serde(default)]
    pub priority: Option<i32>,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub execution_count: u64,

    #[serde(default)]
    pub last_executed_at: Option<DateTime<Utc>>,
}

impl AutomationRule {
    pub fn new(
        id: impl Into<String>,
        tenant_id: impl Into<String>,
        name: impl Into<String>,
        event_pattern: impl Into<String>,
    ) -> Self {
        Self {
            id: RuleId(id.into()),
            tenant_id: TenantId(tenant_id.into()),
            name: name.into(),
            event_pattern: event_pattern.into(),
            enabled: true,
            actions: Vec::new(),
            priority: None,
            created_at: Utc::now(),
            execution_count: 0,
            last_executed_at: None,
        }
    }

    /// Add a webhook notification action.
    pub fn notify(mut self, webhook_id: impl Into<String>) -> Self {
        self.actions.push(RuleAction::Webhook {
            webhook_id: WebhookId(webhook_id.into()),
        });
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Webhooks this rule notifies, in declaration order.
    pub fn webhook_targets(&self) -> impl Iterator<Item = &WebhookId> {
        self.actions.iter().filter_map(|action| match action {
            RuleAction::Webhook { webhook_id } => Some(webhook_id),
            RuleAction::Unsupported => None,
        })
    }
}

/// The set of event types a webhook or stream listens to.
///
/// Serialized as the string `"*"` or as a list of event types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SubscriptionRepr", into = "SubscriptionRepr")]
pub enum Subscription {
    All,
    Events(BTreeSet<String>),
}

impl Subscription {
    pub fn events<I, S>(event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Subscription::Events(event_types.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            Subscription::All => true,
            Subscription::Events(types) => types.contains(event_type),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum SubscriptionRepr {
    Wildcard(String),
    Events(BTreeSet<String>),
}

impl TryFrom<SubscriptionRepr> for Subscription {
    type Error = String;

    fn try_from(repr: SubscriptionRepr) -> Result<Self, Self::Error> {
        match repr {
            SubscriptionRepr::Wildcard(s) if s == "*" => Ok(Subscription::All),
            SubscriptionRepr::Wildcard(s) => Err(format!(
                "expected `*` or a list of event types, got `{s}`"
            )),
            SubscriptionRepr::Events(types) => Ok(Subscription::Events(types)),
        }
    }
}

impl From<Subscription> for SubscriptionRepr {
    fn from(subscription: Subscription) -> Self {
        match subscription {
            Subscription::All => SubscriptionRepr::Wildcard("*".to_string()),
            Subscription::Events(types) => SubscriptionRepr::Events(types),
        }
    }
}

/// An external HTTP endpoint registered to receive event notifications.
///
/// Webhooks have their own lifecycle; rules refer to them by id only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: WebhookId,
    pub tenant_id: TenantId,
    pub url: String,

    /// HMAC key used when `verify_signature` is set.
    pub secret: String,

    pub subscribed_events: Subscription,
    pub active: bool,

    /// Sign request bodies and send `x-webhook-signature`.
    pub verify_signature: bool,
}

impl Webhook {
    /// Create an active webhook subscribed to every event, without signing.
    pub fn new(
        id: impl Into<String>,
        tenant_id: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            id: WebhookId(id.into()),
            tenant_id: TenantId(tenant_id.into()),
            url: url.into(),
            secret: String::new(),
            subscribed_events: Subscription::All,
            active: true,
            verify_signature: false,
        }
    }

    /// Sign deliveries with `secret`.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self.verify_signature = true;
        self
    }

    pub fn subscribed_to(mut self, subscription: Subscription) -> Self {
        self.subscribed_events = subscription;
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Failure,
    Timeout,
}

/// Immutable audit record of one delivery try.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub webhook_id: WebhookId,
    pub event_id: EventId,

    /// 1-based, strictly increasing per (webhook, event).
    pub attempt_number: u32,

    pub http_status: Option<u16>,
    pub duration_ms: u64,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

/// Identity of one delivery: an event headed to one webhook.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryKey {
    pub webhook_id: WebhookId,
    pub event_id: EventId,
}

impl DeliveryKey {
    pub fn new(webhook_id: WebhookId, event_id: EventId) -> Self {
        Self { webhook_id, event_id }
    }
}

/// Delivery lifecycle for an event + webhook.
///
/// `Delivered` and `PermanentlyFailed` are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    Pending,
    Attempting { attempt: u32 },
    Retrying { attempt: u32, last_error: String },
    Delivered { attempts: u32 },
    PermanentlyFailed { attempts: u32, error: String },
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryState::Delivered { .. } | DeliveryState::PermanentlyFailed { .. }
        )
    }
}

/// Aggregate result of one dispatch call.
///
/// `successful + failed + cancelled == total` always holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub errors: Vec<DeliveryFailure>,
}

impl DispatchReport {
    pub fn record(&mut self, webhook_id: WebhookId, outcome: DeliveryOutcome) {
        self.total += 1;
        match outcome {
            DeliveryOutcome::Delivered { .. } => self.successful += 1,
            DeliveryOutcome::Cancelled { .. } => self.cancelled += 1,
            DeliveryOutcome::Failed { error, attempts } => {
                self.failed += 1;
                self.errors.push(DeliveryFailure {
                    webhook_id,
                    error,
                    attempts,
                });
            }
        }
    }

    pub fn record_failure(&mut self, webhook_id: WebhookId, error: DeliveryError) {
        self.record(webhook_id, DeliveryOutcome::Failed { error, attempts: 0 });
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: DispatchReport) {
        self.total += other.total;
        self.successful += other.successful;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
        self.errors.extend(other.errors);
    }
}
