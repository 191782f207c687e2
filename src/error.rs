use crate::types::{EventStatus, WebhookId};

/// Why a single webhook delivery did not succeed.
///
/// Every variant is either *transient* (worth retrying) or *permanent*
/// (recorded once, never retried). See [`DeliveryError::is_retryable`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("remote endpoint returned {0}")]
    ServerError(u16),

    #[error("client error {0} (non-retryable)")]
    ClientError(u16),

    #[error("webhook is inactive")]
    Inactive,

    #[error("webhook is not subscribed to `{0}`")]
    NotSubscribed(String),

    #[error("webhook belongs to a different tenant")]
    TenantMismatch,

    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("webhook not found")]
    NotFound,

    #[error("webhook lookup failed: {0}")]
    Lookup(String),

    #[error("delivery previously failed permanently")]
    AlreadyFailed,

    #[error("delivery task aborted: {0}")]
    Aborted(String),
}

impl DeliveryError {
    /// Timeouts, network errors and 5xx responses may succeed on a later try.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeliveryError::Timeout | DeliveryError::Network(_) | DeliveryError::ServerError(_)
        )
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            DeliveryError::ServerError(status) | DeliveryError::ClientError(status) => {
                Some(*status)
            }
            _ => None,
        }
    }
}

/// Final outcome of delivering one event to one webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    Failed { error: DeliveryError, attempts: u32 },
    /// Dispatch was cancelled before this webhook reached a terminal state.
    Cancelled { attempts: u32 },
}

/// A rule whose event pattern cannot be interpreted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("event pattern is empty")]
    EmptyPattern,

    #[error("event pattern `{0}` contains whitespace")]
    Whitespace(String),

    #[error("event pattern `{0}` uses a partial wildcard; only `*` is supported")]
    PartialWildcard(String),

    #[error("event pattern `{0}` has an empty segment")]
    EmptySegment(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    #[error("event cannot move from {from:?} to {to:?}")]
    InvalidTransition { from: EventStatus, to: EventStatus },
}

/// Failure reported by a rule or webhook repository.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    #[error("audit sink is closed")]
    Closed,

    #[error("audit backend error: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// A webhook that did not receive the event, as listed in a dispatch report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub webhook_id: WebhookId,
    pub error: DeliveryError,
    pub attempts: u32,
}
