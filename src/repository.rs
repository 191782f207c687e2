//! Persistence seams for rules and webhooks.
//!
//! The automation core never owns these records. Production deployments
//! implement the traits over their own database; the in-memory versions
//! back tests and embedded use.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};

use crate::error::RepositoryError;
use crate::matcher::record_execution;
use crate::types::{AutomationRule, RuleId, TenantId, Webhook, WebhookId};

#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// All rules of a tenant, enabled or not.
    async fn list_rules(&self, tenant_id: &TenantId) -> Result<Vec<AutomationRule>, RepositoryError>;

    async fn get_rule(&self, id: &RuleId) -> Result<Option<AutomationRule>, RepositoryError>;

    /// Persist one execution of a dispatched rule.
    async fn record_execution(&self, id: &RuleId, at: DateTime<Utc>) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait WebhookRepository: Send + Sync {
    async fn get_webhook(&self, id: &WebhookId) -> Result<Option<Webhook>, RepositoryError>;

    /// Active webhooks of a tenant subscribed to `event_type`.
    async fn list_subscribed(
        &self,
        tenant_id: &TenantId,
        event_type: &str,
    ) -> Result<Vec<Webhook>, RepositoryError>;

    /// Feed of ids whose record was inserted, updated or removed.
    ///
    /// Repositories without change tracking return `None`; callers that
    /// cache webhooks must then invalidate them some other way.
    fn watch(&self) -> Option<broadcast::Receiver<WebhookId>> {
        None
    }
}

#[derive(Default)]
pub struct InMemoryRuleRepository {
    rules: RwLock<HashMap<RuleId, AutomationRule>>,
}

impl InMemoryRuleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, rule: AutomationRule) {
        self.rules.write().await.insert(rule.id.clone(), rule);
    }

    pub async fn remove(&self, id: &RuleId) -> Option<AutomationRule> {
        self.rules.write().await.remove(id)
    }

    pub async fn set_enabled(&self, id: &RuleId, enabled: bool) -> Result<(), RepositoryError> {
        let mut rules = self.rules.write().await;
        let rule = rules
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        if enabled {
            rule.enable();
        } else {
            rule.disable();
        }
        Ok(())
    }
}

#[async_trait]
impl RuleRepository for InMemoryRuleRepository {
    async fn list_rules(&self, tenant_id: &TenantId) -> Result<Vec<AutomationRule>, RepositoryError> {
        Ok(self
            .rules
            .read()
            .await
            .values()
            .filter(|rule| &rule.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn get_rule(&self, id: &RuleId) -> Result<Option<AutomationRule>, RepositoryError> {
        Ok(self.rules.read().await.get(id).cloned())
    }

    async fn record_execution(&self, id: &RuleId, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        let mut rules = self.rules.write().await;
        let rule = rules
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        record_execution(rule, at);
        Ok(())
    }
}

const CHANGE_FEED_CAPACITY: usize = 256;

pub struct InMemoryWebhookRepository {
    webhooks: RwLock<HashMap<WebhookId, Webhook>>,
    changes: broadcast::Sender<WebhookId>,
}

impl Default for InMemoryWebhookRepository {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            webhooks: RwLock::new(HashMap::new()),
            changes,
        }
    }
}

impl InMemoryWebhookRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a webhook.
    pub async fn insert(&self, webhook: Webhook) {
        let id = webhook.id.clone();
        self.webhooks.write().await.insert(id.clone(), webhook);
        self.notify(id);
    }

    pub async fn remove(&self, id: &WebhookId) -> Option<Webhook> {
        let removed = self.webhooks.write().await.remove(id);
        if removed.is_some() {
            self.notify(id.clone());
        }
        removed
    }

    fn notify(&self, id: WebhookId) {
        // No watchers is fine.
        let _ = self.changes.send(id);
    }
}

#[async_trait]
impl WebhookRepository for InMemoryWebhookRepository {
    async fn get_webhook(&self, id: &WebhookId) -> Result<Option<Webhook>, RepositoryError> {
        Ok(self.webhooks.read().await.get(id).cloned())
    }

    async fn list_subscribed(
        &self,
        tenant_id: &TenantId,
        event_type: &str,
    ) -> Result<Vec<Webhook>, RepositoryError> {
        let mut webhooks: Vec<Webhook> = self
            .webhooks
            .read()
            .await
            .values()
            .filter(|w| {
                w.active && &w.tenant_id == tenant_id && w.subscribed_events.matches(event_type)
            })
            .cloned()
            .collect();
        webhooks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(webhooks)
    }

    fn watch(&self) -> Option<broadcast::Receiver<WebhookId>> {
        Some(self.changes.subscribe())
    }
}
