mod common;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_automation::{
    AutomationEngine, AutomationRule, DeliveryError, EngineConfig, EventBus, EventStatus,
    InMemoryAuditLog, InMemoryRuleRepository, InMemoryWebhookRepository, RepositoryError,
    RuleId, RuleRepository, Subscription, TenantId, Webhook, WebhookId,
};
use tokio_util::sync::CancellationToken;
use wiremock::{MockServer, ResponseTemplate};

use common::{campaign_created, fast_config, mount, TENANT};

struct Fixture {
    engine: Arc<AutomationEngine>,
    rules: Arc<InMemoryRuleRepository>,
    webhooks: Arc<InMemoryWebhookRepository>,
    audit: Arc<InMemoryAuditLog>,
}

fn engine_config() -> EngineConfig {
    EngineConfig {
        dispatcher: fast_config(),
        ..EngineConfig::default()
    }
}

fn fixture() -> Fixture {
    let rules = Arc::new(InMemoryRuleRepository::new());
    let webhooks = Arc::new(InMemoryWebhookRepository::new());
    let audit = Arc::new(InMemoryAuditLog::new());
    let engine = AutomationEngine::new(
        engine_config(),
        rules.clone(),
        webhooks.clone(),
        audit.clone(),
    )
    .expect("engine builds");

    Fixture {
        engine: Arc::new(engine),
        rules,
        webhooks,
        audit,
    }
}

#[tokio::test]
async fn matching_rule_fires_and_disabled_rule_does_not() {
    let server = MockServer::start().await;
    let url = mount(&server, "hook", ResponseTemplate::new(200), Some(1)).await;
    let fx = fixture();

    fx.webhooks.insert(Webhook::new("wh_1", TENANT, url)).await;
    fx.rules
        .insert(AutomationRule::new("rule1", TENANT, "on create", "campaign.created").notify("wh_1"))
        .await;
    fx.rules
        .insert(
            AutomationRule::new("rule2", TENANT, "catch all", "*")
                .notify("wh_1")
                .enabled(false),
        )
        .await;

    let outcome = fx.engine.process(campaign_created("evt_1")).await;

    assert_eq!(outcome.matched_rules, vec![RuleId("rule1".into())]);
    assert_eq!(outcome.event.status, EventStatus::Processed);
    assert!(outcome.event.processed_at.is_some());
    assert_eq!(outcome.report.successful, 1);

    let rule1 = fx.rules.get_rule(&RuleId("rule1".into())).await.unwrap().unwrap();
    assert_eq!(rule1.execution_count, 1);
    assert!(rule1.last_executed_at.is_some());

    let rule2 = fx.rules.get_rule(&RuleId("rule2".into())).await.unwrap().unwrap();
    assert_eq!(rule2.execution_count, 0);
}

#[tokio::test]
async fn event_without_matches_is_still_processed() {
    let fx = fixture();
    fx.rules
        .insert(AutomationRule::new("rule1", TENANT, "risk", "risk.raised").notify("wh_1"))
        .await;

    let outcome = fx.engine.process(campaign_created("evt_none")).await;

    assert!(outcome.matched_rules.is_empty());
    assert_eq!(outcome.report.total, 0);
    assert_eq!(outcome.event.status, EventStatus::Processed);
}

#[tokio::test]
async fn failed_deliveries_do_not_fail_the_event() {
    let server = MockServer::start().await;
    let url = mount(&server, "gone", ResponseTemplate::new(410), Some(1)).await;
    let fx = fixture();

    fx.webhooks.insert(Webhook::new("wh_gone", TENANT, url)).await;
    fx.rules
        .insert(AutomationRule::new("rule1", TENANT, "all", "*").notify("wh_gone"))
        .await;

    let outcome = fx.engine.process(campaign_created("evt_fail")).await;

    assert_eq!(outcome.report.failed, 1);
    assert_eq!(outcome.report.errors[0].error, DeliveryError::ClientError(410));
    assert_eq!(outcome.event.status, EventStatus::Processed);
    assert_eq!(fx.audit.attempts().await.len(), 1);
}

#[tokio::test]
async fn overlapping_rules_notify_a_webhook_once() {
    let server = MockServer::start().await;
    let url = mount(&server, "hook", ResponseTemplate::new(200), Some(1)).await;
    let fx = fixture();

    fx.webhooks.insert(Webhook::new("wh_1", TENANT, url)).await;
    fx.rules
        .insert(AutomationRule::new("exact", TENANT, "exact", "campaign.created").notify("wh_1"))
        .await;
    fx.rules
        .insert(AutomationRule::new("any", TENANT, "any", "*").notify("wh_1"))
        .await;

    let outcome = fx.engine.process(campaign_created("evt_overlap")).await;

    assert_eq!(outcome.matched_rules.len(), 2);
    assert_eq!(outcome.report.total, 1);
    assert_eq!(outcome.report.successful, 1);
}

#[tokio::test]
async fn unknown_webhook_is_reported_not_sent() {
    let fx = fixture();
    fx.rules
        .insert(AutomationRule::new("rule1", TENANT, "all", "*").notify("wh_missing"))
        .await;

    let outcome = fx.engine.process(campaign_created("evt_missing")).await;

    assert_eq!(outcome.report.failed, 1);
    assert_eq!(outcome.report.errors[0].error, DeliveryError::NotFound);
    assert_eq!(outcome.event.status, EventStatus::Processed);
}

#[tokio::test]
async fn settled_events_are_skipped() {
    let fx = fixture();
    fx.rules
        .insert(AutomationRule::new("rule1", TENANT, "all", "*").notify("wh_1"))
        .await;

    let mut event = campaign_created("evt_done");
    event.mark_processed(Utc::now()).unwrap();

    let outcome = fx.engine.process(event).await;
    assert!(outcome.matched_rules.is_empty());
    assert_eq!(outcome.report.total, 0);
}

struct UnavailableRules;

#[async_trait]
impl RuleRepository for UnavailableRules {
    async fn list_rules(&self, _tenant_id: &TenantId) -> Result<Vec<AutomationRule>, RepositoryError> {
        Err(RepositoryError::Unavailable("connection refused".into()))
    }

    async fn get_rule(&self, _id: &RuleId) -> Result<Option<AutomationRule>, RepositoryError> {
        Err(RepositoryError::Unavailable("connection refused".into()))
    }

    async fn record_execution(&self, _id: &RuleId, _at: DateTime<Utc>) -> Result<(), RepositoryError> {
        Err(RepositoryError::Unavailable("connection refused".into()))
    }
}

#[tokio::test]
async fn unreadable_rules_fail_the_event() {
    let engine = AutomationEngine::new(
        engine_config(),
        Arc::new(UnavailableRules),
        Arc::new(InMemoryWebhookRepository::new()),
        Arc::new(InMemoryAuditLog::new()),
    )
    .unwrap();

    let outcome = engine.process(campaign_created("evt_broken")).await;

    assert_eq!(outcome.event.status, EventStatus::Failed);
    assert!(outcome.event.processed_at.is_some());
}

#[tokio::test]
async fn webhooks_are_served_from_cache_after_first_lookup() {
    let server = MockServer::start().await;
    let url = mount(&server, "hook", ResponseTemplate::new(200), Some(2)).await;
    let fx = fixture();

    fx.webhooks.insert(Webhook::new("wh_1", TENANT, url)).await;
    fx.rules
        .insert(AutomationRule::new("rule1", TENANT, "all", "*").notify("wh_1"))
        .await;

    fx.engine.process(campaign_created("evt_a")).await;
    fx.engine.process(campaign_created("evt_b")).await;

    let stats = fx.engine.cache_stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.size, 1);

    assert!(fx.engine.invalidate_webhook(&WebhookId("wh_1".into())));
    assert_eq!(fx.engine.cache_stats().size, 0);
}

#[tokio::test]
async fn started_engine_drains_the_bus() {
    let server = MockServer::start().await;
    let url = mount(&server, "hook", ResponseTemplate::new(200), Some(3)).await;
    let fx = fixture();

    fx.webhooks.insert(Webhook::new("wh_1", TENANT, url)).await;
    fx.rules
        .insert(AutomationRule::new("rule1", TENANT, "created", "campaign.created").notify("wh_1"))
        .await;

    let bus = EventBus::from_config(&engine_config());
    let handle = Arc::clone(&fx.engine).start(bus.subscribe(Subscription::All));

    for i in 0..3 {
        assert_eq!(bus.publish(&campaign_created(&format!("evt_{i}"))).await, 1);
    }
    drop(bus);

    assert_eq!(handle.join().await, 3);
    assert_eq!(fx.audit.attempts().await.len(), 3);
}

#[tokio::test]
async fn stopping_an_idle_engine_returns_promptly() {
    let fx = fixture();
    let bus = EventBus::new(4);
    let handle = Arc::clone(&fx.engine).start(bus.subscribe(Subscription::All));

    let processed = tokio::time::timeout(std::time::Duration::from_secs(2), handle.stop())
        .await
        .expect("engine stops");
    assert_eq!(processed, 0);
    assert_eq!(bus.subscriber_count(), 0);
}

#[tokio::test]
async fn cancelled_dispatch_leaves_event_pending_and_counters_unchanged() {
    let server = MockServer::start().await;
    let url = mount(&server, "hook", ResponseTemplate::new(200), Some(1)).await;
    let fx = fixture();

    fx.webhooks.insert(Webhook::new("wh_1", TENANT, url)).await;
    fx.rules
        .insert(AutomationRule::new("rule1", TENANT, "all", "*").notify("wh_1"))
        .await;

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let interrupted = fx
        .engine
        .process_until(campaign_created("evt_resume"), &shutdown)
        .await;

    assert_eq!(interrupted.report.cancelled, 1);
    assert_eq!(interrupted.event.status, EventStatus::Pending);
    assert!(interrupted.event.processed_at.is_none());
    assert!(fx.audit.attempts().await.is_empty());
    let rule1 = fx.rules.get_rule(&RuleId("rule1".into())).await.unwrap().unwrap();
    assert_eq!(rule1.execution_count, 0);

    let resumed = fx.engine.process(interrupted.event).await;

    assert_eq!(resumed.report.successful, 1);
    assert_eq!(resumed.event.status, EventStatus::Processed);
    let rule1 = fx.rules.get_rule(&RuleId("rule1".into())).await.unwrap().unwrap();
    assert_eq!(rule1.execution_count, 1);
}

#[tokio::test]
async fn deactivated_webhook_is_not_served_from_cache() {
    let server = MockServer::start().await;
    let url = mount(&server, "hook", ResponseTemplate::new(200), Some(1)).await;
    let fx = fixture();

    let webhook = Webhook::new("wh_1", TENANT, url);
    fx.webhooks.insert(webhook.clone()).await;
    fx.rules
        .insert(AutomationRule::new("rule1", TENANT, "all", "*").notify("wh_1"))
        .await;

    let first = fx.engine.process(campaign_created("evt_before")).await;
    assert_eq!(first.report.successful, 1);

    fx.webhooks.insert(webhook.active(false)).await;

    let second = fx.engine.process(campaign_created("evt_after")).await;
    assert_eq!(second.report.successful, 0);
    assert_eq!(second.report.failed, 1);
    assert_eq!(second.report.errors[0].error, DeliveryError::Inactive);
}

#[tokio::test]
async fn settled_events_release_their_delivery_states() {
    let server = MockServer::start().await;
    let url = mount(&server, "hook", ResponseTemplate::new(200), Some(20)).await;
    let fx = fixture();

    fx.webhooks.insert(Webhook::new("wh_1", TENANT, url)).await;
    fx.rules
        .insert(AutomationRule::new("rule1", TENANT, "all", "*").notify("wh_1"))
        .await;

    let mut ids = Vec::new();
    for i in 0..20 {
        let outcome = fx.engine.process(campaign_created(&format!("evt_{i}"))).await;
        assert_eq!(outcome.event.status, EventStatus::Processed);
        ids.push(outcome.event.id);
    }

    for id in &ids {
        assert!(fx
            .engine
            .dispatcher()
            .delivery_status_for_event(id)
            .await
            .is_empty());
    }
}

#[tokio::test]
async fn subscribers_are_notified_without_rules() {
    let server = MockServer::start().await;
    let subscribed = mount(&server, "subscribed", ResponseTemplate::new(200), Some(1)).await;
    let other = mount(&server, "other", ResponseTemplate::new(200), Some(0)).await;
    let fx = fixture();

    fx.webhooks
        .insert(
            Webhook::new("wh_campaigns", TENANT, subscribed)
                .subscribed_to(Subscription::events(["campaign.created"])),
        )
        .await;
    fx.webhooks
        .insert(
            Webhook::new("wh_risk", TENANT, other)
                .subscribed_to(Subscription::events(["risk.raised"])),
        )
        .await;

    let event = campaign_created("evt_broadcast");
    let report = fx
        .engine
        .notify_subscribers(&event, &CancellationToken::new())
        .await
        .expect("subscribers listed");

    assert_eq!(report.total, 1);
    assert_eq!(report.successful, 1);
    assert_eq!(fx.engine.cache_stats().size, 1);
}
