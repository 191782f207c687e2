//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use event_automation::{DispatcherConfig, Event, InMemoryAuditLog, WebhookDispatcher};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const TENANT: &str = "tenant_a";
pub const SECRET: &str = "whsec_test_secret_key_12345";

/// Small timeouts and no jitter so retry tests run quickly.
pub fn fast_config() -> DispatcherConfig {
    DispatcherConfig {
        max_concurrency: 8,
        max_attempts: 3,
        attempt_timeout_ms: 200,
        retry_base_ms: 5,
        retry_max_ms: 20,
        retry_jitter_ms: 0,
        ..DispatcherConfig::default()
    }
}

pub fn dispatcher(config: DispatcherConfig) -> (WebhookDispatcher, Arc<InMemoryAuditLog>) {
    let audit = Arc::new(InMemoryAuditLog::new());
    let dispatcher = WebhookDispatcher::new(config, audit.clone()).expect("dispatcher builds");
    (dispatcher, audit)
}

pub fn campaign_created(id: &str) -> Event {
    Event::new(
        id,
        TENANT,
        "campaign.created",
        serde_json::json!({"campaign_id": 42, "name": "Spring audit"}),
    )
}

/// Mount `responder` on `POST /{route}` and return the full URL.
pub async fn mount<R: Respond + 'static>(
    server: &MockServer,
    route: &str,
    responder: R,
    expected_calls: Option<u64>,
) -> String {
    let mut mock = Mock::given(method("POST"))
        .and(path(format!("/{route}")))
        .respond_with(responder);
    if let Some(n) = expected_calls {
        mock = mock.expect(n);
    }
    mock.mount(server).await;
    format!("{}/{route}", server.uri())
}

/// Returns 200 after `delay`.
pub fn slow_ok(delay: Duration) -> ResponseTemplate {
    ResponseTemplate::new(200).set_delay(delay)
}

/// Fails `n` times with `failure_code`, then returns 200.
#[derive(Clone)]
pub struct FailingResponder {
    attempt_count: Arc<AtomicU32>,
    failures_before_success: u32,
    failure_code: u16,
}

impl FailingResponder {
    pub fn fail_times(n: u32) -> Self {
        Self::fail_with_status(n, 500)
    }

    pub fn fail_with_status(n: u32, failure_code: u16) -> Self {
        Self {
            attempt_count: Arc::new(AtomicU32::new(0)),
            failures_before_success: n,
            failure_code,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count.load(Ordering::SeqCst)
    }
}

impl Respond for FailingResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.attempt_count.fetch_add(1, Ordering::SeqCst);
        if n < self.failures_before_success {
            ResponseTemplate::new(self.failure_code)
        } else {
            ResponseTemplate::new(200)
        }
    }
}
