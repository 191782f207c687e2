//! Selection of the automation rules that fire for an event.
//!
//! Matching is a pure function of the event and the rule list. The only
//! mutation, [`record_execution`], is applied by the caller once dispatch
//! has been attempted.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::error::RuleError;
use crate::types::{AutomationRule, Event};

/// A parsed rule pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPattern {
    /// `*`: every event type.
    Any,
    Exact(String),
}

impl EventPattern {
    pub fn parse(raw: &str) -> Result<Self, RuleError> {
        if raw.is_empty() {
            return Err(RuleError::EmptyPattern);
        }
        if raw == "*" {
            return Ok(EventPattern::Any);
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(RuleError::Whitespace(raw.to_string()));
        }
        if raw.contains('*') {
            return Err(RuleError::PartialWildcard(raw.to_string()));
        }
        if raw.split('.').any(str::is_empty) {
            return Err(RuleError::EmptySegment(raw.to_string()));
        }
        Ok(EventPattern::Exact(raw.to_string()))
    }

    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            EventPattern::Any => true,
            EventPattern::Exact(expected) => expected == event_type,
        }
    }
}

/// Return the enabled rules of the event's tenant whose pattern matches the
/// event type, in execution order.
///
/// Malformed rules are logged and skipped; they never prevent the remaining
/// rules from matching.
pub fn match_rules(event: &Event, rules: &[AutomationRule]) -> Vec<AutomationRule> {
    let mut matched: Vec<AutomationRule> = rules
        .iter()
        .filter(|rule| rule.enabled && rule.tenant_id == event.tenant_id)
        .filter(|rule| match EventPattern::parse(&rule.event_pattern) {
            Ok(pattern) => pattern.matches(&event.event_type),
            Err(error) => {
                tracing::warn!(
                    rule_id = %rule.id,
                    tenant_id = %rule.tenant_id,
                    %error,
                    "skipping malformed automation rule"
                );
                false
            }
        })
        .cloned()
        .collect();

    matched.sort_by(execution_order);
    matched
}

/// Explicit priorities first (lower runs first), then creation time.
fn execution_order(a: &AutomationRule, b: &AutomationRule) -> Ordering {
    let by_priority = match (a.priority, b.priority) {
        (Some(pa), Some(pb)) => pa.cmp(&pb),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_priority
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Bump the execution counters of a rule that was dispatched.
pub fn record_execution(rule: &mut AutomationRule, at: DateTime<Utc>) {
    rule.execution_count += 1;
    rule.last_executed_at = Some(at);
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn event(event_type: &str) -> Event {
        Event::new("evt_1", "tenant_a", event_type, serde_json::json!({"id": 1}))
    }

    fn rule(id: &str, pattern: &str) -> AutomationRule {
        AutomationRule::new(id, "tenant_a", id, pattern)
    }

    fn ids(rules: &[AutomationRule]) -> Vec<&str> {
        rules.iter().map(|r| r.id.0.as_str()).collect()
    }

    #[test]
    fn exact_match_ignores_disabled_wildcard() {
        let rules = vec![
            rule("rule1", "campaign.created"),
            rule("rule2", "*").enabled(false),
        ];

        let matched = match_rules(&event("campaign.created"), &rules);
        assert_eq!(ids(&matched), vec!["rule1"]);
    }

    #[test]
    fn wildcard_matches_every_type() {
        let rules = vec![rule("any", "*")];
        for event_type in ["campaign.created", "audit.finding.closed", "x"] {
            assert_eq!(ids(&match_rules(&event(event_type), &rules)), vec!["any"]);
        }
    }

    #[test]
    fn disabled_rules_never_match() {
        let rules = vec![
            rule("exact", "risk.raised").enabled(false),
            rule("any", "*").enabled(false),
        ];
        assert!(match_rules(&event("risk.raised"), &rules).is_empty());
    }

    #[test]
    fn no_partial_matching() {
        let rules = vec![rule("prefix", "campaign"), rule("longer", "campaign.created.v2")];
        assert!(match_rules(&event("campaign.created"), &rules).is_empty());
    }

    #[test]
    fn unmatched_event_yields_empty() {
        assert!(match_rules(&event("committee.met"), &[]).is_empty());
        assert!(match_rules(&event("committee.met"), &[rule("r", "lms.enrolled")]).is_empty());
    }

    #[test]
    fn other_tenants_rules_do_not_match() {
        let mut foreign = rule("foreign", "*");
        foreign.tenant_id = crate::types::TenantId("tenant_b".into());
        assert!(match_rules(&event("campaign.created"), &[foreign]).is_empty());
    }

    #[test]
    fn malformed_rules_are_skipped_not_fatal() {
        let rules = vec![
            rule("glob", "campaign.*"),
            rule("empty", ""),
            rule("spaces", "campaign created"),
            rule("dots", "campaign..created"),
            rule("good", "campaign.created"),
        ];

        assert_eq!(ids(&match_rules(&event("campaign.created"), &rules)), vec!["good"]);
    }

    #[test]
    fn ordering_by_priority_then_creation_time() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let rules = vec![
            rule("late", "*").with_created_at(t0 + Duration::hours(2)),
            rule("early", "*").with_created_at(t0),
            rule("p5", "*").with_priority(5).with_created_at(t0 + Duration::hours(3)),
            rule("p1", "*").with_priority(1).with_created_at(t0 + Duration::hours(4)),
        ];

        let matched = match_rules(&event("a.b"), &rules);
        assert_eq!(ids(&matched), vec!["p1", "p5", "early", "late"]);
    }

    #[test]
    fn pattern_parse_cases() {
        assert_eq!(EventPattern::parse("*"), Ok(EventPattern::Any));
        assert_eq!(
            EventPattern::parse("a.b"),
            Ok(EventPattern::Exact("a.b".to_string()))
        );
        assert_eq!(EventPattern::parse(""), Err(RuleError::EmptyPattern));
        assert!(matches!(EventPattern::parse("**"), Err(RuleError::PartialWildcard(_))));
        assert!(matches!(EventPattern::parse(".a"), Err(RuleError::EmptySegment(_))));
    }

    #[test]
    fn record_execution_bumps_counters() {
        let mut r = rule("r", "*");
        let at = Utc::now();
        record_execution(&mut r, at);
        record_execution(&mut r, at);

        assert_eq!(r.execution_count, 2);
        assert_eq!(r.last_executed_at, Some(at));
    }
}
