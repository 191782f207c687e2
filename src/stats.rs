//! Read-only rollups over a snapshot of events.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::types::{Event, EventPriority, EventStatus};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EventStatistics {
    pub total: usize,
    pub pending: usize,
    pub processed: usize,
    pub critical: usize,
    /// Events created in the 24 hours before `now`, divided by 24.
    pub events_per_hour: f64,
}

/// Recomputes statistics from scratch on every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventStatisticsAggregator;

impl EventStatisticsAggregator {
    pub fn aggregate(events: &[Event], now: DateTime<Utc>) -> EventStatistics {
        let window_start = now - Duration::hours(24);

        let mut stats = EventStatistics {
            total: events.len(),
            pending: 0,
            processed: 0,
            critical: 0,
            events_per_hour: 0.0,
        };
        let mut recent = 0usize;

        for event in events {
            if event.status == EventStatus::Pending {
                stats.pending += 1;
            }
            if event.processed_at.is_some() {
                stats.processed += 1;
            }
            if event.priority == EventPriority::Critical {
                stats.critical += 1;
            }
            if event.created_at >= window_start {
                recent += 1;
            }
        }

        stats.events_per_hour = recent as f64 / 24.0;
        stats
    }
}
