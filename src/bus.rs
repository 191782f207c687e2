//! In-process event fan-in for the dispatch loop.
//!
//! Producers [`publish`](EventBus::publish) events; consumers
//! [`subscribe`](EventBus::subscribe) to a set of event types and read an
//! [`EventStream`]. Closing or dropping the stream unsubscribes it.

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::telemetry::metric_inc;
use crate::types::{Event, Subscription};

struct Subscriber {
    filter: Subscription,
    tx: mpsc::Sender<Event>,
}

pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    buffer: usize,
}

impl EventBus {
    /// `buffer` bounds each subscriber's queue; publishing waits when a
    /// subscriber falls behind.
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            buffer: buffer.max(1),
        }
    }

    /// Bus whose subscriptions queue up to `event_buffer` events each.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.event_buffer)
    }

    pub fn subscribe(&self, filter: Subscription) -> EventStream {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers.lock().push(Subscriber { filter, tx });
        EventStream { rx }
    }

    /// Send `event` to every matching subscriber, returning how many
    /// received it. Closed streams are pruned.
    pub async fn publish(&self, event: &Event) -> usize {
        let targets: Vec<mpsc::Sender<Event>> = {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|s| !s.tx.is_closed());
            subscribers
                .iter()
                .filter(|s| s.filter.matches(&event.event_type))
                .map(|s| s.tx.clone())
                .collect()
        };

        let mut delivered = 0;
        for tx in targets {
            if tx.send(event.clone()).await.is_ok() {
                delivered += 1;
            }
        }

        metric_inc("automation.bus.published");
        tracing::trace!(event_id = %event.id, delivered, "event published");
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.tx.is_closed());
        subscribers.len()
    }
}

/// Receiving half of a subscription.
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
}

impl EventStream {
    /// Next event, or `None` once the stream is closed and drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Stop accepting new events. Already queued events can still be read.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
