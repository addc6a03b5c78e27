//! In-Process Event Bus
//!
//! Synchronous publish-subscribe with a typed vocabulary and a bounded
//! ring buffer of history for debugging. Subscribers run on the
//! publishing thread, in subscription order; a failing subscriber is
//! logged and does not affect the others. The internal lock is released
//! before dispatch so a subscriber may publish or subscribe reentrantly.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{Event, EventKind};

/// Default number of events retained for debugging.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

type Subscriber = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

struct BusInner {
    subscribers: Vec<(String, Subscriber)>,
    history: VecDeque<Event>,
    capacity: usize,
}

pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                subscribers: Vec::new(),
                history: VecDeque::with_capacity(capacity.min(1024)),
                capacity,
            }),
        }
    }

    /// Register a subscriber under a label (used only for logging).
    pub fn subscribe<F>(&self, label: &str, callback: F)
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.push((label.to_string(), Arc::new(callback)));
    }

    /// Publish an event. Delivery is synchronous and in-order; the event
    /// is recorded in history before any subscriber runs.
    pub fn publish(&self, kind: EventKind, data: serde_json::Value, source: &str) -> Event {
        let event = Event {
            kind,
            data,
            source: source.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            correlation_id: Uuid::new_v4().to_string(),
        };

        // Record history and snapshot subscribers, then drop the lock so
        // subscribers can reenter the bus.
        let subscribers: Vec<(String, Subscriber)> = {
            let mut inner = self.inner.lock().unwrap();
            if inner.history.len() >= inner.capacity {
                inner.history.pop_front();
            }
            inner.history.push_back(event.clone());
            inner.subscribers.clone()
        };

        debug!(kind = ?event.kind, source = source, "event published");

        for (label, callback) in subscribers {
            if let Err(e) = callback(&event) {
                warn!(
                    subscriber = label.as_str(),
                    kind = ?event.kind,
                    "event subscriber failed: {:#}",
                    e
                );
            }
        }

        event
    }

    /// The most recent `limit` events, oldest first.
    pub fn history(&self, limit: usize) -> Vec<Event> {
        let inner = self.inner.lock().unwrap();
        inner
            .history
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
