//! In-process pub/sub with bounded history.
//!
//! Fan-out is per-subscriber: each subscription owns a bounded queue, so a
//! slow subscriber only loses its own events (oldest first), recorded in its
//! drop counter. Publishing never blocks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::{EventEmitter, RuntimeEvent};
use crate::queue::{BoundedQueue, DropPolicy};
use crate::state::EventBusConfig;

/// Scope filter for a bus subscription.
///
/// `None` fields match everything; a subscription scoped to a workflow sees
/// all of that workflow's events, optionally narrowed to one node.
#[derive(Debug, Clone, Default)]
pub struct EventScope {
    pub workflow_id: Option<String>,
    pub node_id: Option<String>,
}

impl EventScope {
    /// Scope matching every event.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Scope matching one workflow's events.
    #[must_use]
    pub fn workflow(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: Some(workflow_id.into()),
            node_id: None,
        }
    }

    /// Scope matching one node's events.
    #[must_use]
    pub fn node(workflow_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            workflow_id: Some(workflow_id.into()),
            node_id: Some(node_id.into()),
        }
    }

    fn matches(&self, event: &RuntimeEvent) -> bool {
        if let Some(wanted) = &self.workflow_id {
            if event.workflow_id() != Some(wanted.as_str()) {
                return false;
            }
        }
        if let Some(wanted) = &self.node_id {
            if event.node_id() != Some(wanted.as_str()) {
                return false;
            }
        }
        true
    }
}

struct Subscriber {
    scope: EventScope,
    queue: Arc<BoundedQueue<RuntimeEvent>>,
}

/// A live subscription to the event bus.
///
/// Dropping the subscription detaches it from the bus.
pub struct EventSubscription {
    id: u64,
    queue: Arc<BoundedQueue<RuntimeEvent>>,
    subscribers: Arc<DashMap<u64, Subscriber>>,
}

impl EventSubscription {
    /// Awaits the next event matching this subscription's scope.
    ///
    /// Returns `None` after the subscription is closed and drained.
    pub async fn recv(&self) -> Option<RuntimeEvent> {
        self.queue.pop().await
    }

    /// Removes the next event without waiting.
    pub fn try_recv(&self) -> Option<RuntimeEvent> {
        self.queue.try_pop()
    }

    /// Events this subscriber lost to back-pressure.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Consumes the subscription as an async stream, ending when the bus
    /// closes it.
    pub fn into_stream(self) -> impl futures::Stream<Item = RuntimeEvent> {
        async_stream::stream! {
            while let Some(event) = self.recv().await {
                yield event;
            }
        }
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.subscribers.remove(&self.id);
        self.queue.close();
    }
}

/// Single-process pub/sub for runtime events with bounded history.
pub struct EventBus {
    subscribers: Arc<DashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    history: Mutex<VecDeque<RuntimeEvent>>,
    config: EventBusConfig,
}

impl EventBus {
    /// Creates a bus with the given capacities.
    #[must_use]
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            subscribers: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
            history: Mutex::new(VecDeque::with_capacity(config.history_capacity)),
            config,
        }
    }

    /// Publishes an event to history and all matching subscribers.
    pub fn publish(&self, event: RuntimeEvent) {
        {
            let mut history = self.history.lock();
            if history.len() >= self.config.history_capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        for entry in self.subscribers.iter() {
            if entry.scope.matches(&event) {
                entry.queue.push(event.clone());
            }
        }
    }

    /// Subscribes with a scope filter.
    pub fn subscribe(&self, scope: EventScope) -> EventSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(BoundedQueue::new(
            self.config.subscriber_queue_depth,
            DropPolicy::DropOldest,
        ));
        self.subscribers.insert(
            id,
            Subscriber {
                scope,
                queue: Arc::clone(&queue),
            },
        );
        EventSubscription {
            id,
            queue,
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    /// Returns up to `limit` most recent events, newest last.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<RuntimeEvent> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// Emitter implementation backed by the bus.
///
/// The runtime's counterpart to a broadcast bridge: services emit through
/// [`EventEmitter`] and observers read from the bus.
pub struct BusEmitter {
    bus: Arc<EventBus>,
}

impl BusEmitter {
    #[must_use]
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

impl EventEmitter for BusEmitter {
    fn emit(&self, event: RuntimeEvent) {
        self.bus.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_started(workflow: &str, node: &str) -> RuntimeEvent {
        RuntimeEvent::NodeStarted {
            workflow_id: workflow.to_string(),
            node_id: node.to_string(),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn scoped_subscriber_sees_only_its_workflow() {
        let bus = EventBus::new(EventBusConfig::default());
        let sub = bus.subscribe(EventScope::workflow("wf-a"));

        bus.publish(node_started("wf-a", "n1"));
        bus.publish(node_started("wf-b", "n1"));

        let event = sub.recv().await.unwrap();
        assert_eq!(event.workflow_id(), Some("wf-a"));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn node_scope_narrows_further() {
        let bus = EventBus::new(EventBusConfig::default());
        let sub = bus.subscribe(EventScope::node("wf", "n2"));

        bus.publish(node_started("wf", "n1"));
        bus.publish(node_started("wf", "n2"));

        assert_eq!(sub.recv().await.unwrap().node_id(), Some("n2"));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn slow_subscriber_loses_oldest_and_counts_drops() {
        let bus = EventBus::new(EventBusConfig {
            history_capacity: 10,
            subscriber_queue_depth: 2,
        });
        let sub = bus.subscribe(EventScope::all());

        for i in 0..4 {
            bus.publish(node_started("wf", &format!("n{i}")));
        }

        assert_eq!(sub.dropped(), 2);
        assert_eq!(sub.try_recv().unwrap().node_id(), Some("n2"));
    }

    #[test]
    fn history_is_bounded() {
        let bus = EventBus::new(EventBusConfig {
            history_capacity: 3,
            subscriber_queue_depth: 8,
        });
        for i in 0..5 {
            bus.publish(node_started("wf", &format!("n{i}")));
        }
        let recent = bus.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].node_id(), Some("n2"));
    }

    #[test]
    fn dropped_subscription_detaches() {
        let bus = EventBus::new(EventBusConfig::default());
        {
            let _sub = bus.subscribe(EventScope::all());
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }
}
