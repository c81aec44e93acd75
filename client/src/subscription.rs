//! Event subscriptions. Each subscription owns a receiver; dropping the
//! handle unsubscribes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use khanasathi_proto::{EventKind, ServerEvent};
use tokio::sync::mpsc;

/// Which events a subscription receives. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub kinds: Vec<EventKind>,
    pub order_id: Option<String>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn kind(kind: EventKind) -> Self {
        Self {
            kinds: vec![kind],
            order_id: None,
        }
    }

    pub fn for_order(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    pub fn matches(&self, event: &ServerEvent) -> bool {
        let kind_ok = self.kinds.is_empty() || self.kinds.contains(&event.kind());
        let order_ok = match &self.order_id {
            Some(wanted) => event.order_id() == Some(wanted.as_str()),
            None => true,
        };
        kind_ok && order_ok
    }
}

struct Subscriber {
    filter: EventFilter,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

type SubscriberMap = Mutex<HashMap<u64, Subscriber>>;

/// Shared fan-out point for events coming off the socket or the poller.
#[derive(Clone, Default)]
pub struct Subscribers {
    map: Arc<SubscriberMap>,
    next_id: Arc<AtomicU64>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut map) = self.map.lock() {
            map.insert(id, Subscriber { filter, tx });
        }
        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.map),
        }
    }

    /// Hand an event to every matching subscriber. Returns how many got it.
    pub fn dispatch(&self, event: &ServerEvent) -> usize {
        let Ok(mut map) = self.map.lock() else {
            return 0;
        };
        let mut delivered = 0;
        map.retain(|_, sub| {
            if !sub.filter.matches(event) {
                return !sub.tx.is_closed();
            }
            match sub.tx.send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        delivered
    }

    pub fn len(&self) -> usize {
        self.map.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A live subscription. Drop it to unsubscribe.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<ServerEvent>,
    registry: Weak<SubscriberMap>,
}

impl Subscription {
    /// Next matching event; None once the client is gone.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ServerEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(map) = self.registry.upgrade() {
            if let Ok(mut map) = map.lock() {
                map.remove(&self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use khanasathi_proto::OrderStatus;

    use super::*;

    fn status(order_id: &str) -> ServerEvent {
        ServerEvent::OrderStatusUpdate {
            order_id: order_id.into(),
            status: OrderStatus::OnTheWay,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn filters_by_kind_and_order() {
        let subscribers = Subscribers::new();
        let mut everything = subscribers.subscribe(EventFilter::all());
        let mut order_a = subscribers.subscribe(EventFilter::kind(EventKind::OrderStatusUpdate).for_order("a"));
        let mut acks = subscribers.subscribe(EventFilter::kind(EventKind::Ack));

        assert_eq!(subscribers.dispatch(&status("a")), 2);
        assert_eq!(subscribers.dispatch(&status("b")), 1);

        assert!(everything.try_recv().is_some());
        assert!(everything.try_recv().is_some());
        assert_eq!(order_a.try_recv().and_then(|e| e.order_id().map(str::to_string)), Some("a".into()));
        assert!(order_a.try_recv().is_none());
        assert!(acks.try_recv().is_none());
    }

    #[test]
    fn dropping_handle_unsubscribes() {
        let subscribers = Subscribers::new();
        let sub = subscribers.subscribe(EventFilter::all());
        assert_eq!(subscribers.len(), 1);
        drop(sub);
        assert!(subscribers.is_empty());
        assert_eq!(subscribers.dispatch(&status("a")), 0);
    }
}
