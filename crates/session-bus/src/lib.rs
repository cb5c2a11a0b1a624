use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::trace;

/// Separator between a base topic and the entity id of a scoped channel.
pub const SCOPE_SEPARATOR: &str = "::";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage<P> {
    pub topic: String,
    pub payload: P,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
}

pub type BusResult<T> = Result<T, BusError>;

/// Callback invoked for every message on a subscribed topic. The handler gets
/// its own [`Subscription`] so it can cancel itself mid-dispatch.
pub type Handler<P> = Arc<dyn Fn(&BusMessage<P>, &Subscription) + Send + Sync>;

/// Wraps a closure into a [`Handler`].
pub fn handler<P, F>(f: F) -> Handler<P>
where
    F: Fn(&BusMessage<P>, &Subscription) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Builds the per-entity channel name for `base`, e.g. `contact.connected::c1`.
pub fn scoped_topic(base: &str, entity_id: &str) -> String {
    format!("{base}{SCOPE_SEPARATOR}{entity_id}")
}

/// Returns the entity id a scoped topic is bound to, if any.
pub fn topic_scope(topic: &str) -> Option<&str> {
    topic
        .rsplit_once(SCOPE_SEPARATOR)
        .map(|(_, scope)| scope)
        .filter(|scope| !scope.is_empty())
}

pub trait Bus<P>: Send + Sync {
    fn subscribe(&self, topic: &str, handler: Handler<P>) -> Subscription;
    /// Subscribes to every topic. Wildcard handlers fire after topic handlers.
    fn subscribe_all(&self, handler: Handler<P>) -> Subscription;
    /// Returns the number of handlers invoked.
    fn publish(&self, topic: &str, payload: P) -> BusResult<usize>;
    fn unsubscribe_topic(&self, topic: &str);
    /// Drops every scoped channel bound to `entity_id`.
    fn unsubscribe_scope(&self, entity_id: &str);
}

/// Removes a subscription from whatever registry issued it.
pub trait Detach: Send + Sync {
    fn detach(&self, id: u64, topic: Option<&str>);
}

/// Cancel handle for a bus registration. Cloning shares the handle.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

struct SubscriptionInner {
    id: u64,
    topic: Option<String>,
    active: AtomicBool,
    registry: Weak<dyn Detach>,
}

impl Subscription {
    pub fn new(id: u64, topic: Option<String>, registry: Weak<dyn Detach>) -> Self {
        Self {
            inner: Arc::new(SubscriptionInner {
                id,
                topic,
                active: AtomicBool::new(true),
                registry,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// `None` for wildcard subscriptions.
    pub fn topic(&self) -> Option<&str> {
        self.inner.topic.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Stops delivery. Safe from inside the handler being dispatched; repeated
    /// calls are no-ops.
    pub fn cancel(&self) {
        if !self.inner.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.inner.registry.upgrade() {
            registry.detach(self.inner.id, self.inner.topic.as_deref());
        }
    }

    fn deactivate(&self) {
        self.inner.active.store(false, Ordering::Release);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("topic", &self.inner.topic)
            .field("active", &self.is_active())
            .finish()
    }
}

struct Registration<P> {
    subscription: Subscription,
    handler: Handler<P>,
}

impl<P> Clone for Registration<P> {
    fn clone(&self) -> Self {
        Self {
            subscription: self.subscription.clone(),
            handler: Arc::clone(&self.handler),
        }
    }
}

struct BusInner<P> {
    next_id: AtomicU64,
    closed: AtomicBool,
    topics: RwLock<HashMap<String, Vec<Registration<P>>>>,
    wildcard: RwLock<Vec<Registration<P>>>,
}

impl<P: 'static> Detach for BusInner<P> {
    fn detach(&self, id: u64, topic: Option<&str>) {
        match topic {
            Some(topic) => {
                let mut guard = self.topics.write();
                if let Some(list) = guard.get_mut(topic) {
                    list.retain(|reg| reg.subscription.id() != id);
                    if list.is_empty() {
                        guard.remove(topic);
                    }
                }
            }
            None => self
                .wildcard
                .write()
                .retain(|reg| reg.subscription.id() != id),
        }
    }
}

/// In-memory bus. Handlers run synchronously on the publishing thread, in
/// registration order; no lock is held while a handler runs.
pub struct LocalBus<P> {
    inner: Arc<BusInner<P>>,
}

impl<P> Clone for LocalBus<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: 'static> Default for LocalBus<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> fmt::Debug for LocalBus<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBus")
            .field("topics", &self.inner.topics.read().len())
            .field("wildcard", &self.inner.wildcard.read().len())
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl<P: 'static> LocalBus<P> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                topics: RwLock::new(HashMap::new()),
                wildcard: RwLock::new(Vec::new()),
            }),
        }
    }

    fn registration(&self, topic: Option<&str>, handler: Handler<P>) -> Registration<P> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let registry: Weak<BusInner<P>> = Arc::downgrade(&self.inner);
        let registry: Weak<dyn Detach> = registry;
        Registration {
            subscription: Subscription::new(id, topic.map(str::to_string), registry),
            handler,
        }
    }

    /// Number of live handlers on `topic`, excluding wildcard subscribers.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Topics that currently have at least one handler.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.inner.topics.read().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Cancels every registration; later publishes fail with [`BusError::Closed`].
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let topics = std::mem::take(&mut *self.inner.topics.write());
        let wildcard = std::mem::take(&mut *self.inner.wildcard.write());
        for reg in topics.into_values().flatten().chain(wildcard) {
            reg.subscription.deactivate();
        }
    }
}

impl<P: Send + Sync + 'static> Bus<P> for LocalBus<P> {
    fn subscribe(&self, topic: &str, handler: Handler<P>) -> Subscription {
        let reg = self.registration(Some(topic), handler);
        let subscription = reg.subscription.clone();
        if self.inner.closed.load(Ordering::Acquire) {
            subscription.deactivate();
            return subscription;
        }
        self.inner
            .topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(reg);
        subscription
    }

    fn subscribe_all(&self, handler: Handler<P>) -> Subscription {
        let reg = self.registration(None, handler);
        let subscription = reg.subscription.clone();
        if self.inner.closed.load(Ordering::Acquire) {
            subscription.deactivate();
            return subscription;
        }
        self.inner.wildcard.write().push(reg);
        subscription
    }

    fn publish(&self, topic: &str, payload: P) -> BusResult<usize> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        let targets: Vec<Registration<P>> = {
            let topics = self.inner.topics.read();
            let wildcard = self.inner.wildcard.read();
            topics
                .get(topic)
                .into_iter()
                .flatten()
                .chain(wildcard.iter())
                .cloned()
                .collect()
        };
        let message = BusMessage {
            topic: topic.to_string(),
            payload,
        };
        let mut delivered = 0usize;
        for reg in targets {
            // a handler earlier in this dispatch may have cancelled this one
            if !reg.subscription.is_active() {
                continue;
            }
            (reg.handler)(&message, &reg.subscription);
            delivered += 1;
        }
        trace!(target = "session.bus", topic, delivered, "published");
        Ok(delivered)
    }

    fn unsubscribe_topic(&self, topic: &str) {
        let removed = self.inner.topics.write().remove(topic);
        for reg in removed.into_iter().flatten() {
            reg.subscription.deactivate();
        }
    }

    fn unsubscribe_scope(&self, entity_id: &str) {
        let removed: Vec<Registration<P>> = {
            let mut guard = self.inner.topics.write();
            let scoped: Vec<String> = guard
                .keys()
                .filter(|topic| topic_scope(topic) == Some(entity_id))
                .cloned()
                .collect();
            scoped
                .iter()
                .filter_map(|topic| guard.remove(topic))
                .flatten()
                .collect()
        };
        for reg in &removed {
            reg.subscription.deactivate();
        }
        trace!(
            target = "session.bus",
            entity_id,
            removed = removed.len(),
            "dropped scoped channels"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Handler<u32>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let make = move |label: &str| {
            let log = Arc::clone(&log);
            let label = label.to_string();
            handler(move |msg: &BusMessage<u32>, _sub: &Subscription| {
                log.lock().push(format!("{label}:{}:{}", msg.topic, msg.payload));
            })
        };
        (seen, make)
    }

    #[test]
    fn local_bus_round_trip() {
        let bus = LocalBus::new();
        let (seen, make) = recorder();
        bus.subscribe("agent.refresh", make("a"));
        let delivered = bus.publish("agent.refresh", 7).expect("publish ok");
        assert_eq!(delivered, 1);
        assert_eq!(*seen.lock(), vec!["a:agent.refresh:7".to_string()]);
    }

    #[test]
    fn handlers_fire_in_registration_order_then_wildcard() {
        let bus = LocalBus::new();
        let (seen, make) = recorder();
        bus.subscribe_all(make("all"));
        bus.subscribe("t", make("first"));
        bus.subscribe("t", make("second"));
        bus.publish("t", 1).unwrap();
        assert_eq!(
            *seen.lock(),
            vec!["first:t:1", "second:t:1", "all:t:1"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn handler_can_cancel_itself_during_dispatch() {
        let bus = LocalBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        let sub = bus.subscribe(
            "liveness.ack",
            handler(move |_msg: &BusMessage<u32>, sub: &Subscription| {
                sub.cancel();
                sub.cancel();
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        bus.publish("liveness.ack", 1).unwrap();
        bus.publish("liveness.ack", 2).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!sub.is_active());
        assert_eq!(bus.subscriber_count("liveness.ack"), 0);
        sub.cancel();
    }

    #[test]
    fn cancel_from_sibling_handler_skips_pending_delivery() {
        let bus: LocalBus<u32> = LocalBus::new();
        let (seen, make) = recorder();
        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&victim);
        bus.subscribe(
            "t",
            handler(move |_msg: &BusMessage<u32>, _sub: &Subscription| {
                if let Some(sub) = slot.lock().take() {
                    sub.cancel();
                }
            }),
        );
        let sub = bus.subscribe("t", make("victim"));
        *victim.lock() = Some(sub);
        assert_eq!(bus.publish("t", 1).unwrap(), 1);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn unsubscribe_scope_only_drops_matching_entity() {
        let bus = LocalBus::new();
        let (seen, make) = recorder();
        let c1 = scoped_topic("contact.connected", "c1");
        let c1_refresh = scoped_topic("contact.refresh", "c1");
        let c2 = scoped_topic("contact.connected", "c2");
        let held = bus.subscribe(&c1, make("c1"));
        bus.subscribe(&c1_refresh, make("c1r"));
        bus.subscribe(&c2, make("c2"));
        bus.subscribe("contact.connected", make("broadcast"));

        bus.unsubscribe_scope("c1");

        assert!(!held.is_active());
        assert_eq!(bus.publish(&c1, 1).unwrap(), 0);
        assert_eq!(bus.publish(&c1_refresh, 1).unwrap(), 0);
        assert_eq!(bus.publish(&c2, 2).unwrap(), 1);
        assert_eq!(bus.publish("contact.connected", 3).unwrap(), 1);
        assert_eq!(
            *seen.lock(),
            vec!["c2:contact.connected::c2:2", "broadcast:contact.connected:3"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn topic_scope_parses_suffix() {
        assert_eq!(topic_scope("contact.ended::abc"), Some("abc"));
        assert_eq!(topic_scope("contact.ended"), None);
        assert_eq!(topic_scope("contact.ended::"), None);
    }

    #[test]
    fn closed_bus_rejects_publish() {
        let bus = LocalBus::new();
        let (_seen, make) = recorder();
        let sub = bus.subscribe("t", make("x"));
        bus.close();
        assert!(!sub.is_active());
        assert!(matches!(bus.publish("t", 1), Err(BusError::Closed)));
        let late = bus.subscribe("t", make("late"));
        assert!(!late.is_active());
    }
}
