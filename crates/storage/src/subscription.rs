use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::StreamError;
use crate::traits::{ChangeEvent, ChangeKind, Delivery, EventSink, StreamKey};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Subscribed,
    Unsubscribed,
}

struct Subscriber {
    id: SubscriptionId,
    key: StreamKey,
    sink: EventSink,
}

struct RegistryInner {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

/// Live subscribers of one store. Publishing happens while the store still
/// holds its write lock, so per-row delivery order equals commit order.
pub struct SubscriberRegistry {
    inner: Mutex<RegistryInner>,
}

impl SubscriberRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RegistryInner {
                next_id: 1,
                subscribers: Vec::new(),
            }),
        })
    }

    pub fn register(self: &Arc<Self>, key: StreamKey, sink: EventSink) -> Subscription {
        let mut inner = self.inner.lock();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        debug!(stream = %key, subscription = %id, "stream subscribed");
        inner.subscribers.push(Subscriber {
            id,
            key: key.clone(),
            sink,
        });
        Subscription {
            id,
            key,
            registry: Arc::downgrade(self),
            active: AtomicBool::new(true),
        }
    }

    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| s.id != id);
        before != inner.subscribers.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fan a committed change out to every subscriber whose stream matches.
    /// Subscribers whose receiving side is gone are pruned.
    pub fn publish(&self, event: &ChangeEvent) {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|sub| {
            if sub.key.table != event.table || !stream_matches(&sub.key, event) {
                return true;
            }
            let delivery = Delivery {
                subscription: sub.id,
                event: Ok(event.clone()),
            };
            sub.sink.send(delivery).is_ok()
        });
    }

    /// Terminate every stream with `error`. Each subscriber gets the error
    /// once and is then removed.
    pub fn fail_all(&self, error: StreamError) {
        let mut inner = self.inner.lock();
        for sub in inner.subscribers.drain(..) {
            warn!(stream = %sub.key, subscription = %sub.id, error = %error, "terminating stream");
            let _ = sub.sink.send(Delivery {
                subscription: sub.id,
                event: Err(error.clone()),
            });
        }
    }
}

fn stream_matches(key: &StreamKey, event: &ChangeEvent) -> bool {
    let matches = |row: &Option<reliefsync_core::Row>| row.as_ref().is_some_and(|r| key.filter.matches(r));
    match event.kind {
        ChangeKind::Insert => matches(&event.new),
        // A row that moved out of scope still reaches the stream so the
        // consumer can drop it.
        ChangeKind::Update => matches(&event.new) || matches(&event.old),
        ChangeKind::Delete => matches(&event.old),
    }
}

/// Handle for one live stream. Unsubscribing is idempotent and also happens
/// on drop.
pub struct Subscription {
    id: SubscriptionId,
    key: StreamKey,
    registry: Weak<SubscriberRegistry>,
    active: AtomicBool,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn state(&self) -> SubscriptionState {
        if self.active.load(Ordering::Acquire) {
            SubscriptionState::Subscribed
        } else {
            SubscriptionState::Unsubscribed
        }
    }

    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
        debug!(stream = %self.key, subscription = %self.id, "stream unsubscribed");
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("key", &self.key.to_string())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reliefsync_core::{FieldValue, Filter, Row, RowId, Table};
    use tokio::sync::mpsc;

    fn facility_insert(operation: RowId) -> ChangeEvent {
        let row = Row::with_id(RowId::new())
            .with("operation_id", FieldValue::Ref(operation))
            .with("name", "Shelter");
        ChangeEvent {
            table: Table::Facilities,
            kind: ChangeKind::Insert,
            new: Some(row),
            old: None,
            version: 1,
        }
    }

    #[test]
    fn publish_respects_table_and_filter() {
        let registry = SubscriberRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let op = RowId::new();
        let _scoped = registry.register(
            StreamKey::new(Table::Facilities, Filter::eq_ref("operation_id", op)),
            tx.clone(),
        );
        let _other_table = registry.register(StreamKey::unscoped(Table::Operations), tx);

        registry.publish(&facility_insert(RowId::new()));
        assert!(rx.try_recv().is_err());

        registry.publish(&facility_insert(op));
        let delivery = rx.try_recv().expect("scoped insert delivered");
        assert!(delivery.event.is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_is_idempotent_and_stops_delivery() {
        let registry = SubscriberRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = registry.register(StreamKey::unscoped(Table::Facilities), tx);
        assert_eq!(sub.state(), SubscriptionState::Subscribed);

        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(sub.state(), SubscriptionState::Unsubscribed);
        assert!(registry.is_empty());

        registry.publish(&facility_insert(RowId::new()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropping_the_handle_unsubscribes() {
        let registry = SubscriberRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        {
            let _sub = registry.register(StreamKey::unscoped(Table::Operations), tx);
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn fail_all_reports_once_and_clears() {
        let registry = SubscriberRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = registry.register(StreamKey::unscoped(Table::Operations), tx);
        registry.fail_all(StreamError {
            kind: crate::ErrorKind::Connection,
            message: "offline".into(),
        });
        assert!(rx.try_recv().expect("error delivered").event.is_err());
        assert!(registry.is_empty());
    }
}
