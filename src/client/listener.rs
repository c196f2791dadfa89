//! Listener traits and the copy-on-write set that fans events out to them
//!
//! Every notification walks a snapshot of the set, so listeners may be added
//! or removed concurrently (even from inside a callback). A panicking
//! listener is logged and skipped; the remaining listeners are still called.

use crate::payload::Payload;
use crate::topic::ApplicationTopic;
use crate::transport::{MessageId, Qos};
use arc_swap::ArcSwap;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// Receives the traffic of one application
///
/// All methods default to no-ops so implementors pick what they need.
pub trait CloudClientListener: Send + Sync {
    fn on_control_message_arrived(
        &self,
        _device_id: &str,
        _app_topic: &str,
        _payload: &Payload,
        _qos: Qos,
        _retain: bool,
    ) {
    }

    fn on_message_arrived(
        &self,
        _device_id: &str,
        _app_topic: &str,
        _payload: &Payload,
        _qos: Qos,
        _retain: bool,
    ) {
    }

    fn on_connection_lost(&self) {}

    fn on_connection_established(&self) {}

    fn on_message_confirmed(&self, _message_id: MessageId, _app_topic: &str) {}

    fn on_message_published(&self, _message_id: MessageId, _app_topic: &str) {}
}

/// Observes the connection itself rather than any one application
pub trait CloudConnectionListener: Send + Sync {
    fn on_connection_established(&self) {}

    fn on_disconnected(&self) {}

    fn on_connection_lost(&self) {}
}

/// Ad-hoc subscriber registered for a topic filter
pub trait CloudSubscriberListener: Send + Sync {
    fn on_message_arrived(&self, topic: &ApplicationTopic, payload: &Payload);
}

/// Copy-on-write listener collection
pub struct ListenerSet<L: ?Sized> {
    inner: ArcSwap<Vec<Arc<L>>>,
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized> ListenerSet<L> {
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn add(&self, listener: Arc<L>) {
        self.inner.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(listener.clone());
            next
        });
    }

    /// Removes by identity; returns whether the listener was present
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let previous = self.inner.rcu(|current| {
            current
                .iter()
                .filter(|l| !Arc::ptr_eq(l, listener))
                .cloned()
                .collect::<Vec<_>>()
        });
        previous.iter().any(|l| Arc::ptr_eq(l, listener))
    }

    /// Removes every listener matching `predicate`
    pub fn remove_where(&self, predicate: impl Fn(&L) -> bool) -> usize {
        let previous = self.inner.rcu(|current| {
            current
                .iter()
                .filter(|l| !predicate(l))
                .cloned()
                .collect::<Vec<_>>()
        });
        previous.iter().filter(|l| predicate(l)).count()
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<L>>> {
        self.inner.load_full()
    }

    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.load().is_empty()
    }

    /// Calls `f` for every listener, isolating panics per listener
    pub fn notify(&self, event: &str, f: impl Fn(&L)) {
        for listener in self.snapshot().iter() {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| f(listener))) {
                error!(
                    "Listener failed while handling {}: {}",
                    event,
                    panic_message(&*panic)
                );
            }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Weak;

    #[derive(Default)]
    struct Counting {
        established: AtomicUsize,
    }

    impl CloudConnectionListener for Counting {
        fn on_connection_established(&self) {
            self.established.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Swaps `victim` for a newcomer the first time it is notified
    struct Rewiring {
        set: Weak<ListenerSet<dyn CloudConnectionListener>>,
        victim: Arc<dyn CloudConnectionListener>,
        newcomer: Mutex<Option<Arc<Counting>>>,
    }

    impl CloudConnectionListener for Rewiring {
        fn on_connection_established(&self) {
            let mut newcomer = self.newcomer.lock();
            if newcomer.is_some() {
                return;
            }
            let Some(set) = self.set.upgrade() else {
                return;
            };
            set.remove(&self.victim);
            let added = Arc::new(Counting::default());
            set.add(added.clone());
            *newcomer = Some(added);
        }
    }

    struct Exploding;

    impl CloudConnectionListener for Exploding {
        fn on_connection_established(&self) {
            panic!("boom");
        }
    }

    #[test]
    fn panicking_listener_does_not_stop_fan_out() {
        let set: ListenerSet<dyn CloudConnectionListener> = ListenerSet::new();
        let first = Arc::new(Counting::default());
        let second = Arc::new(Counting::default());
        set.add(first.clone());
        set.add(Arc::new(Exploding));
        set.add(second.clone());

        set.notify("connection established", |l| l.on_connection_established());

        assert_eq!(first.established.load(Ordering::SeqCst), 1);
        assert_eq!(second.established.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_by_identity() {
        let set: ListenerSet<dyn CloudConnectionListener> = ListenerSet::new();
        let a: Arc<dyn CloudConnectionListener> = Arc::new(Counting::default());
        let b: Arc<dyn CloudConnectionListener> = Arc::new(Counting::default());
        set.add(a.clone());
        set.add(b.clone());

        assert!(set.remove(&a));
        assert!(!set.remove(&a));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn snapshot_is_stable_while_mutating() {
        let set: ListenerSet<dyn CloudConnectionListener> = ListenerSet::new();
        let a: Arc<dyn CloudConnectionListener> = Arc::new(Counting::default());
        set.add(a.clone());

        let snapshot = set.snapshot();
        set.remove(&a);
        set.add(Arc::new(Counting::default()));
        set.add(Arc::new(Counting::default()));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn mutation_inside_a_callback_keeps_the_current_round() {
        let set: Arc<ListenerSet<dyn CloudConnectionListener>> = Arc::new(ListenerSet::new());
        let before = Arc::new(Counting::default());
        let victim = Arc::new(Counting::default());
        let victim_handle: Arc<dyn CloudConnectionListener> = victim.clone();
        let rewiring = Arc::new(Rewiring {
            set: Arc::downgrade(&set),
            victim: victim_handle.clone(),
            newcomer: Mutex::new(None),
        });
        set.add(rewiring.clone());
        set.add(before.clone());
        set.add(victim_handle);

        set.notify("connection established", |l| l.on_connection_established());

        assert_eq!(before.established.load(Ordering::SeqCst), 1);
        assert_eq!(victim.established.load(Ordering::SeqCst), 1);
        let newcomer = rewiring.newcomer.lock().clone().expect("newcomer added");
        assert_eq!(newcomer.established.load(Ordering::SeqCst), 0);
        assert_eq!(set.len(), 3);

        set.notify("connection established", |l| l.on_connection_established());

        assert_eq!(before.established.load(Ordering::SeqCst), 2);
        assert_eq!(victim.established.load(Ordering::SeqCst), 1);
        assert_eq!(newcomer.established.load(Ordering::SeqCst), 1);
    }
}
