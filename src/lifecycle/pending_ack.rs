//! Single-slot acknowledgment tracker for lifecycle publishes
//!
//! ```text
//!   Idle ──begin──► Publishing ──arm(id)──► Waiting(id) ──ack(id)──► Idle
//!                      │   ▲                     │
//!                      │   └ early ack buffered  └── timeout ──► Idle
//!                      └── arm(id) with buffered id ──► Idle (already acked)
//! ```
//!
//! The transport may report a publish before `publish()` even returns its id,
//! so acknowledgments seen while publishing are buffered and checked on arm.

use crate::transport::MessageId;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Which transport callback releases the waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckEvent {
    /// Accepted by the transport (QoS 0)
    Published,
    /// Confirmed by the broker (QoS 1 and 2)
    Confirmed,
}

#[derive(Debug)]
enum Slot {
    Idle,
    Publishing {
        topic: String,
        release_on: AckEvent,
        early: Vec<MessageId>,
    },
    Waiting {
        id: MessageId,
        topic: String,
        release_on: AckEvent,
        done: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
pub struct PendingAck {
    slot: Mutex<Slot>,
    gate: tokio::sync::Mutex<()>,
}

impl Default for PendingAck {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingAck {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Idle),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Serializes lifecycle publishes; hold the guard across publish and wait
    pub async fn serialize(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    /// Resets the slot before a publish on `topic`
    pub fn begin(&self, topic: &str, release_on: AckEvent) {
        *self.slot.lock() = Slot::Publishing {
            topic: topic.to_string(),
            release_on,
            early: Vec::new(),
        };
    }

    /// Arms the slot with the id returned by the transport.
    ///
    /// Returns `None` when the acknowledgment already arrived.
    pub fn arm(&self, id: MessageId) -> Option<oneshot::Receiver<()>> {
        let mut slot = self.slot.lock();
        let (topic, release_on) = match std::mem::replace(&mut *slot, Slot::Idle) {
            Slot::Publishing {
                topic,
                release_on,
                early,
            } => {
                if early.contains(&id) {
                    return None;
                }
                (topic, release_on)
            }
            _ => (String::new(), AckEvent::Confirmed),
        };
        let (done, rx) = oneshot::channel();
        *slot = Slot::Waiting {
            id,
            topic,
            release_on,
            done,
        };
        Some(rx)
    }

    /// Arms and waits up to `timeout`; returns whether the ack was seen
    pub async fn wait(&self, id: MessageId, timeout: Duration) -> bool {
        let Some(rx) = self.arm(id) else {
            debug!("Lifecycle message #{} acknowledged before wait", id);
            return true;
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => true,
            _ => {
                debug!("No acknowledgment for lifecycle message #{} within {:?}", id, timeout);
                self.reset();
                false
            }
        }
    }

    pub fn reset(&self) {
        *self.slot.lock() = Slot::Idle;
    }

    /// Consumes a transport callback if it belongs to the tracked publish.
    ///
    /// Every callback on the tracked topic or id is consumed, including the
    /// ones that do not release the waiter. A consumed callback must not be
    /// forwarded to applications.
    pub fn try_consume(&self, id: MessageId, topic: &str, event: AckEvent) -> bool {
        let mut slot = self.slot.lock();
        let (consumed, release) = match &mut *slot {
            Slot::Idle => (false, false),
            Slot::Publishing {
                topic: expected,
                release_on,
                early,
            } => {
                if expected.as_str() != topic {
                    return false;
                }
                if *release_on == event {
                    early.push(id);
                }
                (true, false)
            }
            Slot::Waiting {
                id: expected,
                topic: tracked,
                release_on,
                ..
            } => {
                let same_id = *expected == id;
                (
                    same_id || tracked.as_str() == topic,
                    same_id && *release_on == event,
                )
            }
        };
        if release {
            if let Slot::Waiting { done, .. } = std::mem::replace(&mut *slot, Slot::Idle) {
                let _ = done.send(());
            }
        }
        consumed
    }

    pub fn is_idle(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TOPIC: &str = "$EDC/ACC/D1/MQTT/BIRTH";

    #[tokio::test]
    async fn early_ack_satisfies_wait_immediately() {
        let pending = PendingAck::new();
        pending.begin(TOPIC, AckEvent::Published);
        assert!(pending.try_consume(7, TOPIC, AckEvent::Published));

        assert!(pending.wait(7, Duration::from_secs(5)).await);
        assert!(pending.is_idle());
    }

    #[tokio::test]
    async fn confirmation_releases_waiter() {
        let pending = Arc::new(PendingAck::new());
        pending.begin(TOPIC, AckEvent::Confirmed);

        let waiter = {
            let pending = pending.clone();
            tokio::spawn(async move { pending.wait(3, Duration::from_secs(5)).await })
        };
        while !pending.try_consume(3, TOPIC, AckEvent::Confirmed) {
            tokio::task::yield_now().await;
        }

        assert!(waiter.await.expect("join"));
        assert!(pending.is_idle());
    }

    #[tokio::test]
    async fn timeout_is_not_an_error() {
        let pending = PendingAck::new();
        pending.begin(TOPIC, AckEvent::Confirmed);

        assert!(!pending.wait(1, Duration::from_millis(20)).await);
        assert!(pending.is_idle());
    }

    #[test]
    fn unrelated_callbacks_pass_through() {
        let pending = PendingAck::new();
        assert!(!pending.try_consume(1, TOPIC, AckEvent::Published));

        pending.begin(TOPIC, AckEvent::Confirmed);
        assert!(!pending.try_consume(1, "ACC/D1/APP/data", AckEvent::Confirmed));

        let _rx = pending.arm(9).expect("armed");
        assert!(!pending.try_consume(8, "ACC/D1/APP/data", AckEvent::Confirmed));
        assert!(!pending.try_consume(8, "ACC/D1/APP/data", AckEvent::Published));
        assert!(pending.try_consume(9, TOPIC, AckEvent::Confirmed));
        assert!(pending.is_idle());
    }

    #[test]
    fn intermediate_callbacks_are_consumed_without_release() {
        let pending = PendingAck::new();
        pending.begin(TOPIC, AckEvent::Confirmed);
        assert!(pending.try_consume(4, TOPIC, AckEvent::Published));

        let mut rx = pending.arm(4).expect("publish alone does not release");
        assert!(pending.try_consume(4, TOPIC, AckEvent::Published));
        assert!(rx.try_recv().is_err());
        assert!(!pending.is_idle());

        assert!(pending.try_consume(4, TOPIC, AckEvent::Confirmed));
        assert!(rx.try_recv().is_ok());
        assert!(pending.is_idle());
    }

    #[test]
    fn stale_acknowledgment_does_not_release_current_wait() {
        let pending = PendingAck::new();
        pending.begin(TOPIC, AckEvent::Confirmed);
        let mut rx = pending.arm(12).expect("armed");

        assert!(!pending.try_consume(13, "$EDC/ACC/D1/MQTT/APPS", AckEvent::Confirmed));
        assert!(pending.try_consume(11, TOPIC, AckEvent::Confirmed));
        assert!(rx.try_recv().is_err());

        assert!(pending.try_consume(12, TOPIC, AckEvent::Confirmed));
        assert!(rx.try_recv().is_ok());
    }
}
