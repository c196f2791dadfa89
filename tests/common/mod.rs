#![allow(dead_code)]

use async_trait::async_trait;
use cloudlink::config::CloudOptions;
use cloudlink::error::TransportError;
use cloudlink::lifecycle::ConfiguredDevice;
use cloudlink::router::MessageRouter;
use cloudlink::transport::{MessageId, Qos, Transport, TransportListener};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub id: MessageId,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
    pub priority: u8,
}

/// In-memory transport recording every call
///
/// With `auto_ack` on, each publish is reported as published (and confirmed
/// for QoS > 0) before `publish` returns.
pub struct RecordingTransport {
    listener: OnceLock<Weak<dyn TransportListener>>,
    connected: AtomicBool,
    auto_ack: AtomicBool,
    fail_publish: AtomicBool,
    next_id: AtomicU32,
    pub published: Mutex<Vec<Published>>,
    pub subscribed: Mutex<Vec<(String, Qos)>>,
    pub unsubscribed: Mutex<Vec<String>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listener: OnceLock::new(),
            connected: AtomicBool::new(false),
            auto_ack: AtomicBool::new(true),
            fail_publish: AtomicBool::new(false),
            next_id: AtomicU32::new(1),
            published: Mutex::new(Vec::new()),
            subscribed: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
        })
    }

    pub fn attach(&self, listener: Weak<dyn TransportListener>) {
        let _ = self.listener.set(listener);
    }

    pub fn set_auto_ack(&self, enabled: bool) {
        self.auto_ack.store(enabled, Ordering::SeqCst);
    }

    pub fn set_fail_publish(&self, enabled: bool) {
        self.fail_publish.store(enabled, Ordering::SeqCst);
    }

    pub fn listener(&self) -> Arc<dyn TransportListener> {
        self.listener
            .get()
            .and_then(Weak::upgrade)
            .expect("listener attached")
    }

    /// Simulates a broker-side drop
    pub fn drop_connection(&self, cause: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.listener().on_connection_lost(cause);
    }

    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        self.listener()
            .on_message_arrived(topic, payload, Qos::AtMostOnce, false);
    }

    pub fn published_on(&self, topic: &str) -> Vec<Published> {
        self.published
            .lock()
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    pub fn published_topics(&self) -> Vec<String> {
        self.published.lock().iter().map(|p| p.topic.clone()).collect()
    }

    pub fn clear(&self) {
        self.published.lock().clear();
        self.subscribed.lock().clear();
        self.unsubscribed.lock().clear();
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connected.store(true, Ordering::SeqCst);
        self.listener().on_connection_established().await;
        Ok(())
    }

    async fn disconnect(&self, _timeout: Duration) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Ok(());
        }
        let listener = self.listener();
        listener.on_disconnecting().await;
        self.connected.store(false, Ordering::SeqCst);
        listener.on_disconnected();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
        priority: u8,
    ) -> Result<MessageId, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: "rejected".to_string(),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.published.lock().push(Published {
            id,
            topic: topic.to_string(),
            payload,
            qos,
            retain,
            priority,
        });
        if self.auto_ack.load(Ordering::SeqCst) {
            let listener = self.listener();
            listener.on_message_published(id, topic);
            if qos.is_confirmed() {
                listener.on_message_confirmed(id, topic);
            }
        }
        Ok(id)
    }

    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.subscribed.lock().push((topic.to_string(), qos));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.unsubscribed.lock().push(topic.to_string());
        Ok(())
    }
}

pub fn options() -> CloudOptions {
    let mut options = CloudOptions::default();
    options.topic.account_name = "ACC".to_string();
    options.topic.client_id = "D1".to_string();
    options.device.display_name = "Test Gateway".to_string();
    options.lifecycle.ack_timeout_ms = 50;
    options
}

/// Router wired to a fresh recording transport
pub fn router_with(options: CloudOptions) -> (Arc<MessageRouter>, Arc<RecordingTransport>) {
    let transport = RecordingTransport::new();
    let device = Arc::new(ConfiguredDevice::new(options.device.clone()));
    let router = MessageRouter::new(options, transport.clone(), device);
    let listener: Weak<dyn TransportListener> = Arc::<MessageRouter>::downgrade(&router);
    transport.attach(listener);
    (router, transport)
}

/// Polls `condition` until it holds or two seconds pass
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
