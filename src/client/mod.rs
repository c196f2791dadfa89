//! # Application Client Handles
//!
//! A [`ClientHandle`] is what an application gets back when it registers with
//! the router. It publishes and subscribes on the application's logical
//! topics and delivers inbound traffic to the application's listeners.
//!
//! ```text
//!   app ──publish("st/1")──► ClientHandle ──"ACC/<client>/<app>/st/1"──► Transport
//!   app ◄──listeners─────── ClientHandle ◄──────── MessageRouter (fan-out)
//! ```
//!
//! Releasing a handle removes it from the router but leaves its subscriptions
//! in place; unsubscribing is the application's job.

pub mod listener;

pub use listener::{
    CloudClientListener, CloudConnectionListener, CloudSubscriberListener, ListenerSet,
};

use crate::error::CloudError;
use crate::payload::Payload;
use crate::router::{CloudContext, MessageRouter};
use crate::transport::{MessageId, Qos};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Priority used when the caller does not pick one
pub const DEFAULT_PRIORITY: u8 = 5;

/// Per-application publish/subscribe handle
pub struct ClientHandle {
    application_id: String,
    context: Arc<CloudContext>,
    router: Weak<MessageRouter>,
    listeners: ListenerSet<dyn CloudClientListener>,
    released: AtomicBool,
}

impl ClientHandle {
    pub(crate) fn new(
        application_id: impl Into<String>,
        context: Arc<CloudContext>,
        router: Weak<MessageRouter>,
    ) -> Self {
        Self {
            application_id: application_id.into(),
            context,
            router,
            listeners: ListenerSet::new(),
            released: AtomicBool::new(false),
        }
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    pub fn is_connected(&self) -> bool {
        self.context.transport.is_connected()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Publishes `payload` on this application's data topic
    pub async fn publish(
        &self,
        app_topic: &str,
        payload: &Payload,
        qos: Qos,
        retain: bool,
        priority: Option<u8>,
    ) -> Result<MessageId, CloudError> {
        let bytes = self.context.codec.encode(payload)?;
        self.publish_bytes(app_topic, bytes, qos, retain, priority)
            .await
    }

    /// Publishes already encoded bytes on this application's data topic
    pub async fn publish_bytes(
        &self,
        app_topic: &str,
        bytes: Vec<u8>,
        qos: Qos,
        retain: bool,
        priority: Option<u8>,
    ) -> Result<MessageId, CloudError> {
        let topic = self.data_topic(app_topic);
        self.send(&topic, bytes, qos, retain, priority).await
    }

    /// Publishes on the control topic of `device_id`
    pub async fn control_publish(
        &self,
        device_id: &str,
        app_topic: &str,
        payload: &Payload,
        qos: Qos,
        retain: bool,
        priority: Option<u8>,
    ) -> Result<MessageId, CloudError> {
        let bytes = self.context.codec.encode(payload)?;
        let topic = self
            .context
            .topics
            .encode(&self.application_id, device_id, app_topic, true);
        self.send(&topic, bytes, qos, retain, priority).await
    }

    pub async fn subscribe(&self, app_topic: &str, qos: Qos) -> Result<(), CloudError> {
        self.ensure_active()?;
        let topic = self.data_topic(app_topic);
        debug!("[{}] subscribing to {}", self.application_id, topic);
        self.context.transport.subscribe(&topic, qos).await?;
        Ok(())
    }

    pub async fn unsubscribe(&self, app_topic: &str) -> Result<(), CloudError> {
        self.ensure_active()?;
        let topic = self.data_topic(app_topic);
        self.context.transport.unsubscribe(&topic).await?;
        Ok(())
    }

    pub async fn control_subscribe(&self, app_topic: &str, qos: Qos) -> Result<(), CloudError> {
        self.ensure_active()?;
        let topic = self.control_topic(app_topic);
        debug!("[{}] subscribing to {}", self.application_id, topic);
        self.context.transport.subscribe(&topic, qos).await?;
        Ok(())
    }

    pub async fn control_unsubscribe(&self, app_topic: &str) -> Result<(), CloudError> {
        self.ensure_active()?;
        let topic = self.control_topic(app_topic);
        self.context.transport.unsubscribe(&topic).await?;
        Ok(())
    }

    pub fn add_listener(&self, listener: Arc<dyn CloudClientListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn CloudClientListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Detaches the handle from the router.
    ///
    /// Subscriptions made through this handle stay active.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Releasing client handle for {}", self.application_id);
        if let Some(router) = self.router.upgrade() {
            router.remove_client(&self.application_id);
        }
    }

    fn data_topic(&self, app_topic: &str) -> String {
        self.context.topics.encode(
            &self.application_id,
            self.context.client_id(),
            app_topic,
            false,
        )
    }

    fn control_topic(&self, app_topic: &str) -> String {
        self.context.topics.encode(
            &self.application_id,
            self.context.client_id(),
            app_topic,
            true,
        )
    }

    fn ensure_active(&self) -> Result<(), CloudError> {
        if self.is_released() {
            return Err(CloudError::Released(self.application_id.clone()));
        }
        Ok(())
    }

    async fn send(
        &self,
        topic: &str,
        bytes: Vec<u8>,
        qos: Qos,
        retain: bool,
        priority: Option<u8>,
    ) -> Result<MessageId, CloudError> {
        self.ensure_active()?;
        let priority = priority.unwrap_or(DEFAULT_PRIORITY);
        let id = self
            .context
            .transport
            .publish(topic, bytes, qos, retain, priority)
            .await?;
        debug!("[{}] published #{} on {}", self.application_id, id, topic);
        Ok(id)
    }

    pub(crate) fn notify_message_arrived(
        &self,
        device_id: &str,
        app_topic: &str,
        payload: &Payload,
        qos: Qos,
        retain: bool,
        control: bool,
    ) {
        if control {
            self.listeners.notify("control message arrived", |l| {
                l.on_control_message_arrived(device_id, app_topic, payload, qos, retain)
            });
        } else {
            self.listeners.notify("message arrived", |l| {
                l.on_message_arrived(device_id, app_topic, payload, qos, retain)
            });
        }
    }

    pub(crate) fn notify_connection_established(&self) {
        self.listeners
            .notify("connection established", |l| l.on_connection_established());
    }

    pub(crate) fn notify_connection_lost(&self) {
        self.listeners
            .notify("connection lost", |l| l.on_connection_lost());
    }

    pub(crate) fn notify_message_published(&self, message_id: MessageId, app_topic: &str) {
        self.listeners.notify("message published", |l| {
            l.on_message_published(message_id, app_topic)
        });
    }

    pub(crate) fn notify_message_confirmed(&self, message_id: MessageId, app_topic: &str) {
        self.listeners.notify("message confirmed", |l| {
            l.on_message_confirmed(message_id, app_topic)
        });
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("application_id", &self.application_id)
            .field("listeners", &self.listeners.len())
            .field("released", &self.is_released())
            .finish()
    }
}
