//! # Message Router
//!
//! The router owns the connection lifecycle and every inbound message.
//!
//! ```text
//!                       ┌────────────── MessageRouter ───────────────┐
//!  Transport ──arrive──►│ decode topic ─► decode payload (or opaque)  │
//!                       │     │                                       │
//!                       │     ├─ control ─► verify ─► dispatcher ─────┼─► reply
//!                       │     │                └───► client handles   │
//!                       │     └─ data ───────────► client handles     │
//!                       │ ad-hoc subscribers see both                 │
//!                       └─────────────────────────────────────────────┘
//! ```
//!
//! # Connection State
//!
//! ```text
//! Disconnected ──established──► ConnectedNotAnnounced ──birth──► ConnectedAnnounced
//!      ▲                                 ▲                              │
//!      │                                 └──────── disconnecting ───────┤
//!      └──────────── disconnected / connection lost ────────────────────┘
//! ```

pub mod subscriptions;

pub use subscriptions::{SubscriptionRecord, SubscriptionRegistry};

use crate::client::{
    ClientHandle, CloudConnectionListener, CloudSubscriberListener, ListenerSet,
};
use crate::config::CloudOptions;
use crate::error::CloudError;
use crate::lifecycle::{AckEvent, DeviceInfoProvider, LifecycleAnnouncer, ModemIdentity};
use crate::payload::{codec_for, Payload, PayloadCodec, Position};
use crate::rpc::{RequestDispatcher, RequestHandler};
use crate::topic::{ApplicationTopic, TopicCodec};
use crate::transport::{MessageId, Qos, Transport, TransportListener};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Application id of broker feedback messages, which are never routed
const FEEDBACK_APPLICATION: &str = "BA";

/// Shared, immutable collaborators of one connection
pub struct CloudContext {
    pub(crate) options: CloudOptions,
    pub(crate) topics: TopicCodec,
    pub(crate) codec: Box<dyn PayloadCodec>,
    pub(crate) transport: Arc<dyn Transport>,
}

impl CloudContext {
    pub fn new(options: CloudOptions, transport: Arc<dyn Transport>) -> Self {
        let topics = TopicCodec::from_options(&options.topic);
        let codec = codec_for(options.payload.encoding, options.payload.compress);
        Self {
            options,
            topics,
            codec,
            transport,
        }
    }

    pub fn options(&self) -> &CloudOptions {
        &self.options
    }

    pub fn topics(&self) -> &TopicCodec {
        &self.topics
    }

    pub fn codec(&self) -> &dyn PayloadCodec {
        self.codec.as_ref()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Device id used in every topic this gateway publishes
    pub fn client_id(&self) -> &str {
        &self.options.topic.client_id
    }
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    ConnectedNotAnnounced,
    ConnectedAnnounced,
}

/// Device-side happenings that can trigger a new birth certificate
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    PositionLocked(Position),
    ModemReady(ModemIdentity),
}

/// Authenticates inbound control messages before they are acted on
pub trait MessageVerifier: Send + Sync {
    fn verify(&self, topic: &ApplicationTopic, payload: &Payload) -> Result<(), String>;
}

pub struct MessageRouter {
    context: Arc<CloudContext>,
    me: Weak<MessageRouter>,
    clients: ListenerSet<ClientHandle>,
    connection_listeners: ListenerSet<dyn CloudConnectionListener>,
    subscriptions: SubscriptionRegistry,
    dispatcher: RequestDispatcher,
    announcer: LifecycleAnnouncer,
    verifier: RwLock<Option<Arc<dyn MessageVerifier>>>,
    state: Mutex<ConnectionState>,
    birth_published: AtomicBool,
    default_subscriptions: AtomicBool,
    default_subscription_installed: AtomicBool,
}

impl MessageRouter {
    /// Builds the router; must be called within a tokio runtime
    pub fn new(
        options: CloudOptions,
        transport: Arc<dyn Transport>,
        device: Arc<dyn DeviceInfoProvider>,
    ) -> Arc<Self> {
        let context = Arc::new(CloudContext::new(options, transport));
        info!(
            "Creating message router for {} (encoding {})",
            context.client_id(),
            context.codec.name()
        );
        let default_subscriptions = context.options.enable_default_subscriptions;
        Arc::new_cyclic(|me| Self {
            context: context.clone(),
            me: me.clone(),
            clients: ListenerSet::new(),
            connection_listeners: ListenerSet::new(),
            subscriptions: SubscriptionRegistry::new(),
            dispatcher: RequestDispatcher::new(context.clone()),
            announcer: LifecycleAnnouncer::new(context, device),
            verifier: RwLock::new(None),
            state: Mutex::new(ConnectionState::Disconnected),
            birth_published: AtomicBool::new(false),
            default_subscriptions: AtomicBool::new(default_subscriptions),
            default_subscription_installed: AtomicBool::new(false),
        })
    }

    pub fn context(&self) -> &Arc<CloudContext> {
        &self.context
    }

    pub fn announcer(&self) -> &LifecycleAnnouncer {
        &self.announcer
    }

    pub fn dispatcher(&self) -> &RequestDispatcher {
        &self.dispatcher
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.context.transport.is_connected()
    }

    pub async fn connect(&self) -> Result<(), CloudError> {
        self.context.transport.connect().await?;
        Ok(())
    }

    /// Disconnects through the transport, which calls back into the router
    pub async fn disconnect(&self, timeout: Duration) -> Result<(), CloudError> {
        self.context.transport.disconnect(timeout).await?;
        Ok(())
    }

    /// Takes effect on the next connection
    pub fn set_default_subscriptions(&self, enabled: bool) {
        self.default_subscriptions.store(enabled, Ordering::Release);
    }

    pub fn set_message_verifier(&self, verifier: Option<Arc<dyn MessageVerifier>>) {
        *self.verifier.write() = verifier;
    }

    /// Registers an application and returns its handle.
    ///
    /// Registering an id twice returns the existing handle.
    pub async fn new_client(&self, application_id: &str) -> Arc<ClientHandle> {
        if let Some(existing) = self.client(application_id) {
            debug!("Application {} already registered", application_id);
            return existing;
        }

        let handle = Arc::new(ClientHandle::new(
            application_id,
            self.context.clone(),
            self.me.clone(),
        ));
        self.clients.add(handle.clone());
        info!("Registered application {}", application_id);
        self.republish_app_list().await;
        handle
    }

    pub fn client(&self, application_id: &str) -> Option<Arc<ClientHandle>> {
        self.clients
            .snapshot()
            .iter()
            .find(|client| client.application_id() == application_id)
            .cloned()
    }

    /// Drops the handle registered for `application_id`
    pub(crate) fn remove_client(&self, application_id: &str) {
        let removed = self
            .clients
            .remove_where(|client| client.application_id() == application_id);
        if removed > 0 {
            info!("Removed application {}", application_id);
            self.schedule_app_list();
        }
    }

    /// Sorted ids of every registered application and request handler
    pub fn application_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .clients
            .snapshot()
            .iter()
            .map(|client| client.application_id().to_string())
            .collect();
        ids.extend(self.dispatcher.handler_ids());
        ids.sort();
        ids.dedup();
        ids
    }

    pub async fn register_request_handler(
        &self,
        application_id: &str,
        handler: Arc<dyn RequestHandler>,
    ) {
        self.dispatcher.register_handler(application_id, handler);
        self.republish_app_list().await;
    }

    pub async fn unregister_request_handler(&self, application_id: &str) -> bool {
        let removed = self.dispatcher.unregister_handler(application_id);
        if removed {
            self.republish_app_list().await;
        }
        removed
    }

    /// Subscribes `subscriber` to a topic of `application_id`.
    ///
    /// The subscription is recorded even while disconnected and replayed on
    /// every connection.
    pub async fn register_subscriber(
        &self,
        application_id: &str,
        app_topic: &str,
        qos: Qos,
        control: bool,
        subscriber: Arc<dyn CloudSubscriberListener>,
    ) -> Result<(), CloudError> {
        let full_topic = self.context.topics.encode(
            application_id,
            self.context.client_id(),
            app_topic,
            control,
        );
        self.subscriptions.add(
            application_id,
            SubscriptionRecord {
                full_topic: full_topic.clone(),
                qos,
                subscriber,
            },
        );
        if self.is_connected() {
            self.context.transport.subscribe(&full_topic, qos).await?;
        }
        info!("Registered subscriber for {}", full_topic);
        Ok(())
    }

    /// Removes every subscription of `subscriber`, unsubscribing topics no
    /// other record uses
    pub async fn unregister_subscriber(
        &self,
        subscriber: &Arc<dyn CloudSubscriberListener>,
    ) -> Result<(), CloudError> {
        let removed = self.subscriptions.remove_subscriber(subscriber);
        for record in removed {
            if self.subscriptions.is_topic_in_use(&record.full_topic) || !self.is_connected() {
                continue;
            }
            self.context
                .transport
                .unsubscribe(&record.full_topic)
                .await?;
            info!("Unsubscribed {}", record.full_topic);
        }
        Ok(())
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn CloudConnectionListener>) {
        self.connection_listeners.add(listener);
    }

    pub fn remove_connection_listener(&self, listener: &Arc<dyn CloudConnectionListener>) -> bool {
        self.connection_listeners.remove(listener)
    }

    /// Reacts to device events that change the birth certificate
    pub async fn on_device_event(&self, event: DeviceEvent) {
        let lifecycle = &self.context.options.lifecycle;
        let republish = match event {
            DeviceEvent::PositionLocked(position) => {
                debug!("Position locked");
                self.announcer.set_position(position);
                lifecycle.republish_on_position_lock
            }
            DeviceEvent::ModemReady(identity) => {
                let meaningful = identity.is_meaningful();
                debug!("Modem ready, identity meaningful: {}", meaningful);
                self.announcer.set_modem_identity(identity);
                lifecycle.republish_on_modem_detect && meaningful
            }
        };
        if republish && self.is_connected() {
            self.publish_birth().await;
        }
    }

    /// Stops request dispatch after queued requests complete
    pub async fn shutdown(&self) {
        info!("Shutting down message router");
        self.dispatcher.shutdown().await;
    }

    async fn publish_birth(&self) {
        match self.announcer.publish_birth(&self.application_ids()).await {
            Ok(()) => {
                self.birth_published.store(true, Ordering::Release);
                *self.state.lock() = ConnectionState::ConnectedAnnounced;
            }
            Err(e) => warn!("Failed to publish birth certificate: {}", e),
        }
    }

    async fn republish_app_list(&self) {
        if !self.is_connected() {
            return;
        }
        if let Err(e) = self.announcer.publish_app_list(&self.application_ids()).await {
            warn!("Failed to publish application list: {}", e);
        }
    }

    /// App-list publish from a synchronous caller
    fn schedule_app_list(&self) {
        let Some(router) = self.me.upgrade() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { router.republish_app_list().await });
            }
            Err(_) => debug!("No runtime available, application list not republished"),
        }
    }

    async fn update_default_subscription(&self) {
        let topic = self
            .context
            .topics
            .default_subscription(self.context.client_id());
        if self.default_subscriptions.load(Ordering::Acquire) {
            match self
                .context
                .transport
                .subscribe(&topic, Qos::AtLeastOnce)
                .await
            {
                Ok(()) => {
                    self.default_subscription_installed
                        .store(true, Ordering::Release);
                    info!("Installed default subscription {}", topic);
                }
                Err(e) => warn!("Failed to install default subscription {}: {}", topic, e),
            }
        } else if self
            .default_subscription_installed
            .swap(false, Ordering::AcqRel)
        {
            match self.context.transport.unsubscribe(&topic).await {
                Ok(()) => info!("Removed default subscription {}", topic),
                Err(e) => warn!("Failed to remove default subscription {}: {}", topic, e),
            }
        }
    }

    async fn replay_subscriptions(&self) {
        for record in self.subscriptions.snapshot() {
            if let Err(e) = self
                .context
                .transport
                .subscribe(&record.full_topic, record.qos)
                .await
            {
                warn!("Failed to restore subscription {}: {}", record.full_topic, e);
            }
        }
    }

    fn decode_payload(&self, topic: &str, bytes: &[u8]) -> Payload {
        match self.context.codec.decode(bytes) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Delivering undecodable payload on {} as opaque body: {}", topic, e);
                Payload::opaque(bytes)
            }
        }
    }

    fn deliver_to_subscribers(&self, wire_topic: &str, topic: &ApplicationTopic, payload: &Payload) {
        for subscriber in self.subscriptions.matching(&self.context.topics, wire_topic) {
            if catch_unwind(AssertUnwindSafe(|| {
                subscriber.on_message_arrived(topic, payload)
            }))
            .is_err()
            {
                error!("Subscriber failed while handling message on {}", wire_topic);
            }
        }
    }

    fn notify_clients_lost(&self) {
        self.clients.notify("connection lost", |client| {
            client.notify_connection_lost()
        });
    }
}

#[async_trait]
impl TransportListener for MessageRouter {
    async fn on_connection_established(&self) {
        info!("Connection established");
        *self.state.lock() = ConnectionState::ConnectedNotAnnounced;

        let lifecycle = &self.context.options.lifecycle;
        if !self.birth_published.load(Ordering::Acquire) || lifecycle.republish_on_reconnect() {
            self.publish_birth().await;
        } else {
            debug!("Birth already published, not republishing on reconnect");
            *self.state.lock() = ConnectionState::ConnectedAnnounced;
        }

        self.update_default_subscription().await;
        self.replay_subscriptions().await;

        self.connection_listeners
            .notify("connection established", |l| l.on_connection_established());
        self.clients.notify("connection established", |client| {
            client.notify_connection_established()
        });
    }

    async fn on_disconnecting(&self) {
        info!("Disconnecting");
        if let Err(e) = self.announcer.publish_disconnect().await {
            warn!("Failed to publish disconnect certificate: {}", e);
        }
        let mut state = self.state.lock();
        if *state == ConnectionState::ConnectedAnnounced {
            *state = ConnectionState::ConnectedNotAnnounced;
        }
    }

    fn on_disconnected(&self) {
        info!("Disconnected");
        *self.state.lock() = ConnectionState::Disconnected;
        self.notify_clients_lost();
        self.connection_listeners
            .notify("disconnected", |l| l.on_disconnected());
    }

    fn on_connection_lost(&self, cause: &str) {
        warn!("Connection lost: {}", cause);
        *self.state.lock() = ConnectionState::Disconnected;
        self.notify_clients_lost();
        self.connection_listeners
            .notify("connection lost", |l| l.on_connection_lost());
    }

    fn on_message_arrived(&self, wire_topic: &str, bytes: &[u8], qos: Qos, retained: bool) {
        let topic = self.context.topics.decode_wire(wire_topic);
        if topic.application_id == FEEDBACK_APPLICATION {
            debug!("Ignoring feedback message on {}", wire_topic);
            return;
        }
        debug!("Message arrived on {} ({} bytes)", wire_topic, bytes.len());

        let payload = self.decode_payload(wire_topic, bytes);

        let control = topic.is_control();
        let verifier = self.verifier.read().clone();
        if let (true, Some(verifier)) = (control, verifier) {
            if let Err(reason) = verifier.verify(&topic, &payload) {
                warn!("Dropping control message on {}: {}", wire_topic, reason);
                return;
            }
        }

        self.deliver_to_subscribers(wire_topic, &topic, &payload);

        if control && !self.dispatcher.is_reply(&topic) {
            self.dispatcher.submit(topic.clone(), payload.clone());
        }

        if let Some(client) = self.client(&topic.application_id) {
            client.notify_message_arrived(
                &topic.device_id,
                topic.application_topic(),
                &payload,
                qos,
                retained,
                control,
            );
        }
    }

    fn on_message_published(&self, message_id: MessageId, wire_topic: &str) {
        if self
            .announcer
            .pending()
            .try_consume(message_id, wire_topic, AckEvent::Published)
        {
            return;
        }
        let topic = self.context.topics.decode_wire(wire_topic);
        if let Some(client) = self.client(&topic.application_id) {
            client.notify_message_published(message_id, topic.application_topic());
        }
    }

    fn on_message_confirmed(&self, message_id: MessageId, wire_topic: &str) {
        if self
            .announcer
            .pending()
            .try_consume(message_id, wire_topic, AckEvent::Confirmed)
        {
            return;
        }
        let topic = self.context.topics.decode_wire(wire_topic);
        if let Some(client) = self.client(&topic.application_id) {
            client.notify_message_confirmed(message_id, topic.application_topic());
        }
    }
}
