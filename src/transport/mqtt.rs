//! rumqttc-backed transport
//!
//! # Session Lifecycle
//!
//! ```text
//! MqttSession<Configured> ──start(listener)──► MqttSession<Running> ──stop──► MqttSession<Stopped>
//! ```
//!
//! # Tasks
//!
//! ```text
//!                 ┌─────────── poll task ───────────┐
//! connect() ────► │ EventLoop::poll                 │── published / confirmed ──► listener
//!                 │   ConnAck, Publish, lost ───────┼──► callback task ─────────► listener
//!                 └─────────────────────────────────┘
//! ```
//!
//! The poll task never awaits a listener, so a listener waiting for a publish
//! acknowledgment cannot stall the event loop. Message ids are assigned in
//! publish order and matched against the order in which rumqttc writes the
//! publishes out. There is no automatic reconnect: after a loss the session
//! idles until `connect()` is called again.

use super::{MessageId, Qos, Transport, TransportListener};
use crate::config::BrokerOptions;
use crate::error::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use statum::{machine, state};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

impl From<Qos> for QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
            Qos::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

impl From<QoS> for Qos {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => Qos::AtMostOnce,
            QoS::AtLeastOnce => Qos::AtLeastOnce,
            QoS::ExactlyOnce => Qos::ExactlyOnce,
        }
    }
}

enum Command {
    Connect(oneshot::Sender<Result<(), TransportError>>),
}

/// Forwarded from the poll task to the callback task
enum SessionEvent {
    Established,
    Lost(String),
    Arrived {
        topic: String,
        payload: Vec<u8>,
        qos: Qos,
        retained: bool,
    },
}

struct QueuedPublish {
    id: MessageId,
    topic: String,
    qos: Qos,
}

/// [`Transport`] implementation over a rumqttc [`AsyncClient`]
pub struct MqttTransport {
    client: AsyncClient,
    commands: mpsc::UnboundedSender<Command>,
    connected: watch::Sender<bool>,
    listener: OnceLock<Weak<dyn TransportListener>>,
    next_id: AtomicU32,
    publish_order: tokio::sync::Mutex<()>,
    queued: Mutex<VecDeque<QueuedPublish>>,
    inflight: Mutex<HashMap<u16, (MessageId, String)>>,
    disconnect_requested: AtomicBool,
}

impl MqttTransport {
    fn new(client: AsyncClient, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            client,
            commands,
            connected: watch::Sender::new(false),
            listener: OnceLock::new(),
            next_id: AtomicU32::new(1),
            publish_order: tokio::sync::Mutex::new(()),
            queued: Mutex::new(VecDeque::new()),
            inflight: Mutex::new(HashMap::new()),
            disconnect_requested: AtomicBool::new(false),
        }
    }

    fn listener(&self) -> Option<Arc<dyn TransportListener>> {
        self.listener.get().and_then(Weak::upgrade)
    }

    fn set_connected(&self, connected: bool) -> bool {
        self.connected.send_replace(connected)
    }

    fn clear_tracking(&self) {
        self.queued.lock().clear();
        self.inflight.lock().clear();
    }

    /// rumqttc wrote a publish; pair it with the oldest queued id
    fn on_outgoing_publish(&self, pkid: u16) {
        let Some(queued) = self.queued.lock().pop_front() else {
            warn!("Outgoing publish (pkid {}) without a queued message", pkid);
            return;
        };
        if queued.qos.is_confirmed() {
            self.inflight
                .lock()
                .insert(pkid, (queued.id, queued.topic.clone()));
        }
        if let Some(listener) = self.listener() {
            listener.on_message_published(queued.id, &queued.topic);
        }
    }

    fn on_broker_ack(&self, pkid: u16) {
        let Some((id, topic)) = self.inflight.lock().remove(&pkid) else {
            trace!("Ack for unknown pkid {}", pkid);
            return;
        };
        if let Some(listener) = self.listener() {
            listener.on_message_confirmed(id, &topic);
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::Connect(reply))
            .map_err(|_| TransportError::Connection("session is not running".to_string()))?;
        outcome
            .await
            .map_err(|_| TransportError::Connection("session stopped while connecting".to_string()))?
    }

    async fn disconnect(&self, timeout: Duration) -> Result<(), TransportError> {
        if !self.is_connected() {
            debug!("Disconnect requested while not connected");
            return Ok(());
        }
        let listener = self.listener();
        if let Some(listener) = &listener {
            listener.on_disconnecting().await;
        }

        self.disconnect_requested.store(true, Ordering::Release);
        let mut connected = self.connected.subscribe();
        self.client
            .disconnect()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        if tokio::time::timeout(timeout, connected.wait_for(|c| !*c))
            .await
            .is_err()
        {
            warn!("Broker did not acknowledge disconnect within {:?}", timeout);
        }
        self.set_connected(false);

        if let Some(listener) = &listener {
            listener.on_disconnected();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
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
        // MQTT has no per-message priority
        trace!("Publishing on {} with priority {}", topic, priority);

        let _order = self.publish_order.lock().await;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.queued.lock().push_back(QueuedPublish {
            id,
            topic: topic.to_string(),
            qos,
        });
        if let Err(e) = self.client.publish(topic, qos.into(), retain, payload).await {
            self.queued.lock().pop_back();
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            });
        }
        Ok(id)
    }

    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.client
            .subscribe(topic, qos.into())
            .await
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| TransportError::Unsubscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Configured, // Client built, event loop not yet driven
    Running,    // Poll and callback tasks spawned
    Stopped,    // Tasks cancelled and joined
}

/// Owns the rumqttc event loop and the tasks driving it
#[machine]
pub struct MqttSession<S: SessionState> {
    transport: Arc<MqttTransport>,
    event_loop: Option<EventLoop>,
    commands: Option<mpsc::UnboundedReceiver<Command>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl<S: SessionState> MqttSession<S> {
    pub fn transport(&self) -> Arc<MqttTransport> {
        self.transport.clone()
    }
}

impl MqttSession<Configured> {
    pub fn configure(options: &BrokerOptions, client_id: &str) -> Self {
        info!(
            "Configuring MQTT session {} for {}:{}",
            client_id, options.host, options.port
        );
        let mut mqtt_options = MqttOptions::new(client_id, options.host.clone(), options.port);
        mqtt_options
            .set_keep_alive(Duration::from_secs(options.keep_alive_secs.max(5)))
            .set_clean_session(options.clean_session);
        if let (Some(user), Some(password)) = (&options.username, &options.password) {
            mqtt_options.set_credentials(user.clone(), password.clone());
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, options.channel_capacity);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        Self::new(
            Arc::new(MqttTransport::new(client, commands_tx)),
            Some(event_loop),
            Some(commands_rx),
            CancellationToken::new(),
            Vec::new(),
        )
    }

    /// Spawns the poll and callback tasks; must run within a tokio runtime
    pub fn start(mut self, listener: Weak<dyn TransportListener>) -> MqttSession<Running> {
        if self.transport.listener.set(listener).is_err() {
            warn!("Transport listener already set, keeping the first one");
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        if let (Some(event_loop), Some(commands)) = (self.event_loop.take(), self.commands.take())
        {
            self.tasks.push(tokio::spawn(poll_loop(
                self.transport.clone(),
                event_loop,
                commands,
                events_tx,
                self.cancel.clone(),
            )));
            self.tasks.push(tokio::spawn(callback_loop(
                self.transport.clone(),
                events_rx,
                self.cancel.clone(),
            )));
        }
        info!("MQTT session running");
        self.transition()
    }
}

impl MqttSession<Running> {
    /// Cancels the tasks and waits for them to exit
    pub async fn stop(mut self) -> MqttSession<Stopped> {
        info!("Stopping MQTT session");
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!("MQTT session task failed: {}", e);
            }
        }
        self.transport.set_connected(false);
        self.transition()
    }
}

async fn poll_loop(
    transport: Arc<MqttTransport>,
    mut event_loop: EventLoop,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
) {
    loop {
        // Idle until someone asks for a connection
        let reply = tokio::select! {
            _ = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(Command::Connect(reply)) => reply,
                None => break,
            },
        };

        debug!("Connecting to broker");
        transport.clear_tracking();
        transport.disconnect_requested.store(false, Ordering::Release);
        let mut pending_reply = Some(reply);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Poll loop cancelled");
                    return;
                }
                command = commands.recv() => match command {
                    Some(Command::Connect(reply)) => {
                        let outcome = if transport.is_connected() {
                            Ok(())
                        } else {
                            Err(TransportError::Connection("connect already in progress".to_string()))
                        };
                        let _ = reply.send(outcome);
                    }
                    None => return,
                },
                result = event_loop.poll() => match result {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT connection established");
                        transport.set_connected(true);
                        if let Some(reply) = pending_reply.take() {
                            let _ = reply.send(Ok(()));
                        }
                        let _ = events.send(SessionEvent::Established);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let _ = events.send(SessionEvent::Arrived {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                            qos: publish.qos.into(),
                            retained: publish.retain,
                        });
                    }
                    Ok(Event::Incoming(Packet::PubAck(ack))) => transport.on_broker_ack(ack.pkid),
                    Ok(Event::Incoming(Packet::PubComp(comp))) => transport.on_broker_ack(comp.pkid),
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        info!("MQTT server sent disconnect");
                        transport.set_connected(false);
                        let _ = events.send(SessionEvent::Lost("server sent disconnect".to_string()));
                        break;
                    }
                    Ok(Event::Outgoing(Outgoing::Publish(pkid))) => transport.on_outgoing_publish(pkid),
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!("Disconnect sent to broker");
                        transport.set_connected(false);
                    }
                    Ok(event) => trace!("MQTT event: {:?}", event),
                    Err(e) => {
                        let was_connected = transport.set_connected(false);
                        if let Some(reply) = pending_reply.take() {
                            warn!("MQTT connection failed: {}", e);
                            let _ = reply.send(Err(TransportError::Connection(e.to_string())));
                        } else if transport.disconnect_requested.swap(false, Ordering::AcqRel) {
                            debug!("MQTT connection closed after disconnect: {}", e);
                        } else if was_connected {
                            warn!("MQTT event loop error: {}", e);
                            let _ = events.send(SessionEvent::Lost(e.to_string()));
                        }
                        break;
                    }
                },
            }
        }
    }
    debug!("Poll loop finished");
}

async fn callback_loop(
    transport: Arc<MqttTransport>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(listener) = transport.listener() else {
            debug!("Transport listener dropped, discarding event");
            continue;
        };
        match event {
            SessionEvent::Established => listener.on_connection_established().await,
            SessionEvent::Lost(cause) => listener.on_connection_lost(&cause),
            SessionEvent::Arrived {
                topic,
                payload,
                qos,
                retained,
            } => listener.on_message_arrived(&topic, &payload, qos, retained),
        }
    }
    debug!("Callback loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> BrokerOptions {
        BrokerOptions {
            host: "localhost".to_string(),
            port: 1883,
            ..BrokerOptions::default()
        }
    }

    #[test]
    fn qos_maps_both_ways() {
        for qos in [Qos::AtMostOnce, Qos::AtLeastOnce, Qos::ExactlyOnce] {
            assert_eq!(Qos::from(QoS::from(qos)), qos);
        }
    }

    #[tokio::test]
    async fn operations_fail_before_connect() {
        let session = MqttSession::configure(&broker(), "D1");
        let transport = session.transport();

        assert!(!transport.is_connected());
        let err = transport
            .publish("ACC/D1/APP/t", vec![1], Qos::AtMostOnce, false, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
        assert!(matches!(
            transport.subscribe("ACC/#", Qos::AtMostOnce).await,
            Err(TransportError::NotConnected)
        ));
        assert!(transport.disconnect(Duration::from_millis(10)).await.is_ok());
    }

    #[tokio::test]
    async fn stopped_session_rejects_connect() {
        struct Silent;

        #[async_trait]
        impl TransportListener for Silent {
            async fn on_connection_established(&self) {}
            async fn on_disconnecting(&self) {}
            fn on_disconnected(&self) {}
            fn on_connection_lost(&self, _cause: &str) {}
            fn on_message_arrived(&self, _topic: &str, _payload: &[u8], _qos: Qos, _retained: bool) {}
            fn on_message_published(&self, _id: MessageId, _topic: &str) {}
            fn on_message_confirmed(&self, _id: MessageId, _topic: &str) {}
        }

        let listener: Arc<dyn TransportListener> = Arc::new(Silent);
        let session = MqttSession::configure(&broker(), "D1").start(Arc::downgrade(&listener));
        let transport = session.transport();
        let _stopped = session.stop().await;

        assert!(matches!(
            transport.connect().await,
            Err(TransportError::Connection(_))
        ));
    }
}
