//! # Transport Collaborator
//!
//! The connector core never talks to a broker client directly. It publishes
//! through [`Transport`] and receives connection and message callbacks through
//! [`TransportListener`], which the router implements.
//!
//! ```text
//!            publish / subscribe
//!  Router ───────────────────────► Transport ──► broker
//!    ▲                                  │
//!    └────── TransportListener ◄────────┘
//!          (connect, arrive, published, confirmed)
//! ```
//!
//! [`mqtt`] provides the rumqttc-backed implementation.

pub mod mqtt;

pub use mqtt::{MqttSession, MqttTransport};

use crate::error::TransportError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identifier the transport assigns to an accepted publish
pub type MessageId = u32;

/// MQTT quality of service
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    /// Whether the broker acknowledges delivery for this level
    pub fn is_confirmed(self) -> bool {
        self != Qos::AtMostOnce
    }
}

impl TryFrom<u8> for Qos {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(format!("invalid QoS level {}, expected 0, 1 or 2", other)),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

impl fmt::Display for Qos {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// Publish/subscribe client used by the router
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;

    /// Disconnects cleanly, waiting at most `timeout` for the broker
    async fn disconnect(&self, timeout: Duration) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Queues a publish and returns its identifier.
    ///
    /// The identifier is later reported back through
    /// [`TransportListener::on_message_published`] and, for QoS above 0,
    /// [`TransportListener::on_message_confirmed`]. Those callbacks may fire
    /// before this future resolves.
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
        priority: u8,
    ) -> Result<MessageId, TransportError>;

    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;
}

/// Callbacks raised by a [`Transport`]
///
/// The synchronous callbacks run on the transport's own tasks and must return
/// quickly. The two async callbacks may publish and wait for acknowledgments.
#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn on_connection_established(&self);

    /// Raised before a requested disconnect, while publishing still works
    async fn on_disconnecting(&self);

    fn on_disconnected(&self);

    fn on_connection_lost(&self, cause: &str);

    fn on_message_arrived(&self, topic: &str, payload: &[u8], qos: Qos, retained: bool);

    fn on_message_published(&self, message_id: MessageId, topic: &str);

    fn on_message_confirmed(&self, message_id: MessageId, topic: &str);
}
