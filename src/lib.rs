//! # cloudlink
//!
//! Multiplexes many in-process applications over one MQTT connection to a
//! cloud platform.
//!
//! ```text
//!  app A ─┐                                        ┌─► BIRTH / DC / APPS
//!  app B ─┼─ ClientHandle ─► MessageRouter ─► Transport ─► broker
//!  app C ─┘        ▲               │
//!                  └── fan-out ────┴─► RequestDispatcher ─► REPLY
//! ```
//!
//! [`router::MessageRouter`] is the entry point. It needs a
//! [`transport::Transport`] (usually [`transport::MqttTransport`] from an
//! [`transport::MqttSession`]) and a [`lifecycle::DeviceInfoProvider`].

pub mod client;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod payload;
pub mod router;
pub mod rpc;
pub mod topic;
pub mod transport;

pub use client::{
    ClientHandle, CloudClientListener, CloudConnectionListener, CloudSubscriberListener,
};
pub use config::CloudOptions;
pub use error::{CloudError, ConfigError, DecodeError, EncodeError, TransportError};
pub use payload::{MetricValue, Payload, PayloadCodec, PayloadEncoding, Position};
pub use router::{CloudContext, ConnectionState, DeviceEvent, MessageRouter, MessageVerifier};
pub use rpc::{HandlerError, RequestContext, RequestHandler, ResponseCode};
pub use topic::{ApplicationTopic, TopicCodec};
pub use transport::{MessageId, Qos, Transport, TransportListener};
