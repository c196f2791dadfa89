//! Error taxonomy for the connector core
//!
//! Each concern has its own error type so callers can tell a malformed
//! outbound payload apart from a broker hiccup. [`CloudError`] aggregates them
//! for the public handle APIs.
//!
//! Inbound problems (`DecodeError`) never reach the caller of the router: they
//! degrade to an opaque-body payload. Outbound problems (`EncodeError`) are
//! surfaced at publish time.

use thiserror::Error;

/// Failure to turn a [`crate::payload::Payload`] into wire bytes
#[derive(Debug, Error)]
pub enum EncodeError {
    /// A dynamic value has no counterpart in the metric type union
    #[error("Unsupported type for metric '{name}': {found}")]
    UnsupportedMetricType { name: String, found: String },

    /// JSON serialization failed
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Compression stream failed
    #[error("Compression failed: {0}")]
    Compression(#[source] std::io::Error),
}

/// Failure to parse wire bytes into a payload
///
/// Only the strict codecs produce this; the router converts it into an
/// opaque-body payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed binary payload: {0}")]
    Malformed(String),

    #[error("Unknown metric type tag {tag} for metric '{name}'")]
    UnknownMetricType { name: String, tag: i32 },

    #[error("Metric '{name}' declares type {declared} but carries no value")]
    MissingMetricValue { name: String, declared: &'static str },

    #[error("Decompression failed: {0}")]
    Decompression(#[source] std::io::Error),
}

/// Failure reported by the transport collaborator
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,

    #[error("Publish on '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Subscribe to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("Unsubscribe from '{topic}' failed: {reason}")]
    Unsubscribe { topic: String, reason: String },

    #[error("Connection error: {0}")]
    Connection(String),
}

/// Failure to load or parse [`crate::config::CloudOptions`]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Aggregate error returned by client handles and the router
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// The client handle was released and can no longer be used
    #[error("Client '{0}' has been released")]
    Released(String),
}
