//! # Payload Model and Codecs
//!
//! A [`Payload`] is the generic structured message exchanged by every
//! application: an optional timestamp, position and opaque body plus a map of
//! named, typed metrics.
//!
//! ```text
//! payload/
//! ├── binary.rs       - compact typed-binary codec (protobuf wire format)
//! ├── json.rs         - JSON codec with opaque-body fallback on decode
//! └── compression.rs  - gzip wrapper that keeps the shorter encoding
//! ```
//!
//! All codecs implement [`PayloadCodec`] and are interchangeable; the router
//! picks one from configuration through [`codec_for`].

pub mod binary;
pub mod compression;
pub mod json;

pub use binary::BinaryCodec;
pub use compression::Compressed;
pub use json::JsonCodec;

use crate::error::{DecodeError, EncodeError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// One typed metric value
///
/// The set is closed: every codec matches on it exhaustively.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Char(char),
    Bytes(Vec<u8>),
}

impl MetricValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            MetricValue::Bool(_) => "bool",
            MetricValue::Int32(_) => "int32",
            MetricValue::Int64(_) => "int64",
            MetricValue::Float32(_) => "float32",
            MetricValue::Float64(_) => "float64",
            MetricValue::String(_) => "string",
            MetricValue::Char(_) => "char",
            MetricValue::Bytes(_) => "bytes",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetricValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            MetricValue::Int32(value) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MetricValue::Bool(v) => write!(f, "{}", v),
            MetricValue::Int32(v) => write!(f, "{}", v),
            MetricValue::Int64(v) => write!(f, "{}", v),
            MetricValue::Float32(v) => write!(f, "{}", v),
            MetricValue::Float64(v) => write!(f, "{}", v),
            MetricValue::String(v) => write!(f, "{}", v),
            MetricValue::Char(v) => write!(f, "{}", v),
            MetricValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

macro_rules! metric_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for MetricValue {
            fn from(value: $ty) -> Self {
                MetricValue::$variant(value)
            }
        })*
    };
}

metric_from! {
    bool => Bool,
    i32 => Int32,
    i64 => Int64,
    f32 => Float32,
    f64 => Float64,
    String => String,
    char => Char,
    Vec<u8> => Bytes,
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        MetricValue::String(value.to_string())
    }
}

/// Geographic fix attached to a payload; every field is optional
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Position {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub heading: Option<f64>,
    pub precision: Option<f64>,
    pub satellites: Option<i32>,
    pub speed: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub status: Option<i32>,
}

/// The structured message carried on every topic
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    pub timestamp: Option<DateTime<Utc>>,
    pub position: Option<Position>,
    pub body: Option<Vec<u8>>,
    pub metrics: BTreeMap<String, MetricValue>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps undecodable bytes so they still reach the applications
    pub fn opaque(bytes: &[u8]) -> Self {
        Self {
            body: Some(bytes.to_vec()),
            ..Self::default()
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn add_metric(&mut self, name: impl Into<String>, value: impl Into<MetricValue>) {
        self.metrics.insert(name.into(), value.into());
    }

    pub fn metric(&self, name: &str) -> Option<&MetricValue> {
        self.metrics.get(name)
    }

    pub fn remove_metric(&mut self, name: &str) -> Option<MetricValue> {
        self.metrics.remove(name)
    }

    /// Adds a metric from a dynamically typed value.
    ///
    /// `null` is skipped; objects and arrays have no metric type and are
    /// rejected. Integers become `Int64`, other numbers `Float64`.
    pub fn add_dynamic_metric(
        &mut self,
        name: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), EncodeError> {
        let name = name.into();
        let metric = match value {
            serde_json::Value::Null => {
                debug!("Skipping null value for metric '{}'", name);
                return Ok(());
            }
            serde_json::Value::Bool(v) => MetricValue::Bool(v),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(v) => MetricValue::Int64(v),
                None => match n.as_f64() {
                    Some(v) => MetricValue::Float64(v),
                    None => {
                        return Err(EncodeError::UnsupportedMetricType {
                            name,
                            found: format!("number {}", n),
                        })
                    }
                },
            },
            serde_json::Value::String(v) => MetricValue::String(v),
            serde_json::Value::Array(_) => {
                return Err(EncodeError::UnsupportedMetricType {
                    name,
                    found: "array".to_string(),
                })
            }
            serde_json::Value::Object(_) => {
                return Err(EncodeError::UnsupportedMetricType {
                    name,
                    found: "object".to_string(),
                })
            }
        };
        self.metrics.insert(name, metric);
        Ok(())
    }
}

/// Converts payloads to and from wire bytes
pub trait PayloadCodec: Send + Sync {
    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, EncodeError>;

    fn decode(&self, bytes: &[u8]) -> Result<Payload, DecodeError>;

    /// Name advertised in the birth certificate
    fn name(&self) -> &'static str;
}

/// Wire encoding selected in configuration
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadEncoding {
    #[default]
    Protobuf,
    SimpleJson,
}

impl fmt::Display for PayloadEncoding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PayloadEncoding::Protobuf => write!(f, "protobuf"),
            PayloadEncoding::SimpleJson => write!(f, "simple-json"),
        }
    }
}

/// Builds the configured codec.
///
/// Inbound gzip is always inflated; `compress` only governs publishing.
pub fn codec_for(encoding: PayloadEncoding, compress: bool) -> Box<dyn PayloadCodec> {
    match (encoding, compress) {
        (PayloadEncoding::Protobuf, true) => Box::new(Compressed::new(BinaryCodec)),
        (PayloadEncoding::Protobuf, false) => Box::new(Compressed::decode_only(BinaryCodec)),
        (PayloadEncoding::SimpleJson, true) => Box::new(Compressed::new(JsonCodec)),
        (PayloadEncoding::SimpleJson, false) => Box::new(Compressed::decode_only(JsonCodec)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dynamic_metrics_map_to_closed_union() {
        let mut payload = Payload::new();
        payload.add_dynamic_metric("flag", json!(true)).unwrap();
        payload.add_dynamic_metric("count", json!(12)).unwrap();
        payload.add_dynamic_metric("ratio", json!(0.5)).unwrap();
        payload.add_dynamic_metric("name", json!("x")).unwrap();
        payload.add_dynamic_metric("nothing", json!(null)).unwrap();

        assert_eq!(payload.metric("flag"), Some(&MetricValue::Bool(true)));
        assert_eq!(payload.metric("count"), Some(&MetricValue::Int64(12)));
        assert_eq!(payload.metric("ratio"), Some(&MetricValue::Float64(0.5)));
        assert_eq!(payload.metric("name"), Some(&MetricValue::from("x")));
        assert!(payload.metric("nothing").is_none());
    }

    #[test]
    fn dynamic_object_is_rejected() {
        let mut payload = Payload::new();
        let err = payload
            .add_dynamic_metric("nested", json!({"a": 1}))
            .unwrap_err();
        assert!(matches!(
            err,
            EncodeError::UnsupportedMetricType { ref name, .. } if name == "nested"
        ));
    }

    #[test]
    fn configured_codec_names() {
        assert_eq!(codec_for(PayloadEncoding::Protobuf, false).name(), "protobuf");
        assert_eq!(codec_for(PayloadEncoding::SimpleJson, false).name(), "simple-json");
        assert_eq!(codec_for(PayloadEncoding::Protobuf, true).name(), "protobuf");
    }
}
