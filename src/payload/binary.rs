//! Compact typed-binary codec
//!
//! Protobuf wire format, field numbers:
//!
//! ```text
//! Payload   timestamp=1 (ms)  position=2  metric=5000 (repeated)  body=5001
//! Metric    name=1 type=2 double=3 float=4 long=5 int=6 bool=7 string=8 bytes=9
//! Position  lat=1 lon=2 alt=3 precision=4 heading=5 speed=6 ts=7 sats=8 status=9
//! ```
//!
//! Decoding is strict: malformed bytes, unknown type tags and type tags
//! without a matching value are all errors.

use super::{MetricValue, Payload, PayloadCodec, Position};
use crate::error::{DecodeError, EncodeError};
use chrono::{DateTime, Utc};
use prost::Message;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
enum ValueType {
    Double = 0,
    Float = 1,
    Int64 = 2,
    Int32 = 3,
    Bool = 4,
    String = 5,
    Bytes = 6,
    Char = 7,
}

impl ValueType {
    fn label(self) -> &'static str {
        match self {
            ValueType::Double => "DOUBLE",
            ValueType::Float => "FLOAT",
            ValueType::Int64 => "INT64",
            ValueType::Int32 => "INT32",
            ValueType::Bool => "BOOL",
            ValueType::String => "STRING",
            ValueType::Bytes => "BYTES",
            ValueType::Char => "CHAR",
        }
    }
}

#[derive(Clone, PartialEq, Message)]
struct WireMetric {
    #[prost(string, required, tag = "1")]
    name: String,
    #[prost(enumeration = "ValueType", required, tag = "2")]
    value_type: i32,
    #[prost(double, optional, tag = "3")]
    double_value: Option<f64>,
    #[prost(float, optional, tag = "4")]
    float_value: Option<f32>,
    #[prost(int64, optional, tag = "5")]
    long_value: Option<i64>,
    #[prost(int32, optional, tag = "6")]
    int_value: Option<i32>,
    #[prost(bool, optional, tag = "7")]
    bool_value: Option<bool>,
    #[prost(string, optional, tag = "8")]
    string_value: Option<String>,
    #[prost(bytes = "vec", optional, tag = "9")]
    bytes_value: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
struct WirePosition {
    #[prost(double, optional, tag = "1")]
    latitude: Option<f64>,
    #[prost(double, optional, tag = "2")]
    longitude: Option<f64>,
    #[prost(double, optional, tag = "3")]
    altitude: Option<f64>,
    #[prost(double, optional, tag = "4")]
    precision: Option<f64>,
    #[prost(double, optional, tag = "5")]
    heading: Option<f64>,
    #[prost(double, optional, tag = "6")]
    speed: Option<f64>,
    #[prost(int64, optional, tag = "7")]
    timestamp: Option<i64>,
    #[prost(int32, optional, tag = "8")]
    satellites: Option<i32>,
    #[prost(int32, optional, tag = "9")]
    status: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
struct WirePayload {
    #[prost(int64, optional, tag = "1")]
    timestamp: Option<i64>,
    #[prost(message, optional, tag = "2")]
    position: Option<WirePosition>,
    #[prost(message, repeated, tag = "5000")]
    metric: Vec<WireMetric>,
    #[prost(bytes = "vec", optional, tag = "5001")]
    body: Option<Vec<u8>>,
}

/// Protobuf codec, advertised as `protobuf`
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl PayloadCodec for BinaryCodec {
    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, EncodeError> {
        let wire = WirePayload {
            timestamp: payload.timestamp.map(|ts| ts.timestamp_millis()),
            position: payload.position.as_ref().map(position_to_wire),
            metric: payload
                .metrics
                .iter()
                .map(|(name, value)| metric_to_wire(name, value))
                .collect(),
            body: payload.body.clone(),
        };
        Ok(wire.encode_to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Payload, DecodeError> {
        let wire =
            WirePayload::decode(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;

        let mut payload = Payload {
            timestamp: wire.timestamp.map(millis_to_datetime).transpose()?,
            position: wire.position.map(position_from_wire).transpose()?,
            body: wire.body,
            ..Payload::default()
        };
        for metric in wire.metric {
            let (name, value) = metric_from_wire(metric)?;
            payload.metrics.insert(name, value);
        }
        Ok(payload)
    }

    fn name(&self) -> &'static str {
        "protobuf"
    }
}

fn metric_to_wire(name: &str, value: &MetricValue) -> WireMetric {
    let mut wire = WireMetric {
        name: name.to_string(),
        ..WireMetric::default()
    };
    let value_type = match value {
        MetricValue::Float64(v) => {
            wire.double_value = Some(*v);
            ValueType::Double
        }
        MetricValue::Float32(v) => {
            wire.float_value = Some(*v);
            ValueType::Float
        }
        MetricValue::Int64(v) => {
            wire.long_value = Some(*v);
            ValueType::Int64
        }
        MetricValue::Int32(v) => {
            wire.int_value = Some(*v);
            ValueType::Int32
        }
        MetricValue::Bool(v) => {
            wire.bool_value = Some(*v);
            ValueType::Bool
        }
        MetricValue::String(v) => {
            wire.string_value = Some(v.clone());
            ValueType::String
        }
        MetricValue::Bytes(v) => {
            wire.bytes_value = Some(v.clone());
            ValueType::Bytes
        }
        MetricValue::Char(v) => {
            wire.string_value = Some(v.to_string());
            ValueType::Char
        }
    };
    wire.value_type = value_type as i32;
    wire
}

fn metric_from_wire(wire: WireMetric) -> Result<(String, MetricValue), DecodeError> {
    let value_type =
        ValueType::try_from(wire.value_type).map_err(|_| DecodeError::UnknownMetricType {
            name: wire.name.clone(),
            tag: wire.value_type,
        })?;
    let name = wire.name;
    let missing = |name: &str| DecodeError::MissingMetricValue {
        name: name.to_string(),
        declared: value_type.label(),
    };

    let value = match value_type {
        ValueType::Double => wire.double_value.map(MetricValue::Float64),
        ValueType::Float => wire.float_value.map(MetricValue::Float32),
        ValueType::Int64 => wire.long_value.map(MetricValue::Int64),
        ValueType::Int32 => wire.int_value.map(MetricValue::Int32),
        ValueType::Bool => wire.bool_value.map(MetricValue::Bool),
        ValueType::String => wire.string_value.map(MetricValue::String),
        ValueType::Bytes => wire.bytes_value.map(MetricValue::Bytes),
        ValueType::Char => match wire.string_value {
            Some(s) => {
                let mut chars = s.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Some(MetricValue::Char(c)),
                    _ => {
                        return Err(DecodeError::Malformed(format!(
                            "CHAR metric '{}' must hold exactly one character",
                            name
                        )))
                    }
                }
            }
            None => None,
        },
    };

    match value {
        Some(value) => Ok((name, value)),
        None => Err(missing(&name)),
    }
}

fn position_to_wire(position: &Position) -> WirePosition {
    WirePosition {
        latitude: position.latitude,
        longitude: position.longitude,
        altitude: position.altitude,
        precision: position.precision,
        heading: position.heading,
        speed: position.speed,
        timestamp: position.timestamp.map(|ts| ts.timestamp_millis()),
        satellites: position.satellites,
        status: position.status,
    }
}

fn position_from_wire(wire: WirePosition) -> Result<Position, DecodeError> {
    Ok(Position {
        latitude: wire.latitude,
        longitude: wire.longitude,
        altitude: wire.altitude,
        heading: wire.heading,
        precision: wire.precision,
        satellites: wire.satellites,
        speed: wire.speed,
        timestamp: wire.timestamp.map(millis_to_datetime).transpose()?,
        status: wire.status,
    })
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>, DecodeError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| DecodeError::Malformed(format!("timestamp {} out of range", millis)))
}
