//! JSON codec
//!
//! ```json
//! {
//!   "ts": 1700000000123,
//!   "body": "cmF3",
//!   "position": { "lat": 45.1, "lon": 7.6, "satellites": 9 },
//!   "temperature": { "type": "DOUBLE", "value": 21.5 }
//! }
//! ```
//!
//! Decoding never fails: input that is not a well-formed payload document is
//! delivered as an opaque body holding the original bytes.

use super::{MetricValue, Payload, PayloadCodec, Position};
use crate::error::{DecodeError, EncodeError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::{Map, Number, Value};
use tracing::{debug, warn};

const KEY_TIMESTAMP: &str = "ts";
const KEY_BODY: &str = "body";
const KEY_POSITION: &str = "position";
const KEY_TYPE: &str = "type";
const KEY_VALUE: &str = "value";

const RESERVED_KEYS: [&str; 3] = [KEY_TIMESTAMP, KEY_BODY, KEY_POSITION];

/// JSON codec, advertised as `simple-json`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    /// Strict decode used by [`PayloadCodec::decode`] before falling back
    pub fn try_decode(&self, bytes: &[u8]) -> Result<Payload, DecodeError> {
        let document: Value = serde_json::from_slice(bytes)
            .map_err(|e| DecodeError::Malformed(format!("invalid JSON: {}", e)))?;
        let Value::Object(fields) = document else {
            return Err(DecodeError::Malformed(
                "top-level JSON value is not an object".to_string(),
            ));
        };

        let mut payload = Payload::default();
        for (key, value) in fields {
            match key.as_str() {
                KEY_TIMESTAMP => payload.timestamp = Some(parse_millis(&key, &value)?),
                KEY_BODY => {
                    let encoded = value
                        .as_str()
                        .ok_or_else(|| malformed(&key, "expected a base64 string"))?;
                    let body = STANDARD
                        .decode(encoded)
                        .map_err(|e| malformed(&key, &e.to_string()))?;
                    payload.body = Some(body);
                }
                KEY_POSITION => payload.position = Some(parse_position(&value)?),
                _ => {
                    let metric = parse_metric(&key, &value)?;
                    payload.metrics.insert(key, metric);
                }
            }
        }
        Ok(payload)
    }
}

impl PayloadCodec for JsonCodec {
    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, EncodeError> {
        let mut document = Map::new();

        if let Some(ts) = payload.timestamp {
            document.insert(KEY_TIMESTAMP.to_string(), Value::from(ts.timestamp_millis()));
        }
        if let Some(body) = &payload.body {
            document.insert(KEY_BODY.to_string(), Value::from(STANDARD.encode(body)));
        }
        if let Some(position) = &payload.position {
            document.insert(KEY_POSITION.to_string(), position_to_json(position));
        }

        for (name, value) in &payload.metrics {
            if RESERVED_KEYS.contains(&name.as_str()) {
                warn!("Dropping metric '{}': name collides with a reserved key", name);
                continue;
            }
            match metric_to_json(value) {
                Some(entry) => {
                    document.insert(name.clone(), entry);
                }
                None => warn!("Dropping metric '{}': value {} is not representable", name, value),
            }
        }

        Ok(serde_json::to_vec(&Value::Object(document))?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Payload, DecodeError> {
        match self.try_decode(bytes) {
            Ok(payload) => Ok(payload),
            Err(e) => {
                debug!("Delivering {} bytes as opaque body: {}", bytes.len(), e);
                Ok(Payload::opaque(bytes))
            }
        }
    }

    fn name(&self) -> &'static str {
        "simple-json"
    }
}

fn metric_to_json(value: &MetricValue) -> Option<Value> {
    let (type_name, json) = match value {
        MetricValue::Bool(v) => ("BOOLEAN", Value::from(*v)),
        MetricValue::Float64(v) => ("DOUBLE", Value::Number(Number::from_f64(*v)?)),
        MetricValue::Float32(v) => ("FLOAT", Value::Number(Number::from_f64(f64::from(*v))?)),
        MetricValue::Int32(v) => ("INTEGER", Value::from(*v)),
        MetricValue::Int64(v) => ("LONG", Value::from(*v)),
        MetricValue::String(v) => ("STRING", Value::from(v.as_str())),
        MetricValue::Char(v) => ("CHARACTER", Value::from(v.to_string())),
        MetricValue::Bytes(v) => ("BYTEARRAY", Value::from(STANDARD.encode(v))),
    };

    let mut entry = Map::new();
    entry.insert(KEY_TYPE.to_string(), Value::from(type_name));
    entry.insert(KEY_VALUE.to_string(), json);
    Some(Value::Object(entry))
}

fn parse_metric(name: &str, entry: &Value) -> Result<MetricValue, DecodeError> {
    let type_name = entry
        .get(KEY_TYPE)
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(name, "missing metric type"))?;
    let value = entry
        .get(KEY_VALUE)
        .ok_or_else(|| malformed(name, "missing metric value"))?;
    let wrong = || malformed(name, &format!("value does not match type {}", type_name));

    let metric = match type_name {
        "BOOLEAN" => MetricValue::Bool(value.as_bool().ok_or_else(wrong)?),
        "DOUBLE" => MetricValue::Float64(value.as_f64().ok_or_else(wrong)?),
        "FLOAT" => MetricValue::Float32(value.as_f64().ok_or_else(wrong)? as f32),
        "INTEGER" => {
            let v = value.as_i64().ok_or_else(wrong)?;
            MetricValue::Int32(i32::try_from(v).map_err(|_| wrong())?)
        }
        "LONG" => MetricValue::Int64(value.as_i64().ok_or_else(wrong)?),
        "STRING" => MetricValue::String(value.as_str().ok_or_else(wrong)?.to_string()),
        "CHARACTER" => {
            let s = value.as_str().ok_or_else(wrong)?;
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => MetricValue::Char(c),
                _ => return Err(wrong()),
            }
        }
        "BYTEARRAY" => {
            let s = value.as_str().ok_or_else(wrong)?;
            MetricValue::Bytes(STANDARD.decode(s).map_err(|_| wrong())?)
        }
        other => return Err(malformed(name, &format!("unknown metric type {}", other))),
    };
    Ok(metric)
}

fn position_to_json(position: &Position) -> Value {
    let mut object = Map::new();
    let mut put_f64 = |key: &str, value: Option<f64>| {
        if let Some(v) = value {
            match Number::from_f64(v) {
                Some(n) => {
                    object.insert(key.to_string(), Value::Number(n));
                }
                None => warn!("Dropping position field '{}': {} is not finite", key, v),
            }
        }
    };
    put_f64("lat", position.latitude);
    put_f64("lon", position.longitude);
    put_f64("alt", position.altitude);
    put_f64("heading", position.heading);
    put_f64("precision", position.precision);
    put_f64("speed", position.speed);

    if let Some(v) = position.satellites {
        object.insert("satellites".to_string(), Value::from(v));
    }
    if let Some(ts) = position.timestamp {
        object.insert("ts".to_string(), Value::from(ts.timestamp_millis()));
    }
    if let Some(v) = position.status {
        object.insert("status".to_string(), Value::from(v));
    }
    Value::Object(object)
}

fn parse_position(value: &Value) -> Result<Position, DecodeError> {
    let object = value
        .as_object()
        .ok_or_else(|| malformed(KEY_POSITION, "expected an object"))?;

    let mut position = Position::default();
    for (key, field) in object {
        let float = || field.as_f64().ok_or_else(|| malformed(key, "expected a number"));
        let int = || {
            field
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .ok_or_else(|| malformed(key, "expected a 32-bit integer"))
        };
        match key.as_str() {
            "lat" => position.latitude = Some(float()?),
            "lon" => position.longitude = Some(float()?),
            "alt" => position.altitude = Some(float()?),
            "heading" => position.heading = Some(float()?),
            "precision" => position.precision = Some(float()?),
            "speed" => position.speed = Some(float()?),
            "satellites" => position.satellites = Some(int()?),
            "status" => position.status = Some(int()?),
            "ts" => position.timestamp = Some(parse_millis(key, field)?),
            other => return Err(malformed(other, "unknown position field")),
        }
    }
    Ok(position)
}

fn parse_millis(key: &str, value: &Value) -> Result<DateTime<Utc>, DecodeError> {
    let millis = value
        .as_i64()
        .ok_or_else(|| malformed(key, "expected epoch milliseconds"))?;
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| malformed(key, "timestamp out of range"))
}

fn malformed(key: &str, reason: &str) -> DecodeError {
    DecodeError::Malformed(format!("'{}': {}", key, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_metric_type_keeps_value_and_type() {
        let mut payload = Payload::new().with_timestamp(
            DateTime::from_timestamp_millis(1_700_000_000_123).expect("valid timestamp"),
        );
        payload.add_metric("b", false);
        payload.add_metric("i", 42i32);
        payload.add_metric("l", -9_000_000_000i64);
        payload.add_metric("f", 0.1f32);
        payload.add_metric("d", 3.75f64);
        payload.add_metric("s", "hello");
        payload.add_metric("c", 'x');
        payload.add_metric("y", vec![1u8, 2, 3, 250]);
        payload.body = Some(b"body bytes".to_vec());
        payload.position = Some(Position {
            latitude: Some(45.0),
            longitude: Some(-7.5),
            status: Some(1),
            ..Position::default()
        });

        let bytes = JsonCodec.encode(&payload).expect("encode");
        let decoded = JsonCodec.decode(&bytes).expect("decode");
        assert_eq!(decoded, payload);
    }

    #[test]
    fn uses_documented_wire_names() {
        let mut payload = Payload::new();
        payload.add_metric("temp", 21.5f64);
        payload.body = Some(b"raw".to_vec());

        let bytes = JsonCodec.encode(&payload).expect("encode");
        let value: Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(value["temp"]["type"], "DOUBLE");
        assert_eq!(value["temp"]["value"], 21.5);
        assert_eq!(value["body"], "cmF3");
    }

    #[test]
    fn non_json_becomes_opaque_body() {
        let bytes = b"\x00\x01not json at all";
        let payload = JsonCodec.decode(bytes).expect("never fails");
        assert_eq!(payload.body.as_deref(), Some(&bytes[..]));
        assert!(payload.metrics.is_empty());
    }

    #[test]
    fn structural_failure_becomes_opaque_body() {
        let bytes = br#"{"ts": 1, "m": {"type": "WHATEVER", "value": 1}}"#;
        let payload = JsonCodec.decode(bytes).expect("never fails");
        assert_eq!(payload.body.as_deref(), Some(&bytes[..]));
        assert_eq!(payload.timestamp, None);
    }

    #[test]
    fn top_level_array_becomes_opaque_body() {
        let bytes = b"[1, 2, 3]";
        assert_eq!(JsonCodec.decode(bytes).expect("never fails"), Payload::opaque(bytes));
    }

    #[test]
    fn non_finite_float_is_dropped() {
        let mut payload = Payload::new();
        payload.add_metric("nan", f64::NAN);
        payload.add_metric("ok", 1i32);

        let bytes = JsonCodec.encode(&payload).expect("encode");
        let decoded = JsonCodec.decode(&bytes).expect("decode");
        assert!(decoded.metric("nan").is_none());
        assert_eq!(decoded.metric("ok"), Some(&MetricValue::Int32(1)));
    }
}
