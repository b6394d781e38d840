//! Thin adapter from a decoded Sparkplug-B payload to named metric values.
//!
//! Wire-format decoding internals are explicitly out of scope (`spec.md`
//! §1 non-goals: "treated as a library the core calls"); this module only
//! turns the `prost`-generated [`Payload`] message into the
//! `name -> f64` map the MQTT tag provider dispatches from.

#![allow(clippy::derive_partial_eq_without_eq)]

include!(concat!(env!("OUT_DIR"), "/sparkplug_b.rs"));

use std::collections::HashMap;

use thiserror::Error;

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to decode sparkplug payload: {0}")]
    Protobuf(#[from] prost::DecodeError),
}

/// Decodes a raw Sparkplug-B `Payload` message and extracts every metric
/// that carries a numeric value (int/long/float/double/bool), skipping
/// metrics without a name or with a non-numeric value (`spec.md` §4.5:
/// "decode into named metrics").
pub fn decode_metrics(bytes: &[u8]) -> Result<HashMap<String, f64>, DecodeError> {
    let decoded: Payload = prost::Message::decode(bytes)?;
    let mut metrics = HashMap::new();
    for metric in decoded.metrics {
        let Some(name) = metric.name else { continue };
        let Some(value) = numeric_value(&metric) else { continue };
        metrics.insert(name, value);
    }
    Ok(metrics)
}

/// Encodes a named metric set as a Sparkplug-B `Payload`, for brokers
/// configured with `OutboundPayloadFormat::Sparkplug` (§4.7 "Outbound
/// publisher", §6 "payload... a Sparkplug-compatible typed metric set").
/// Every value is carried as a double; the names chosen by the caller
/// determine how a downstream consumer maps them back to fields.
pub fn encode_metrics(metrics: &[(String, f64)], timestamp_ms: i64, seq: u64) -> Vec<u8> {
    use prost::Message;
    let payload = Payload {
        timestamp: Some(timestamp_ms as u64),
        seq: Some(seq),
        metrics: metrics
            .iter()
            .map(|(name, value)| payload::Metric {
                name: Some(name.clone()),
                alias: None,
                timestamp: Some(timestamp_ms as u64),
                datatype: None,
                is_historical: None,
                is_transient: None,
                is_null: None,
                value: Some(payload::metric::Value::DoubleValue(*value)),
            })
            .collect(),
    };
    payload.encode_to_vec()
}

fn numeric_value(metric: &payload::Metric) -> Option<f64> {
    use payload::metric::Value;
    match metric.value {
        Some(Value::IntValue(v)) => Some(v as f64),
        Some(Value::LongValue(v)) => Some(v as f64),
        Some(Value::FloatValue(v)) => Some(v as f64),
        Some(Value::DoubleValue(v)) => Some(v),
        Some(Value::BooleanValue(v)) => Some(if v { 1.0 } else { 0.0 }),
        Some(Value::StringValue(_)) | None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(metrics: Vec<payload::Metric>) -> Vec<u8> {
        use prost::Message;
        let payload = Payload {
            timestamp: None,
            metrics,
            seq: None,
        };
        payload.encode_to_vec()
    }

    #[test]
    fn decodes_named_numeric_metrics() {
        let bytes = encode(vec![payload::Metric {
            name: Some("temperature".to_string()),
            alias: None,
            timestamp: None,
            datatype: None,
            is_historical: None,
            is_transient: None,
            is_null: None,
            value: Some(payload::metric::Value::DoubleValue(101.5)),
        }]);
        let metrics = decode_metrics(&bytes).unwrap();
        assert_eq!(metrics.get("temperature"), Some(&101.5));
    }

    #[test]
    fn skips_metrics_without_a_name() {
        let bytes = encode(vec![payload::Metric {
            name: None,
            alias: None,
            timestamp: None,
            datatype: None,
            is_historical: None,
            is_transient: None,
            is_null: None,
            value: Some(payload::metric::Value::DoubleValue(1.0)),
        }]);
        let metrics = decode_metrics(&bytes).unwrap();
        assert!(metrics.is_empty());
    }

    #[test]
    fn encode_then_decode_round_trips_every_metric() {
        let metrics = vec![("mean".to_string(), 101.5), ("range".to_string(), 3.25)];
        let bytes = encode_metrics(&metrics, 1_700_000_000_000, 1);
        let decoded = decode_metrics(&bytes).unwrap();
        for (name, value) in &metrics {
            assert_eq!(decoded.get(name), Some(value));
        }
    }

    #[test]
    fn skips_string_valued_metrics() {
        let bytes = encode(vec![payload::Metric {
            name: Some("status".to_string()),
            alias: None,
            timestamp: None,
            datatype: None,
            is_historical: None,
            is_transient: None,
            is_null: None,
            value: Some(payload::metric::Value::StringValue("ok".to_string())),
        }]);
        let metrics = decode_metrics(&bytes).unwrap();
        assert!(metrics.is_empty());
    }
}
