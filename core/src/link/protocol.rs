//! Wire format of the device link: one JSON object per WebSocket text frame,
//! discriminated by its `type` field.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub device_id: String,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub sample_rate: Option<f64>,
    #[serde(default)]
    pub signal_strength: Option<i32>,
    #[serde(default)]
    pub battery_level: Option<f64>,
}

/// Batch as received. `data` is validated separately so that a missing or
/// non-array field gets its own error instead of a generic parse failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EcgData {
    pub session_id: String,
    pub device_id: String,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub battery_level: Option<f64>,
    #[serde(default)]
    pub signal_strength: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub timestamp: f64,
    pub voltage: f64,
    #[serde(default)]
    pub leads_off: bool,
    #[serde(default)]
    pub quality_score: Option<f64>,
}

/// Device to gateway.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DeviceMessage {
    Register(Registration),
    EcgData(EcgData),
    Heartbeat(Heartbeat),
    #[serde(other)]
    Unknown,
}

impl DeviceMessage {
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| CoreError::MalformedMessage(format!("invalid JSON: {e}")))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CoreError::MalformedMessage("missing message type".to_string()))?;

        match serde_json::from_value(value) {
            Ok(DeviceMessage::Unknown) => Err(CoreError::MalformedMessage(format!(
                "unsupported message type '{kind}'"
            ))),
            Ok(message) => Ok(message),
            Err(e) => Err(CoreError::MalformedMessage(format!("bad '{kind}' message: {e}"))),
        }
    }
}

/// Gateway to device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum GatewayMessage {
    Connected {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Registered {
        device_id: String,
    },
    Ack {
        received: usize,
    },
    Pong {
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    RecordingStarted {
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RecordingStopped {
        session_id: String,
    },
    Error {
        message: String,
    },
}

impl GatewayMessage {
    pub fn error(err: &CoreError) -> Self {
        GatewayMessage::Error { message: err.to_string() }
    }
}

/// Session-lifecycle command pushed to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    StartRecording { session_id: String },
    StopRecording { session_id: String },
}

impl From<DeviceCommand> for GatewayMessage {
    fn from(command: DeviceCommand) -> Self {
        match command {
            DeviceCommand::StartRecording { session_id } => GatewayMessage::RecordingStarted { session_id },
            DeviceCommand::StopRecording { session_id } => GatewayMessage::RecordingStopped { session_id },
        }
    }
}

/// Checks an `ecg-data` payload. All samples are accepted or none are.
pub fn validate_batch(data: Option<&Value>, max_len: usize) -> Result<Vec<RawSample>> {
    let items = match data {
        None | Some(Value::Null) => {
            return Err(CoreError::InvalidBatch("missing data field".to_string()));
        }
        Some(Value::Array(items)) => items,
        Some(_) => return Err(CoreError::InvalidBatch("data must be an array".to_string())),
    };
    if items.is_empty() {
        return Err(CoreError::InvalidBatch("data must not be empty".to_string()));
    }
    if items.len() > max_len {
        return Err(CoreError::InvalidBatch(format!(
            "batch of {} samples exceeds the limit of {max_len}",
            items.len()
        )));
    }

    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let sample: RawSample = serde_json::from_value(item.clone())
                .map_err(|e| CoreError::InvalidBatch(format!("sample {i}: {e}")))?;
            if !sample.voltage.is_finite() || !sample.timestamp.is_finite() {
                return Err(CoreError::InvalidBatch(format!("sample {i}: non-finite value")));
            }
            Ok(sample)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_register() {
        let text = r#"{"type":"register","deviceId":"esp-1","deviceName":"Chest strap","firmwareVersion":"1.2.0","sampleRate":250,"signalStrength":-60}"#;
        match DeviceMessage::parse(text).unwrap() {
            DeviceMessage::Register(reg) => {
                assert_eq!(reg.device_id, "esp-1");
                assert_eq!(reg.sample_rate, Some(250.0));
                assert_eq!(reg.signal_strength, Some(-60));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_ecg_data_without_validating_payload() {
        let text = r#"{"type":"ecg-data","sessionId":"s1","deviceId":"esp-1","data":"oops"}"#;
        match DeviceMessage::parse(text).unwrap() {
            DeviceMessage::EcgData(batch) => assert_eq!(batch.data, Some(json!("oops"))),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_and_malformed_messages_fail_closed() {
        assert!(matches!(
            DeviceMessage::parse(r#"{"type":"reboot"}"#),
            Err(CoreError::MalformedMessage(m)) if m.contains("reboot")
        ));
        assert!(DeviceMessage::parse("not json").is_err());
        assert!(DeviceMessage::parse(r#"{"deviceId":"x"}"#).is_err());
        assert!(DeviceMessage::parse(r#"{"type":"register"}"#).is_err());
    }

    #[test]
    fn gateway_messages_use_device_field_names() {
        let ack = serde_json::to_value(GatewayMessage::Ack { received: 25 }).unwrap();
        assert_eq!(ack, json!({"type": "ack", "received": 25}));

        let started: GatewayMessage = DeviceCommand::StartRecording { session_id: "s9".into() }.into();
        assert_eq!(
            serde_json::to_value(started).unwrap(),
            json!({"type": "recording-started", "sessionId": "s9"})
        );
    }

    #[test]
    fn batch_validation() {
        let good = json!([
            {"timestamp": 0, "voltage": 0.12, "leads_off": false, "quality_score": 98},
            {"timestamp": 4, "voltage": 0.15}
        ]);
        let samples = validate_batch(Some(&good), 50).unwrap();
        assert_eq!(samples.len(), 2);
        assert!(!samples[1].leads_off);

        assert!(validate_batch(None, 50).is_err());
        assert!(validate_batch(Some(&json!([])), 50).is_err());
        assert!(validate_batch(Some(&json!({"timestamp": 0})), 50).is_err());
        assert!(validate_batch(Some(&good), 1).is_err());

        let partly_bad = json!([{"timestamp": 0, "voltage": 1.0}, {"timestamp": 4}]);
        assert!(matches!(
            validate_batch(Some(&partly_bad), 50),
            Err(CoreError::InvalidBatch(m)) if m.starts_with("sample 1")
        ));
    }
}
