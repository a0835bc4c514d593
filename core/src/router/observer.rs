use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use slog::{debug, warn, Logger};
use tokio::sync::mpsc::{self, Receiver, Sender};
use uuid::Uuid;

use super::{ObserverId, SessionRouter, OBSERVER_QUEUE_LEN};
use crate::error::{CoreError, Result};
use crate::link::protocol::RawSample;
use crate::sessions::SessionService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Recording,
    Offline,
}

/// Observer to server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ObserverMessage {
    #[serde(rename_all = "camelCase")]
    JoinSession { session_id: String },
    #[serde(rename_all = "camelCase")]
    LeaveSession { session_id: String },
    #[serde(rename_all = "camelCase")]
    StartRecording { session_id: String, device_id: String },
    #[serde(rename_all = "camelCase")]
    StopRecording { session_id: String, device_id: String },
    #[serde(other)]
    Unknown,
}

impl ObserverMessage {
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| CoreError::MalformedMessage(format!("invalid JSON: {e}")))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CoreError::MalformedMessage("missing message type".to_string()))?;

        match serde_json::from_value(value) {
            Ok(ObserverMessage::Unknown) => Err(CoreError::MalformedMessage(format!(
                "unsupported message type '{kind}'"
            ))),
            Ok(message) => Ok(message),
            Err(e) => Err(CoreError::MalformedMessage(format!("bad '{kind}' message: {e}"))),
        }
    }
}

/// Server to observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ObserverEvent {
    #[serde(rename_all = "camelCase")]
    RealTimeEcg {
        session_id: String,
        data: Vec<RawSample>,
        device_id: String,
    },
    #[serde(rename_all = "camelCase")]
    DeviceUpdate {
        device_id: String,
        status: DeviceStatus,
        last_seen: DateTime<Utc>,
        battery_level: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    Joined { session_id: String },
    #[serde(rename_all = "camelCase")]
    Left { session_id: String },
    #[serde(rename_all = "camelCase")]
    CommandWarning { device_id: String, message: String },
    Error { message: String },
}

/// Server-side state of one observer connection.
pub struct ObserverLink {
    pub id: ObserverId,
    outbound: Sender<ObserverEvent>,
    sessions: HashSet<String>,
}

impl ObserverLink {
    pub fn new() -> (Self, Receiver<ObserverEvent>) {
        let (outbound, rx) = mpsc::channel(OBSERVER_QUEUE_LEN);
        let link = Self {
            id: Uuid::new_v4(),
            outbound,
            sessions: HashSet::new(),
        };
        (link, rx)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &String> {
        self.sessions.iter()
    }

    fn reply(&self, event: ObserverEvent) {
        // A closed queue means the connection is closing; a full one means
        // the observer stopped reading.
        let _ = self.outbound.try_send(event);
    }

    /// Parses and executes one observer frame. Failures are answered with an
    /// `error` event; the connection stays usable.
    pub async fn handle_text(&mut self, text: &str, router: &SessionRouter, sessions: &SessionService, logger: &Logger) {
        let message = match ObserverMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(logger, "rejected observer message"; "observer" => %self.id, "error" => %e);
                self.reply(ObserverEvent::Error { message: e.to_string() });
                return;
            }
        };

        match message {
            ObserverMessage::JoinSession { session_id } => {
                router.join(&session_id, self.id, self.outbound.clone());
                self.sessions.insert(session_id.clone());
                self.reply(ObserverEvent::Joined { session_id });
            }
            ObserverMessage::LeaveSession { session_id } => {
                router.leave(&session_id, self.id);
                self.sessions.remove(&session_id);
                self.reply(ObserverEvent::Left { session_id });
            }
            ObserverMessage::StartRecording { session_id, device_id } => {
                let delivered = sessions.start_recording(&session_id, &device_id).await;
                self.report_delivery(&device_id, delivered, logger);
            }
            ObserverMessage::StopRecording { session_id, device_id } => {
                let delivered = sessions.stop_recording(&session_id, &device_id).await;
                self.report_delivery(&device_id, delivered, logger);
            }
            ObserverMessage::Unknown => {
                self.reply(ObserverEvent::Error { message: "unsupported message type".to_string() });
            }
        }
    }

    fn report_delivery(&self, device_id: &str, delivered: Result<()>, logger: &Logger) {
        if let Err(e) = delivered {
            warn!(logger, "command not delivered"; "device_id" => device_id, "error" => %e);
            self.reply(ObserverEvent::CommandWarning {
                device_id: device_id.to_string(),
                message: e.to_string(),
            });
        }
    }

    /// Drops every membership this observer holds.
    pub fn close(&mut self, router: &SessionRouter) {
        router.leave_all(self.id, self.sessions.drain());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_commands() {
        let msg = ObserverMessage::parse(r#"{"type":"start-recording","sessionId":"s1","deviceId":"d1"}"#).unwrap();
        assert_eq!(
            msg,
            ObserverMessage::StartRecording { session_id: "s1".into(), device_id: "d1".into() }
        );
        assert!(ObserverMessage::parse(r#"{"type":"join-session"}"#).is_err());
        assert!(ObserverMessage::parse(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn real_time_event_shape() {
        let event = ObserverEvent::RealTimeEcg {
            session_id: "s1".into(),
            device_id: "d1".into(),
            data: vec![RawSample { timestamp: 4.0, voltage: 0.2, leads_off: false, quality_score: Some(90.0) }],
        };
        assert_eq!(
            serde_json::to_value(event).unwrap(),
            json!({
                "type": "real-time-ecg",
                "sessionId": "s1",
                "deviceId": "d1",
                "data": [{"timestamp": 4.0, "voltage": 0.2, "leads_off": false, "quality_score": 90.0}]
            })
        );
    }
}
