use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use super::protocol::GatewayMessage;
use crate::storage::DeviceRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum LinkState {
    /// Transport open, no registration yet.
    Connected,
    /// Registered and never bound to a session.
    Registered,
    #[serde(rename_all = "camelCase")]
    Recording { session_id: String },
    /// Registered, previous session stopped.
    Idle,
    Disconnected,
}

/// Live view of one registered device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConnection {
    pub device_id: String,
    pub name: String,
    pub firmware_version: String,
    pub sample_rate: f64,
    pub signal_strength: Option<i32>,
    pub battery_level: Option<f64>,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(flatten)]
    pub state: LinkState,
}

impl DeviceConnection {
    pub fn session_id(&self) -> Option<&str> {
        match &self.state {
            LinkState::Recording { session_id } => Some(session_id),
            _ => None,
        }
    }

    pub fn to_record(&self) -> DeviceRecord {
        DeviceRecord {
            device_id: self.device_id.clone(),
            name: self.name.clone(),
            firmware_version: self.firmware_version.clone(),
            last_seen: self.last_seen,
            battery_level: self.battery_level,
            signal_strength: self.signal_strength,
        }
    }
}

/// Registry entry: one transport connection bound to one device id.
pub struct DeviceHandle {
    pub connection_id: Uuid,
    outbound: UnboundedSender<GatewayMessage>,
    info: Mutex<DeviceConnection>,
}

impl DeviceHandle {
    pub fn new(connection_id: Uuid, outbound: UnboundedSender<GatewayMessage>, info: DeviceConnection) -> Self {
        Self {
            connection_id,
            outbound,
            info: Mutex::new(info),
        }
    }

    pub fn device_id(&self) -> String {
        self.info.lock().device_id.clone()
    }

    pub fn snapshot(&self) -> DeviceConnection {
        self.info.lock().clone()
    }

    /// Applies `f` under this device's lock and returns the resulting snapshot.
    pub fn update(&self, f: impl FnOnce(&mut DeviceConnection)) -> DeviceConnection {
        let mut info = self.info.lock();
        f(&mut info);
        info.clone()
    }

    /// Queues a message for the connection's writer. Fails once the connection is gone.
    pub fn send(&self, message: GatewayMessage) -> bool {
        self.outbound.send(message).is_ok()
    }

    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }
}

/// Live devices keyed by id. The map lock is only held to look up, insert or
/// remove a handle; per-device state sits behind each handle's own lock.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Arc<DeviceHandle>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `handle` to its device id, returning whatever it replaced.
    pub fn register(&self, handle: Arc<DeviceHandle>) -> Option<Arc<DeviceHandle>> {
        let device_id = handle.device_id();
        self.devices.write().insert(device_id, handle)
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceHandle>> {
        self.devices.read().get(device_id).cloned()
    }

    /// Removes the entry only if it still belongs to `connection_id`, so a
    /// superseded connection closing late cannot evict its replacement.
    pub fn remove(&self, device_id: &str, connection_id: Uuid) -> Option<Arc<DeviceHandle>> {
        let mut devices = self.devices.write();
        match devices.get(device_id) {
            Some(handle) if handle.connection_id == connection_id => devices.remove(device_id),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> Vec<DeviceConnection> {
        let handles: Vec<Arc<DeviceHandle>> = self.devices.read().values().cloned().collect();
        let mut devices: Vec<DeviceConnection> = handles.iter().map(|h| h.snapshot()).collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn handle(device_id: &str) -> (Arc<DeviceHandle>, mpsc::UnboundedReceiver<GatewayMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let now = Utc::now();
        let info = DeviceConnection {
            device_id: device_id.to_string(),
            name: "test".to_string(),
            firmware_version: "0.0.1".to_string(),
            sample_rate: 250.0,
            signal_strength: None,
            battery_level: None,
            connected_at: now,
            last_seen: now,
            state: LinkState::Registered,
        };
        (Arc::new(DeviceHandle::new(Uuid::new_v4(), tx, info)), rx)
    }

    #[test]
    fn reregistering_replaces_without_duplicates() {
        let registry = DeviceRegistry::new();
        let (first, _rx1) = handle("dev-1");
        let (second, _rx2) = handle("dev-1");

        assert!(registry.register(first.clone()).is_none());
        let replaced = registry.register(second.clone()).unwrap();

        assert_eq!(replaced.connection_id, first.connection_id);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("dev-1").unwrap().connection_id, second.connection_id);
    }

    #[test]
    fn stale_connection_cannot_remove_replacement() {
        let registry = DeviceRegistry::new();
        let (first, _rx1) = handle("dev-1");
        let (second, _rx2) = handle("dev-1");
        registry.register(first.clone());
        registry.register(second.clone());

        assert!(registry.remove("dev-1", first.connection_id).is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.remove("dev-1", second.connection_id).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn send_fails_after_receiver_drops() {
        let (h, rx) = handle("dev-1");
        assert!(h.send(GatewayMessage::Ack { received: 1 }));
        drop(rx);
        assert!(!h.is_open());
        assert!(!h.send(GatewayMessage::Ack { received: 1 }));
    }

    #[test]
    fn recording_state_exposes_session() {
        let (h, _rx) = handle("dev-1");
        let snapshot = h.update(|d| d.state = LinkState::Recording { session_id: "s1".into() });
        assert_eq!(snapshot.session_id(), Some("s1"));
    }
}
