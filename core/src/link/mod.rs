//! Device-facing side: registration, heartbeats, sample ingestion and
//! command dispatch for sensing hardware connected over a WebSocket.

use std::sync::Arc;

use chrono::Utc;
use slog::{debug, error, info, warn, Logger};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::router::{DeviceStatus, ObserverEvent, SessionRouter};
use crate::storage::{SampleStore, StoredSample};

pub mod mock;
pub mod protocol;
pub mod registry;

use protocol::{DeviceCommand, DeviceMessage, EcgData, GatewayMessage, Heartbeat, Registration};
use registry::{DeviceConnection, DeviceHandle, DeviceRegistry, LinkState};

/// One transport connection from a device, before and after registration.
pub struct DeviceLink {
    pub connection_id: Uuid,
    outbound: UnboundedSender<GatewayMessage>,
    device_id: Option<String>,
    closed: bool,
}

impl DeviceLink {
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    fn reply(&self, message: GatewayMessage) {
        // The writer only goes away when the connection is closing.
        let _ = self.outbound.send(message);
    }
}

pub struct DeviceGateway {
    registry: Arc<DeviceRegistry>,
    router: Arc<SessionRouter>,
    store: Arc<dyn SampleStore>,
    max_batch_len: usize,
    default_sample_rate: f64,
    logger: Logger,
}

impl DeviceGateway {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        router: Arc<SessionRouter>,
        store: Arc<dyn SampleStore>,
        max_batch_len: usize,
        default_sample_rate: f64,
        logger: Logger,
    ) -> Self {
        Self {
            registry,
            router,
            store,
            max_batch_len,
            default_sample_rate,
            logger,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Accepts a new transport connection and greets it with `connected`.
    pub fn open(&self) -> (DeviceLink, UnboundedReceiver<GatewayMessage>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let link = DeviceLink {
            connection_id: Uuid::new_v4(),
            outbound,
            device_id: None,
            closed: false,
        };
        link.reply(GatewayMessage::Connected {
            message: "connected to ECG gateway".to_string(),
        });
        debug!(self.logger, "device link opened"; "connection" => %link.connection_id);
        (link, rx)
    }

    /// Current state of the link as the state machine sees it.
    pub fn link_state(&self, link: &DeviceLink) -> LinkState {
        if link.closed {
            return LinkState::Disconnected;
        }
        match link.device_id() {
            None => LinkState::Connected,
            Some(device_id) => match self.registry.get(device_id) {
                Some(handle) if handle.connection_id == link.connection_id => handle.snapshot().state,
                // superseded by a newer connection for the same device
                _ => LinkState::Disconnected,
            },
        }
    }

    /// Parses and executes one text frame. Every failure is answered with an
    /// `error` message and the link stays open.
    pub async fn handle_text(&self, link: &mut DeviceLink, text: &str) {
        let outcome = match DeviceMessage::parse(text) {
            Ok(DeviceMessage::Register(registration)) => self.register(link, registration).await,
            Ok(DeviceMessage::EcgData(batch)) => self.ingest(link, batch).await.map(|_| ()),
            Ok(DeviceMessage::Heartbeat(heartbeat)) => self.heartbeat(link, heartbeat).await,
            Ok(DeviceMessage::Unknown) => Err(CoreError::MalformedMessage("unsupported message type".to_string())),
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            warn!(self.logger, "device message rejected";
                "connection" => %link.connection_id,
                "device_id" => link.device_id().unwrap_or("-"),
                "error" => %e);
            link.reply(GatewayMessage::error(&e));
        }
    }

    /// Binds the link to `registration.device_id`. The newest registration for
    /// an id wins; an older connection for the same id is orphaned silently.
    pub async fn register(&self, link: &mut DeviceLink, registration: Registration) -> Result<()> {
        if registration.device_id.trim().is_empty() {
            return Err(CoreError::MalformedMessage("deviceId must not be empty".to_string()));
        }
        if let Some(previous) = link.device_id.take() {
            if previous != registration.device_id {
                self.registry.remove(&previous, link.connection_id);
            }
        }

        let now = Utc::now();
        let state = match self.router.session_for_device(&registration.device_id) {
            Some(session_id) => LinkState::Recording { session_id },
            None => LinkState::Registered,
        };
        let info = DeviceConnection {
            device_id: registration.device_id.clone(),
            name: registration.device_name.unwrap_or_else(|| registration.device_id.clone()),
            firmware_version: registration.firmware_version.unwrap_or_else(|| "unknown".to_string()),
            sample_rate: registration
                .sample_rate
                .filter(|r| r.is_finite() && *r > 0.0)
                .unwrap_or(self.default_sample_rate),
            signal_strength: registration.signal_strength,
            battery_level: registration.battery_level,
            connected_at: now,
            last_seen: now,
            state,
        };
        let record = info.to_record();
        let status = status_of(&info.state);

        let handle = Arc::new(DeviceHandle::new(link.connection_id, link.outbound.clone(), info));
        if let Some(old) = self.registry.register(handle) {
            if old.connection_id != link.connection_id {
                info!(self.logger, "registration superseded a stale connection";
                    "device_id" => &registration.device_id,
                    "old_connection" => %old.connection_id,
                    "connection" => %link.connection_id);
            }
        }
        link.device_id = Some(registration.device_id.clone());

        if let Err(e) = self.store.upsert_device(record).await {
            error!(self.logger, "failed to persist device"; "device_id" => &registration.device_id, "error" => %e);
        }
        self.router.broadcast_update(ObserverEvent::DeviceUpdate {
            device_id: registration.device_id.clone(),
            status,
            last_seen: now,
            battery_level: registration.battery_level,
        });

        info!(self.logger, "device registered"; "device_id" => &registration.device_id, "connection" => %link.connection_id);
        link.reply(GatewayMessage::Registered { device_id: registration.device_id });
        Ok(())
    }

    fn registered_handle(&self, link: &DeviceLink) -> Result<Arc<DeviceHandle>> {
        let device_id = link
            .device_id()
            .ok_or_else(|| CoreError::MalformedMessage("device must register first".to_string()))?;
        match self.registry.get(device_id) {
            Some(handle) if handle.connection_id == link.connection_id => Ok(handle),
            _ => Err(CoreError::DeviceNotConnected(device_id.to_string())),
        }
    }

    /// Validates a batch, stores it, fans it out and acknowledges it.
    /// Returns the number of accepted samples.
    pub async fn ingest(&self, link: &DeviceLink, batch: EcgData) -> Result<usize> {
        let handle = self.registered_handle(link)?;
        if batch.device_id != handle.device_id() {
            return Err(CoreError::InvalidBatch(format!(
                "batch for device {} arrived on the link of {}",
                batch.device_id,
                handle.device_id()
            )));
        }
        // Only the session the device is bound to accepts its samples; a late
        // batch after stop must not reopen a finished series.
        match self.router.session_for_device(&handle.device_id()) {
            Some(bound) if bound == batch.session_id => {}
            bound => {
                return Err(CoreError::InvalidBatch(format!(
                    "device {} is not recording session {} (bound: {})",
                    handle.device_id(),
                    batch.session_id,
                    bound.as_deref().unwrap_or("none")
                )))
            }
        }
        let samples = protocol::validate_batch(batch.data.as_ref(), self.max_batch_len)?;
        if samples.windows(2).any(|w| w[1].timestamp < w[0].timestamp) {
            warn!(self.logger, "batch timestamps regress"; "session_id" => &batch.session_id, "device_id" => &batch.device_id);
        }

        let now = Utc::now();
        handle.update(|d| d.last_seen = now);

        // no registry or device lock is held past this point
        let stored: Vec<StoredSample> = samples
            .iter()
            .map(|s| StoredSample {
                timestamp: s.timestamp,
                voltage: s.voltage,
                leads_off: s.leads_off,
                quality_score: s.quality_score,
            })
            .collect();
        self.store.insert_samples(&batch.session_id, &stored).await?;

        let received = samples.len();
        let delivered = self.router.publish(
            &batch.session_id,
            ObserverEvent::RealTimeEcg {
                session_id: batch.session_id.clone(),
                data: samples,
                device_id: batch.device_id.clone(),
            },
        );
        debug!(self.logger, "batch ingested";
            "session_id" => &batch.session_id,
            "device_id" => &batch.device_id,
            "count" => received,
            "observers" => delivered);

        link.reply(GatewayMessage::Ack { received });
        Ok(received)
    }

    pub async fn heartbeat(&self, link: &DeviceLink, heartbeat: Heartbeat) -> Result<()> {
        let handle = self.registered_handle(link)?;
        if let Some(claimed) = heartbeat.device_id.as_deref() {
            if claimed != handle.device_id() {
                return Err(CoreError::MalformedMessage(format!(
                    "heartbeat for {claimed} arrived on the link of {}",
                    handle.device_id()
                )));
            }
        }

        let now = Utc::now();
        let snapshot = handle.update(|d| {
            d.last_seen = now;
            if heartbeat.battery_level.is_some() {
                d.battery_level = heartbeat.battery_level;
            }
            if heartbeat.signal_strength.is_some() {
                d.signal_strength = heartbeat.signal_strength;
            }
        });

        if let Err(e) = self.store.upsert_device(snapshot.to_record()).await {
            error!(self.logger, "failed to persist heartbeat"; "device_id" => &snapshot.device_id, "error" => %e);
        }
        self.router.broadcast_update(ObserverEvent::DeviceUpdate {
            device_id: snapshot.device_id.clone(),
            status: status_of(&snapshot.state),
            last_seen: now,
            battery_level: snapshot.battery_level,
        });

        link.reply(GatewayMessage::Pong { timestamp: now.timestamp_millis() });
        Ok(())
    }

    /// Pushes a session-lifecycle command to the device's open connection.
    /// Fails with `DeviceNotConnected` if there is none; nothing is retried.
    pub fn dispatch_command(&self, device_id: &str, command: DeviceCommand) -> Result<()> {
        let handle = self
            .registry
            .get(device_id)
            .ok_or_else(|| CoreError::DeviceNotConnected(device_id.to_string()))?;

        let state = match &command {
            DeviceCommand::StartRecording { session_id } => LinkState::Recording { session_id: session_id.clone() },
            DeviceCommand::StopRecording { .. } => LinkState::Idle,
        };
        if !handle.send(command.into()) {
            return Err(CoreError::DeviceNotConnected(device_id.to_string()));
        }
        let snapshot = handle.update(|d| d.state = state);
        self.router.broadcast_update(ObserverEvent::DeviceUpdate {
            device_id: snapshot.device_id.clone(),
            status: status_of(&snapshot.state),
            last_seen: snapshot.last_seen,
            battery_level: snapshot.battery_level,
        });
        Ok(())
    }

    /// Tears the link down. Only removes the registry entry if this link still owns it.
    pub async fn disconnect(&self, link: &mut DeviceLink) {
        link.closed = true;
        let Some(device_id) = link.device_id.take() else {
            return;
        };
        let Some(handle) = self.registry.remove(&device_id, link.connection_id) else {
            debug!(self.logger, "superseded link closed"; "device_id" => &device_id, "connection" => %link.connection_id);
            return;
        };

        let snapshot = handle.update(|d| d.state = LinkState::Disconnected);
        if let Err(e) = self.store.upsert_device(snapshot.to_record()).await {
            error!(self.logger, "failed to persist device"; "device_id" => &device_id, "error" => %e);
        }
        self.router.broadcast_update(ObserverEvent::DeviceUpdate {
            device_id: device_id.clone(),
            status: DeviceStatus::Offline,
            last_seen: snapshot.last_seen,
            battery_level: snapshot.battery_level,
        });
        info!(self.logger, "device disconnected"; "device_id" => &device_id, "connection" => %link.connection_id);
    }

    pub fn devices(&self) -> Vec<DeviceConnection> {
        self.registry.snapshot()
    }
}

fn status_of(state: &LinkState) -> DeviceStatus {
    match state {
        LinkState::Recording { .. } => DeviceStatus::Recording,
        LinkState::Disconnected => DeviceStatus::Offline,
        _ => DeviceStatus::Online,
    }
}
