//! Session lifecycle: creates sessions, binds devices to them and tells the
//! devices to start or stop streaming.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use slog::{info, warn, Logger};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::link::protocol::DeviceCommand;
use crate::link::DeviceGateway;
use crate::router::SessionRouter;
use crate::storage::{SampleStore, Session};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSession {
    pub patient_id: String,
    pub device_id: String,
    #[serde(default)]
    pub sample_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOutcome {
    pub session: Session,
    /// False when the device had no open connection; the session still exists.
    pub command_delivered: bool,
}

pub struct SessionService {
    store: Arc<dyn SampleStore>,
    gateway: Arc<DeviceGateway>,
    router: Arc<SessionRouter>,
    default_sample_rate: f64,
    logger: Logger,
}

impl SessionService {
    pub fn new(
        store: Arc<dyn SampleStore>,
        gateway: Arc<DeviceGateway>,
        router: Arc<SessionRouter>,
        default_sample_rate: f64,
        logger: Logger,
    ) -> Self {
        Self {
            store,
            gateway,
            router,
            default_sample_rate,
            logger,
        }
    }

    pub async fn start_session(&self, request: StartSession) -> Result<SessionOutcome> {
        if request.device_id.trim().is_empty() {
            return Err(CoreError::MalformedMessage("deviceId must not be empty".to_string()));
        }
        let live_rate = self
            .gateway
            .registry()
            .get(&request.device_id)
            .map(|handle| handle.snapshot().sample_rate);
        let sample_rate = request
            .sample_rate
            .filter(|r| r.is_finite() && *r > 0.0)
            .or(live_rate)
            .unwrap_or(self.default_sample_rate);

        let session = Session {
            id: Uuid::new_v4().to_string(),
            patient_id: request.patient_id,
            device_id: request.device_id,
            started_at: Utc::now(),
            ended_at: None,
            sample_rate,
            completed: false,
        };
        self.store.create_session(session.clone()).await?;

        if let Some(previous) = self.router.bind_device(&session.id, &session.device_id) {
            info!(self.logger, "device moved to a new session";
                "device_id" => &session.device_id,
                "previous_session" => &previous,
                "session_id" => &session.id);
            if let Err(e) = self.store.complete_session(&previous, Utc::now()).await {
                warn!(self.logger, "could not close superseded session"; "session_id" => &previous, "error" => %e);
            }
        }

        let command_delivered = self.deliver(
            &session.device_id,
            DeviceCommand::StartRecording { session_id: session.id.clone() },
        );
        info!(self.logger, "session started";
            "session_id" => &session.id,
            "device_id" => &session.device_id,
            "delivered" => command_delivered);
        Ok(SessionOutcome { session, command_delivered })
    }

    pub async fn stop_session(&self, session_id: &str) -> Result<SessionOutcome> {
        let session = self.store.complete_session(session_id, Utc::now()).await?;
        let device_id = self
            .router
            .unbind_device(session_id)
            .unwrap_or_else(|| session.device_id.clone());

        let command_delivered = self.deliver(
            &device_id,
            DeviceCommand::StopRecording { session_id: session_id.to_string() },
        );
        info!(self.logger, "session stopped"; "session_id" => session_id, "delivered" => command_delivered);
        Ok(SessionOutcome { session, command_delivered })
    }

    /// Observer-issued start: binds and forwards without creating a session.
    pub async fn start_recording(&self, session_id: &str, device_id: &str) -> Result<()> {
        self.router.bind_device(session_id, device_id);
        self.gateway.dispatch_command(
            device_id,
            DeviceCommand::StartRecording { session_id: session_id.to_string() },
        )
    }

    pub async fn stop_recording(&self, session_id: &str, device_id: &str) -> Result<()> {
        if self.router.device_for(session_id).as_deref() == Some(device_id) {
            self.router.unbind_device(session_id);
        }
        self.gateway.dispatch_command(
            device_id,
            DeviceCommand::StopRecording { session_id: session_id.to_string() },
        )
    }

    fn deliver(&self, device_id: &str, command: DeviceCommand) -> bool {
        match self.gateway.dispatch_command(device_id, command) {
            Ok(()) => true,
            Err(e) => {
                warn!(self.logger, "command not delivered"; "device_id" => device_id, "error" => %e);
                false
            }
        }
    }
}
