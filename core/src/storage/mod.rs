//! Persistence seam. The relational store lives outside this crate; everything
//! here talks to it through [`SampleStore`]. [`MemoryStore`] is the in-process
//! implementation used by the server binary and the tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::orchestrator::report::AnalysisReport;

pub mod buffer;
pub mod ringbuffer;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub patient_id: String,
    pub device_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub sample_rate: f64,
    pub completed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StoredSample {
    pub timestamp: f64,
    pub voltage: f64,
    pub leads_off: bool,
    pub quality_score: Option<f64>,
}

/// History row for a device; survives the live connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub device_id: String,
    pub name: String,
    pub firmware_version: String,
    pub last_seen: DateTime<Utc>,
    pub battery_level: Option<f64>,
    pub signal_strength: Option<i32>,
}

#[async_trait]
pub trait SampleStore: Send + Sync {
    async fn create_session(&self, session: Session) -> Result<()>;

    async fn session(&self, session_id: &str) -> Result<Option<Session>>;

    /// Marks a session complete; returns the updated row.
    async fn complete_session(&self, session_id: &str, ended_at: DateTime<Utc>) -> Result<Session>;

    /// Appends samples in order. Either the whole slice is stored or none of it.
    async fn insert_samples(&self, session_id: &str, samples: &[StoredSample]) -> Result<()>;

    async fn load_samples(&self, session_id: &str) -> Result<Vec<StoredSample>>;

    async fn upsert_device(&self, record: DeviceRecord) -> Result<()>;

    async fn device(&self, device_id: &str) -> Result<Option<DeviceRecord>>;

    async fn save_report(&self, report: AnalysisReport) -> Result<()>;

    async fn reports(&self, session_id: &str) -> Result<Vec<AnalysisReport>>;
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<String, Session>,
    samples: HashMap<String, Vec<StoredSample>>,
    devices: HashMap<String, DeviceRecord>,
    reports: HashMap<String, Vec<AnalysisReport>>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SampleStore for MemoryStore {
    async fn create_session(&self, session: Session) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables.sessions.contains_key(&session.id) {
            return Err(CoreError::Storage(format!("session {} already exists", session.id)));
        }
        tables.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn session(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self.tables.lock().sessions.get(session_id).cloned())
    }

    async fn complete_session(&self, session_id: &str, ended_at: DateTime<Utc>) -> Result<Session> {
        let mut tables = self.tables.lock();
        let session = tables
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))?;
        if !session.completed {
            session.completed = true;
            session.ended_at = Some(ended_at);
        }
        Ok(session.clone())
    }

    async fn insert_samples(&self, session_id: &str, samples: &[StoredSample]) -> Result<()> {
        self.tables
            .lock()
            .samples
            .entry(session_id.to_string())
            .or_default()
            .extend_from_slice(samples);
        Ok(())
    }

    async fn load_samples(&self, session_id: &str) -> Result<Vec<StoredSample>> {
        Ok(self.tables.lock().samples.get(session_id).cloned().unwrap_or_default())
    }

    async fn upsert_device(&self, record: DeviceRecord) -> Result<()> {
        self.tables.lock().devices.insert(record.device_id.clone(), record);
        Ok(())
    }

    async fn device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        Ok(self.tables.lock().devices.get(device_id).cloned())
    }

    async fn save_report(&self, report: AnalysisReport) -> Result<()> {
        self.tables
            .lock()
            .reports
            .entry(report.session_id.clone())
            .or_default()
            .push(report);
        Ok(())
    }

    async fn reports(&self, session_id: &str) -> Result<Vec<AnalysisReport>> {
        Ok(self.tables.lock().reports.get(session_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str) -> Session {
        Session {
            id: id.to_string(),
            patient_id: "patient-1".to_string(),
            device_id: "dev-1".to_string(),
            started_at: Utc::now(),
            ended_at: None,
            sample_rate: 250.0,
            completed: false,
        }
    }

    fn sample(timestamp: f64) -> StoredSample {
        StoredSample { timestamp, voltage: 0.5, leads_off: false, quality_score: None }
    }

    #[tokio::test]
    async fn sessions_round_trip() {
        let store = MemoryStore::new();
        store.create_session(session("s1")).await.unwrap();
        assert!(store.create_session(session("s1")).await.is_err());
        assert_eq!(store.session("s1").await.unwrap().unwrap().device_id, "dev-1");
        assert!(store.session("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn completing_keeps_first_end_time() {
        let store = MemoryStore::new();
        store.create_session(session("s1")).await.unwrap();
        let first = store.complete_session("s1", Utc::now()).await.unwrap();
        let second = store.complete_session("s1", Utc::now()).await.unwrap();
        assert!(second.completed);
        assert_eq!(first.ended_at, second.ended_at);
        assert!(matches!(
            store.complete_session("nope", Utc::now()).await,
            Err(CoreError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn samples_append_in_order() {
        let store = MemoryStore::new();
        store.insert_samples("s1", &[sample(0.0), sample(4.0)]).await.unwrap();
        store.insert_samples("s1", &[sample(8.0)]).await.unwrap();
        let stamps: Vec<f64> = store.load_samples("s1").await.unwrap().iter().map(|s| s.timestamp).collect();
        assert_eq!(stamps, vec![0.0, 4.0, 8.0]);
        assert!(store.load_samples("other").await.unwrap().is_empty());
    }
}
