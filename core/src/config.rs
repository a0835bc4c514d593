use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What the analysis pipeline does with samples the device flagged as leads-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeadsOffPolicy {
    /// Leads-off samples are dropped before analysis. They are still stored and streamed.
    Exclude,
    /// Leads-off samples are analyzed like any other sample.
    Keep,
}

/// Display-only voltage scaling applied on the observer side.
///
/// Boards tested without proper electrodes report values roughly a thousand
/// times too large, so live charts divide by `voltage_divisor`. Storage and
/// analysis never see this scaling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub voltage_divisor: f64,
}

impl Calibration {
    pub fn identity() -> Self {
        Self { voltage_divisor: 1.0 }
    }

    pub fn apply(&self, voltage_mv: f64) -> f64 {
        if self.voltage_divisor == 0.0 {
            voltage_mv
        } else {
            voltage_mv / self.voltage_divisor
        }
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self { voltage_divisor: 1000.0 }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub default_sample_rate: f64,
    pub max_batch_len: usize,
    pub retention_secs: f64,
    pub classifier_url: Option<String>,
    pub classifier_timeout: Duration,
    pub leads_off_policy: LeadsOffPolicy,
    pub calibration: Calibration,
    pub mock_devices: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3001)),
            default_sample_rate: 250.0,
            max_batch_len: 250,
            retention_secs: 30.0,
            classifier_url: None,
            classifier_timeout: Duration::from_secs(10),
            leads_off_policy: LeadsOffPolicy::Exclude,
            calibration: Calibration::default(),
            mock_devices: 0,
        }
    }
}
