//! Client for the optional external classification service.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassifierSample {
    pub timestamp_ms: f64,
    pub voltage_mv: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationRequest {
    pub session_id: String,
    pub ecg_data: Vec<ClassifierSample>,
    pub sample_rate: f64,
}

/// Headline verdict from the external service. Anything else it sends is ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalClassification {
    pub classification: String,
    pub confidence: f64,
    #[serde(alias = "risk_level")]
    pub risk_level: String,
}

impl ExternalClassification {
    fn validate(self) -> Result<Self> {
        if self.classification.trim().is_empty() {
            return Err(CoreError::Classifier("empty classification".to_string()));
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(CoreError::Classifier(format!("confidence {} out of range", self.confidence)));
        }
        Ok(self)
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, request: &ClassificationRequest) -> Result<ExternalClassification>;
}

pub struct HttpClassifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpClassifier {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/analyze", base_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, request: &ClassificationRequest) -> Result<ExternalClassification> {
        let response = self.client.post(&self.endpoint).json(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CoreError::Classifier(format!("service answered {status}")));
        }
        response.json::<ExternalClassification>().await?.validate()
    }
}
