//! Pull-based analysis of stored sessions.

use std::sync::Arc;
use std::time::Duration;

use ndarray::Array1;
use serde::Serialize;
use slog::{error, info, warn, Logger};

use crate::analysis::{quality, Analysis, Parameters};
use crate::config::LeadsOffPolicy;
use crate::error::{CoreError, Result};
use crate::storage::{SampleStore, StoredSample};

pub mod classifier;
pub mod report;

use classifier::{ClassificationRequest, Classifier, ClassifierSample, ExternalClassification};
use report::{AnalysisReport, DataStats};

/// Per-session outcome of a batch run.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum BatchEntry {
    Report(Box<AnalysisReport>),
    #[serde(rename_all = "camelCase")]
    Failed { session_id: String, error: String },
}

pub struct AnalysisOrchestrator {
    store: Arc<dyn SampleStore>,
    classifier: Option<Arc<dyn Classifier>>,
    classifier_timeout: Duration,
    leads_off_policy: LeadsOffPolicy,
    logger: Logger,
}

impl AnalysisOrchestrator {
    pub fn new(
        store: Arc<dyn SampleStore>,
        classifier: Option<Arc<dyn Classifier>>,
        classifier_timeout: Duration,
        leads_off_policy: LeadsOffPolicy,
        logger: Logger,
    ) -> Self {
        Self {
            store,
            classifier,
            classifier_timeout,
            leads_off_policy,
            logger,
        }
    }

    pub fn has_classifier(&self) -> bool {
        self.classifier.is_some()
    }

    /// Loads the session's samples, runs the local pipeline, consults the
    /// external classifier if configured, and stores the merged report.
    pub async fn analyze_session(&self, session_id: &str) -> Result<AnalysisReport> {
        let session = self
            .store
            .session(session_id)
            .await?
            .ok_or_else(|| CoreError::SessionNotFound(session_id.to_string()))?;
        let samples = self.usable_samples(self.store.load_samples(session_id).await?);
        let data_stats = DataStats::new(samples.len(), session.sample_rate);
        let signal: Array1<f64> = samples.iter().map(|s| s.voltage).collect();

        let analysis = Analysis::new(Parameters::for_rate(session.sample_rate));
        let report = match analysis.analyze(signal.view()) {
            Ok(local) => {
                let external = self.consult_classifier(session_id, &samples, session.sample_rate).await;
                let available = external.is_some();
                AnalysisReport::merge(session_id, &local, data_stats, external, available)
            }
            Err(CoreError::InsufficientData { got, needed }) => {
                info!(self.logger, "not enough samples to analyze"; "session_id" => session_id, "got" => got, "needed" => needed);
                AnalysisReport::insufficient(session_id, data_stats, quality::assess(signal.view()))
            }
            Err(e) => return Err(e),
        };

        // The report is returned even if the audit write fails.
        if let Err(e) = self.store.save_report(report.clone()).await {
            error!(self.logger, "failed to persist report"; "session_id" => session_id, "error" => %e);
        }
        info!(self.logger, "session analyzed";
            "session_id" => session_id,
            "classification" => &report.classification,
            "external" => report.external_service_available);
        Ok(report)
    }

    pub async fn analyze_batch(&self, session_ids: &[String]) -> Vec<BatchEntry> {
        let mut results = Vec::with_capacity(session_ids.len());
        for session_id in session_ids {
            let entry = match self.analyze_session(session_id).await {
                Ok(report) => BatchEntry::Report(Box::new(report)),
                Err(e) => BatchEntry::Failed {
                    session_id: session_id.clone(),
                    error: e.to_string(),
                },
            };
            results.push(entry);
        }
        results
    }

    fn usable_samples(&self, samples: Vec<StoredSample>) -> Vec<StoredSample> {
        match self.leads_off_policy {
            LeadsOffPolicy::Keep => samples,
            LeadsOffPolicy::Exclude => samples.into_iter().filter(|s| !s.leads_off).collect(),
        }
    }

    /// `None` when no classifier is configured or it failed to answer in time.
    async fn consult_classifier(
        &self,
        session_id: &str,
        samples: &[StoredSample],
        sample_rate: f64,
    ) -> Option<ExternalClassification> {
        let classifier = self.classifier.as_ref()?;
        let request = ClassificationRequest {
            session_id: session_id.to_string(),
            ecg_data: samples
                .iter()
                .map(|s| ClassifierSample {
                    timestamp_ms: s.timestamp,
                    voltage_mv: s.voltage,
                })
                .collect(),
            sample_rate,
        };

        let outcome = match tokio::time::timeout(self.classifier_timeout, classifier.classify(&request)).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::Timeout(self.classifier_timeout)),
        };
        match outcome {
            Ok(classification) => Some(classification),
            Err(e) => {
                warn!(self.logger, "external classifier unavailable, using rule-based result";
                    "session_id" => session_id, "error" => %e);
                None
            }
        }
    }
}
