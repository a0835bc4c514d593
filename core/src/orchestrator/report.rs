use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::classifier::ExternalClassification;
use crate::analysis::quality::SignalQuality;
use crate::analysis::rhythm::{self, Abnormality, Hrv, Rhythm, RiskLevel};
use crate::analysis::Results;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisType {
    /// Rule-based metrics merged with an external classification.
    Hybrid,
    /// External classifier absent or unavailable.
    RuleBased,
    InsufficientData,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeartRateRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicMetrics {
    pub heart_rate: f64,
    pub r_peak_count: usize,
    #[serde(rename = "avgRRInterval")]
    pub avg_rr_interval: f64,
    pub hrv: Hrv,
    pub signal_quality: SignalQuality,
    pub rhythm: Rhythm,
    pub heart_rate_range: HeartRateRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataStats {
    pub total_points: usize,
    /// Seconds.
    pub duration: f64,
    pub sampling_rate: f64,
}

impl DataStats {
    pub fn new(total_points: usize, sampling_rate: f64) -> Self {
        let duration = if sampling_rate > 0.0 {
            rhythm::round2(total_points as f64 / sampling_rate)
        } else {
            0.0
        };
        Self {
            total_points,
            duration,
            sampling_rate,
        }
    }
}

/// The local result as computed, kept next to whatever headline was chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleBasedSummary {
    pub classification: String,
    pub confidence: f64,
    pub risk_level: RiskLevel,
}

/// One analysis run over a session. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub session_id: String,
    pub classification: String,
    pub confidence: f64,
    pub risk_level: String,
    pub basic_metrics: BasicMetrics,
    pub arrhythmias: Vec<Abnormality>,
    pub recommendations: Vec<String>,
    pub data_stats: DataStats,
    pub external_service_available: bool,
    pub external_classification: Option<ExternalClassification>,
    pub rule_based: RuleBasedSummary,
    pub analysis_type: AnalysisType,
    pub created_at: DateTime<Utc>,
}

impl AnalysisReport {
    /// Builds the report from local results, letting a successful external
    /// classification take over the headline fields.
    pub fn merge(
        session_id: &str,
        local: &Results,
        data_stats: DataStats,
        external: Option<ExternalClassification>,
        external_service_available: bool,
    ) -> Self {
        let rule_based = RuleBasedSummary {
            classification: local.classification.clone(),
            confidence: local.confidence,
            risk_level: local.risk_level,
        };

        let (classification, confidence, risk_level, analysis_type) = match &external {
            Some(ext) => (
                ext.classification.clone(),
                ext.confidence,
                ext.risk_level.clone(),
                AnalysisType::Hybrid,
            ),
            None => (
                local.classification.clone(),
                local.confidence,
                local.risk_level.as_str().to_string(),
                AnalysisType::RuleBased,
            ),
        };
        let recommendations = rhythm::recommendations(&local.classification, local.risk_level);
        let (min, max) = local.metrics.heart_rate_range();

        Self {
            session_id: session_id.to_string(),
            classification,
            confidence,
            risk_level,
            basic_metrics: BasicMetrics {
                heart_rate: local.metrics.heart_rate,
                r_peak_count: local.r_peaks.len(),
                avg_rr_interval: rhythm::round2(local.metrics.mean_rr),
                hrv: local.metrics.hrv.rounded(),
                signal_quality: local.signal_quality,
                rhythm: local.rhythm,
                heart_rate_range: HeartRateRange { min, max },
            },
            arrhythmias: local.abnormalities.clone(),
            recommendations,
            data_stats,
            external_service_available,
            external_classification: external,
            rule_based,
            analysis_type,
            created_at: Utc::now(),
        }
    }

    /// Report for a session with too few samples to say anything.
    pub fn insufficient(session_id: &str, data_stats: DataStats, signal_quality: SignalQuality) -> Self {
        Self {
            session_id: session_id.to_string(),
            classification: rhythm::INSUFFICIENT_DATA.to_string(),
            confidence: 0.0,
            risk_level: RiskLevel::Unknown.as_str().to_string(),
            basic_metrics: BasicMetrics {
                heart_rate: 0.0,
                r_peak_count: 0,
                avg_rr_interval: 0.0,
                hrv: Hrv::default(),
                signal_quality,
                rhythm: Rhythm::Unknown,
                heart_rate_range: HeartRateRange { min: 0.0, max: 0.0 },
            },
            arrhythmias: Vec::new(),
            recommendations: rhythm::recommendations(rhythm::INSUFFICIENT_DATA, RiskLevel::Unknown),
            data_stats,
            external_service_available: false,
            external_classification: None,
            rule_based: RuleBasedSummary {
                classification: rhythm::INSUFFICIENT_DATA.to_string(),
                confidence: 0.0,
                risk_level: RiskLevel::Unknown,
            },
            analysis_type: AnalysisType::InsufficientData,
            created_at: Utc::now(),
        }
    }
}
