//! Single-lead ECG analysis: conditioning, R-peak detection and rhythm rules.

use ndarray::ArrayView1;

use crate::error::{CoreError, Result};

pub mod filter;
pub mod peaks;
pub mod quality;
pub mod rhythm;

use quality::{QualityStatus, SignalQuality};
use rhythm::{Abnormality, RhythmMetrics, Rhythm, RiskLevel};

#[derive(Debug, Clone, PartialEq)]
pub struct Parameters {
    pub sampling_frequency: f64,
    pub bandpass_frequencies: (f64, f64),
    pub integration_window_ms: f64,
    pub threshold_ratio: f64,
    pub refractory_ms: f64,
    pub min_samples: usize,
}

impl Parameters {
    pub fn for_rate(sampling_frequency: f64) -> Self {
        Self {
            sampling_frequency,
            bandpass_frequencies: (5.0, 15.0),
            integration_window_ms: 120.0,
            threshold_ratio: 0.15,
            refractory_ms: 300.0,
            min_samples: 100,
        }
    }

    pub fn integration_window(&self) -> usize {
        ((self.integration_window_ms / 1000.0 * self.sampling_frequency).round() as usize).max(1)
    }

    pub fn min_peak_distance(&self) -> usize {
        ((self.refractory_ms / 1000.0 * self.sampling_frequency).round() as usize).max(1)
    }
}

impl Default for Parameters {
    fn default() -> Self {
        Self::for_rate(250.0)
    }
}

/// Output of one local (rule-based) analysis run.
#[derive(Debug, Clone)]
pub struct Results {
    pub r_peaks: Vec<usize>,
    pub metrics: RhythmMetrics,
    pub abnormalities: Vec<Abnormality>,
    pub signal_quality: SignalQuality,
    pub classification: String,
    pub confidence: f64,
    pub risk_level: RiskLevel,
    pub rhythm: Rhythm,
}

pub struct Analysis {
    pub params: Parameters,
}

impl Analysis {
    pub fn new(params: Parameters) -> Self {
        Self { params }
    }

    pub fn analyze(&self, signal: ArrayView1<f64>) -> Result<Results> {
        if signal.len() < self.params.min_samples {
            return Err(CoreError::InsufficientData {
                got: signal.len(),
                needed: self.params.min_samples,
            });
        }
        if self.params.sampling_frequency <= 0.0 {
            return Err(CoreError::InvalidBatch(format!(
                "sample rate must be positive, got {}",
                self.params.sampling_frequency
            )));
        }

        let signal_quality = quality::assess(signal);
        let r_peaks = self.find_peaks(signal);
        let metrics = RhythmMetrics::from_peaks(&r_peaks, self.params.sampling_frequency);
        let abnormalities = rhythm::evaluate_rules(&metrics);

        let (classification, risk_level) = if metrics.rr_intervals.is_empty() {
            (rhythm::INSUFFICIENT_DATA, RiskLevel::Unknown)
        } else {
            (rhythm::classify(&abnormalities), rhythm::risk_level(&abnormalities))
        };

        Ok(Results {
            confidence: confidence(signal_quality.status, r_peaks.len()),
            rhythm: metrics.rhythm(),
            classification: classification.to_string(),
            risk_level,
            r_peaks,
            metrics,
            abnormalities,
            signal_quality,
        })
    }

    fn find_peaks(&self, signal: ArrayView1<f64>) -> Vec<usize> {
        let conditioned = filter::condition(
            signal,
            self.params.sampling_frequency,
            self.params.bandpass_frequencies,
            self.params.integration_window(),
        );
        peaks::detect_r_peaks(
            signal,
            conditioned.energy.view(),
            conditioned.offset,
            self.params.threshold_ratio,
            self.params.min_peak_distance(),
        )
    }
}

/// Confidence in the rule-based result given signal quality and beat count.
pub fn confidence(status: QualityStatus, peak_count: usize) -> f64 {
    let coverage = peak_count.min(50) as f64 / 50.0;
    let value = match status {
        QualityStatus::Excellent | QualityStatus::Good if peak_count > 10 => 0.85 + coverage * 0.15,
        QualityStatus::Fair if peak_count > 5 => 0.65 + coverage * 0.20,
        _ => 0.5,
    };
    (value * 1000.0).round() / 1000.0
}
