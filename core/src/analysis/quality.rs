use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

/// Below this standard deviation (mV) the trace is considered flat.
pub const FLAT_STD_MV: f64 = 0.01;
/// Above this standard deviation (mV) the trace is considered noise.
pub const NOISY_STD_MV: f64 = 5.0;
/// Standard deviation (mV) a clean single-lead trace typically shows.
pub const TARGET_STD_MV: f64 = 0.3;
/// Width of the score bell, in natural-log units around the target.
const SCORE_WIDTH: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityStatus {
    Excellent,
    Good,
    Fair,
    Poor,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalQuality {
    pub score: f64,
    pub status: QualityStatus,
}

impl SignalQuality {
    pub fn from_score(score: f64) -> Self {
        let status = if score >= 0.8 {
            QualityStatus::Excellent
        } else if score >= 0.6 {
            QualityStatus::Good
        } else if score >= 0.4 {
            QualityStatus::Fair
        } else {
            QualityStatus::Poor
        };
        Self {
            score: (score * 1000.0).round() / 1000.0,
            status,
        }
    }

    pub fn poor() -> Self {
        Self::from_score(0.0)
    }
}

/// Scores a raw voltage trace by how close its spread is to `TARGET_STD_MV`.
pub fn assess(signal: ArrayView1<f64>) -> SignalQuality {
    if signal.is_empty() {
        return SignalQuality::poor();
    }
    let std = signal.std(0.0);
    if !std.is_finite() {
        return SignalQuality::poor();
    }
    if std < FLAT_STD_MV {
        return SignalQuality::from_score(0.1);
    }
    if std > NOISY_STD_MV {
        return SignalQuality::from_score(0.2);
    }

    let distance = (std / TARGET_STD_MV).ln();
    SignalQuality::from_score((-(distance * distance) / (2.0 * SCORE_WIDTH * SCORE_WIDTH)).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    #[test]
    fn flat_trace_is_poor() {
        let q = assess(Array1::from_elem(500, 1.2).view());
        assert_eq!(q.status, QualityStatus::Poor);
    }

    #[test]
    fn noisy_trace_is_poor() {
        let noisy = Array1::from_shape_fn(500, |i| if i % 2 == 0 { 20.0 } else { -20.0 });
        assert_eq!(assess(noisy.view()).status, QualityStatus::Poor);
    }

    #[test]
    fn target_spread_is_excellent() {
        let square = Array1::from_shape_fn(500, |i| if i % 2 == 0 { 0.3 } else { -0.3 });
        let q = assess(square.view());
        assert_eq!(q.status, QualityStatus::Excellent);
        assert!((q.score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn empty_trace_is_poor() {
        assert_eq!(assess(Array1::<f64>::zeros(0).view()), SignalQuality::poor());
    }
}
