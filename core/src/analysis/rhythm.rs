use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Abnormality {
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: Severity,
    pub description: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Hrv {
    pub sdnn: f64,
    pub rmssd: f64,
    pub pnn50: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rhythm {
    Regular,
    Irregular,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Unknown,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "Low",
            RiskLevel::Medium => "Medium",
            RiskLevel::High => "High",
            RiskLevel::Unknown => "Unknown",
        }
    }
}

/// Everything the rule list looks at.
#[derive(Debug, Clone, PartialEq)]
pub struct RhythmMetrics {
    pub heart_rate: f64,
    pub rr_intervals: Vec<f64>,
    pub mean_rr: f64,
    pub hrv: Hrv,
}

impl RhythmMetrics {
    pub fn from_peaks(peaks: &[usize], fs: f64) -> Self {
        let rr_intervals = rr_intervals_ms(peaks, fs);
        let mean_rr = mean(&rr_intervals);
        Self {
            heart_rate: heart_rate(&rr_intervals),
            mean_rr,
            hrv: hrv(&rr_intervals),
            rr_intervals,
        }
    }

    /// Coefficient of variation of the R-R series, in percent.
    pub fn rr_cv_percent(&self) -> Option<f64> {
        if self.rr_intervals.is_empty() || self.mean_rr <= 0.0 {
            return None;
        }
        Some(std_dev(&self.rr_intervals) / self.mean_rr * 100.0)
    }

    pub fn rhythm(&self) -> Rhythm {
        match self.rr_cv_percent() {
            Some(cv) if cv < 10.0 => Rhythm::Regular,
            Some(_) => Rhythm::Irregular,
            None => Rhythm::Unknown,
        }
    }

    /// Slowest and fastest instantaneous rate, in bpm.
    pub fn heart_rate_range(&self) -> (f64, f64) {
        let longest = self.rr_intervals.iter().cloned().fold(f64::NAN, f64::max);
        let shortest = self.rr_intervals.iter().cloned().fold(f64::NAN, f64::min);
        if longest.is_nan() || shortest <= 0.0 {
            return (0.0, 0.0);
        }
        (round2(60_000.0 / longest), round2(60_000.0 / shortest))
    }
}

pub fn rr_intervals_ms(peaks: &[usize], fs: f64) -> Vec<f64> {
    if fs <= 0.0 {
        return Vec::new();
    }
    peaks
        .windows(2)
        .map(|w| (w[1] as f64 - w[0] as f64) / fs * 1000.0)
        .collect()
}

/// `round(60000 / mean(rr))`, or 0 without at least one interval.
pub fn heart_rate(rr_intervals: &[f64]) -> f64 {
    let m = mean(rr_intervals);
    if m <= 0.0 {
        return 0.0;
    }
    (60_000.0 / m).round()
}

pub fn hrv(rr_intervals: &[f64]) -> Hrv {
    let diffs: Vec<f64> = rr_intervals.windows(2).map(|w| w[1] - w[0]).collect();
    let rmssd = if diffs.is_empty() {
        0.0
    } else {
        (diffs.iter().map(|d| d * d).sum::<f64>() / diffs.len() as f64).sqrt()
    };
    let pnn50 = if diffs.is_empty() {
        0.0
    } else {
        diffs.iter().filter(|d| d.abs() > 50.0).count() as f64 / diffs.len() as f64 * 100.0
    };

    Hrv {
        sdnn: std_dev(rr_intervals),
        rmssd,
        pnn50,
    }
}

impl Hrv {
    pub fn rounded(&self) -> Self {
        Self {
            sdnn: round2(self.sdnn),
            rmssd: round2(self.rmssd),
            pnn50: round2(self.pnn50),
        }
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// One independent check in the arrhythmia rule list.
pub struct Rule {
    pub name: &'static str,
    pub evaluate: fn(&RhythmMetrics) -> Option<Abnormality>,
}

pub const RULES: &[Rule] = &[
    Rule { name: "bradycardia", evaluate: bradycardia },
    Rule { name: "tachycardia", evaluate: tachycardia },
    Rule { name: "irregular-rhythm", evaluate: irregular_rhythm },
    Rule { name: "atrial-fibrillation", evaluate: atrial_fibrillation },
    Rule { name: "premature-ventricular", evaluate: premature_ventricular },
];

/// Runs every rule once and concatenates whatever fired.
pub fn evaluate_rules(metrics: &RhythmMetrics) -> Vec<Abnormality> {
    RULES.iter().filter_map(|rule| (rule.evaluate)(metrics)).collect()
}

pub const BRADYCARDIA: &str = "Bradycardia";
pub const TACHYCARDIA: &str = "Tachycardia";
pub const IRREGULAR_RHYTHM: &str = "Irregular Rhythm";
pub const ATRIAL_FIBRILLATION: &str = "Possible Atrial Fibrillation";
pub const PREMATURE_VENTRICULAR: &str = "Premature Ventricular Contractions";

fn bradycardia(m: &RhythmMetrics) -> Option<Abnormality> {
    (m.heart_rate > 0.0 && m.heart_rate < 60.0).then(|| Abnormality {
        kind: BRADYCARDIA.to_string(),
        severity: Severity::Low,
        description: format!("Heart rate {:.0} BPM is below 60 BPM", m.heart_rate),
    })
}

fn tachycardia(m: &RhythmMetrics) -> Option<Abnormality> {
    (m.heart_rate > 100.0).then(|| Abnormality {
        kind: TACHYCARDIA.to_string(),
        severity: if m.heart_rate > 120.0 { Severity::High } else { Severity::Medium },
        description: format!("Heart rate {:.0} BPM is above 100 BPM", m.heart_rate),
    })
}

fn irregular_rhythm(m: &RhythmMetrics) -> Option<Abnormality> {
    (m.hrv.sdnn > 100.0).then(|| Abnormality {
        kind: IRREGULAR_RHYTHM.to_string(),
        severity: Severity::Medium,
        description: format!("High heart rate variability (SDNN {:.1} ms)", m.hrv.sdnn),
    })
}

fn atrial_fibrillation(m: &RhythmMetrics) -> Option<Abnormality> {
    if m.rr_intervals.is_empty() || m.mean_rr <= 0.0 {
        return None;
    }
    let deviating = m
        .rr_intervals
        .iter()
        .filter(|rr| ((*rr - m.mean_rr) / m.mean_rr).abs() > 0.2)
        .count();
    let fraction = deviating as f64 / m.rr_intervals.len() as f64;

    (fraction > 0.3).then(|| Abnormality {
        kind: ATRIAL_FIBRILLATION.to_string(),
        severity: Severity::High,
        description: format!(
            "{:.0}% of R-R intervals deviate more than 20% from their mean",
            fraction * 100.0
        ),
    })
}

fn premature_ventricular(m: &RhythmMetrics) -> Option<Abnormality> {
    if m.rr_intervals.len() <= 3 {
        return None;
    }
    let sd = std_dev(&m.rr_intervals);
    if sd == 0.0 {
        return None;
    }
    let outliers = m
        .rr_intervals
        .iter()
        .filter(|rr| (*rr - m.mean_rr).abs() > 2.0 * sd)
        .count();
    let percentage = outliers as f64 / m.rr_intervals.len() as f64 * 100.0;

    (percentage > 10.0).then(|| Abnormality {
        kind: PREMATURE_VENTRICULAR.to_string(),
        severity: Severity::Medium,
        description: format!("Frequent ectopic beats ({outliers} beats, {percentage:.1}%)"),
    })
}

pub fn risk_level(abnormalities: &[Abnormality]) -> RiskLevel {
    match abnormalities.iter().map(|a| a.severity).max() {
        Some(Severity::High) => RiskLevel::High,
        Some(Severity::Medium) => RiskLevel::Medium,
        _ => RiskLevel::Low,
    }
}

pub const NORMAL_SINUS_RHYTHM: &str = "Normal Sinus Rhythm";
pub const INSUFFICIENT_DATA: &str = "Insufficient Data";

/// Headline label for a set of flags.
pub fn classify(abnormalities: &[Abnormality]) -> &'static str {
    let has = |kind: &str| abnormalities.iter().any(|a| a.kind == kind);
    if has(ATRIAL_FIBRILLATION) {
        "Atrial Fibrillation (Suspected)"
    } else if has(TACHYCARDIA) {
        "Sinus Tachycardia"
    } else if has(BRADYCARDIA) {
        "Sinus Bradycardia"
    } else if has(IRREGULAR_RHYTHM) {
        "Sinus Arrhythmia"
    } else if has(PREMATURE_VENTRICULAR) {
        PREMATURE_VENTRICULAR
    } else {
        NORMAL_SINUS_RHYTHM
    }
}

pub fn recommendations(classification: &str, risk: RiskLevel) -> Vec<String> {
    let mut out: Vec<&str> = Vec::new();

    if risk == RiskLevel::High {
        out.push("Consult a cardiologist as soon as possible");
        out.push("Consider wearing a continuous heart monitor");
    }
    if classification.contains("Tachycardia") {
        out.push("Practice relaxation techniques and reduce stress");
        out.push("Limit caffeine and stimulant intake");
        out.push("Review medications with your doctor");
    }
    if classification.contains("Bradycardia") {
        out.push("Monitor for symptoms like dizziness or fatigue");
        out.push("Discuss exercise tolerance with your doctor");
    }
    if classification.contains("Fibrillation") {
        out.push("Anticoagulation therapy may be needed, consult a doctor");
        out.push("Regular ECG monitoring recommended");
        out.push("Avoid alcohol and excessive caffeine");
    }
    if classification == NORMAL_SINUS_RHYTHM {
        out.push("Heart rhythm is normal");
        out.push("Continue regular exercise and healthy diet");
        out.push("Monitor periodically for baseline comparison");
    }
    if classification == INSUFFICIENT_DATA {
        out.push("Record a longer session with good electrode contact");
    }

    out.into_iter().map(String::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics_with_rate(heart_rate: f64) -> RhythmMetrics {
        RhythmMetrics {
            heart_rate,
            rr_intervals: vec![60_000.0 / heart_rate.max(1.0); 5],
            mean_rr: 60_000.0 / heart_rate.max(1.0),
            hrv: Hrv::default(),
        }
    }

    fn kinds(metrics: &RhythmMetrics) -> Vec<String> {
        evaluate_rules(metrics).into_iter().map(|a| a.kind).collect()
    }

    #[test]
    fn intervals_are_one_shorter_than_peaks() {
        assert_eq!(rr_intervals_ms(&[], 250.0).len(), 0);
        assert_eq!(rr_intervals_ms(&[10], 250.0).len(), 0);
        assert_eq!(rr_intervals_ms(&[0, 200, 400, 650], 250.0), vec![800.0, 800.0, 1000.0]);
    }

    #[test]
    fn heart_rate_needs_two_peaks() {
        assert_eq!(RhythmMetrics::from_peaks(&[], 250.0).heart_rate, 0.0);
        assert_eq!(RhythmMetrics::from_peaks(&[42], 250.0).heart_rate, 0.0);
        assert_eq!(RhythmMetrics::from_peaks(&[0, 200, 400], 250.0).heart_rate, 75.0);
    }

    #[test]
    fn constant_intervals_have_zero_variability() {
        let h = hrv(&[800.0; 12]);
        assert_eq!(h, Hrv { sdnn: 0.0, rmssd: 0.0, pnn50: 0.0 });
    }

    #[test]
    fn hrv_of_alternating_series() {
        let h = hrv(&[800.0, 900.0, 800.0, 900.0]);
        assert!((h.sdnn - 50.0).abs() < 1e-9);
        assert!((h.rmssd - 100.0).abs() < 1e-9);
        assert!((h.pnn50 - 100.0).abs() < 1e-9);
    }

    #[test]
    fn bradycardia_boundary() {
        assert!(!kinds(&metrics_with_rate(60.0)).contains(&BRADYCARDIA.to_string()));
        assert!(kinds(&metrics_with_rate(59.0)).contains(&BRADYCARDIA.to_string()));
        assert!(!kinds(&metrics_with_rate(0.0)).contains(&BRADYCARDIA.to_string()));
    }

    #[test]
    fn tachycardia_boundary_and_severity() {
        assert!(!kinds(&metrics_with_rate(100.0)).contains(&TACHYCARDIA.to_string()));

        let flags = evaluate_rules(&metrics_with_rate(101.0));
        let tachy = flags.iter().find(|a| a.kind == TACHYCARDIA).unwrap();
        assert_eq!(tachy.severity, Severity::Medium);

        let flags = evaluate_rules(&metrics_with_rate(121.0));
        let tachy = flags.iter().find(|a| a.kind == TACHYCARDIA).unwrap();
        assert_eq!(tachy.severity, Severity::High);
    }

    #[test]
    fn rules_are_additive() {
        let rr = vec![400.0, 900.0, 400.0, 950.0, 420.0, 880.0];
        let metrics = RhythmMetrics {
            heart_rate: 110.0,
            mean_rr: mean(&rr),
            hrv: hrv(&rr),
            rr_intervals: rr,
        };
        let found = kinds(&metrics);
        assert!(found.contains(&TACHYCARDIA.to_string()));
        assert!(found.contains(&IRREGULAR_RHYTHM.to_string()));
        assert!(found.contains(&ATRIAL_FIBRILLATION.to_string()));
        assert_eq!(classify(&evaluate_rules(&metrics)), "Atrial Fibrillation (Suspected)");
        assert_eq!(risk_level(&evaluate_rules(&metrics)), RiskLevel::High);
    }

    #[test]
    fn single_outlier_flags_ectopy() {
        let mut rr = vec![800.0; 8];
        rr.push(400.0);
        let metrics = RhythmMetrics {
            heart_rate: heart_rate(&rr),
            mean_rr: mean(&rr),
            hrv: hrv(&rr),
            rr_intervals: rr,
        };
        assert!(kinds(&metrics).contains(&PREMATURE_VENTRICULAR.to_string()));
    }

    #[test]
    fn regular_rhythm_is_normal() {
        let metrics = metrics_with_rate(75.0);
        assert!(evaluate_rules(&metrics).is_empty());
        assert_eq!(metrics.rhythm(), Rhythm::Regular);
        assert_eq!(classify(&[]), NORMAL_SINUS_RHYTHM);
        assert_eq!(risk_level(&[]), RiskLevel::Low);
        assert_eq!(metrics.heart_rate_range(), (75.0, 75.0));
    }
}
