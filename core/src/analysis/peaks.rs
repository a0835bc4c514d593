use ndarray::ArrayView1;
use ndarray_stats::QuantileExt;

use super::filter::{argmax_in, region_in_signal};

/// Energy spans at or below `(SPAN_FLOOR * peak amplitude)^2` are rounding
/// residue of a flat input, not beats.
const SPAN_FLOOR: f64 = 1e-9;

/// Adaptive threshold `min + ratio * (max - min)` over the energy series.
///
/// `None` when the series is empty or spans no more than `min_span`.
pub fn adaptive_threshold(energy: ArrayView1<f64>, ratio: f64, min_span: f64) -> Option<f64> {
    let min = *energy.min().ok()?;
    let max = *energy.max().ok()?;
    if max - min <= min_span {
        return None;
    }
    Some(min + ratio * (max - min))
}

/// Smallest energy span worth thresholding for `signal`.
fn span_floor(signal: ArrayView1<f64>) -> f64 {
    let amplitude = signal.iter().fold(0.0_f64, |acc, &v| acc.max(v.abs()));
    (SPAN_FLOOR * amplitude).powi(2)
}

/// Inclusive index ranges where `energy` stays strictly above `threshold`.
///
/// A region still open at the end of the series is closed at the last index.
pub fn regions_above(energy: ArrayView1<f64>, threshold: f64) -> Vec<(usize, usize)> {
    let mut regions = Vec::new();
    let mut open: Option<usize> = None;

    for (i, &e) in energy.iter().enumerate() {
        match (open, e > threshold) {
            (None, true) => open = Some(i),
            (Some(start), false) => {
                regions.push((start, i - 1));
                open = None;
            }
            _ => {}
        }
    }
    if let Some(start) = open {
        regions.push((start, energy.len() - 1));
    }
    regions
}

/// Locates R-peaks in `signal` from its conditioned `energy` series.
///
/// Each region above the adaptive threshold contributes the index of the
/// largest raw sample inside it. A candidate closer than `min_distance`
/// samples to the previously accepted peak is dropped whatever its amplitude.
pub fn detect_r_peaks(
    signal: ArrayView1<f64>,
    energy: ArrayView1<f64>,
    offset: usize,
    threshold_ratio: f64,
    min_distance: usize,
) -> Vec<usize> {
    let threshold = match adaptive_threshold(energy, threshold_ratio, span_floor(signal)) {
        Some(t) => t,
        None => return Vec::new(),
    };

    let mut peaks: Vec<usize> = Vec::new();
    for (start, end) in regions_above(energy, threshold) {
        let Some((from, to)) = region_in_signal(start, end, offset, signal.len()) else {
            continue;
        };
        let Some(candidate) = argmax_in(signal, from, to) else {
            continue;
        };

        match peaks.last() {
            Some(&last) if candidate < last.saturating_add(min_distance) => {}
            _ => peaks.push(candidate),
        }
    }
    peaks
}
