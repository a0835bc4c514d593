use ndarray::{s, Array1, ArrayView1};

/// Number of samples the five-point derivative drops at each end of the series.
pub const DERIVATIVE_EDGE: usize = 2;

/// Centered moving average that keeps the input length.
///
/// Near the edges the window is clipped to the available samples, so the
/// output stays aligned with the input index for index.
pub fn moving_average(data: ArrayView1<f64>, window_size: usize) -> Array1<f64> {
    let n = data.len();
    if n == 0 || window_size <= 1 {
        return data.to_owned();
    }

    let mut prefix = Vec::with_capacity(n + 1);
    prefix.push(0.0);
    for &x in data.iter() {
        let last = prefix[prefix.len() - 1];
        prefix.push(last + x);
    }

    let before = (window_size - 1) / 2;
    let after = window_size - 1 - before;

    Array1::from_shape_fn(n, |i| {
        let start = i.saturating_sub(before);
        let end = (i + after).min(n - 1);
        (prefix[end + 1] - prefix[start]) / (end + 1 - start) as f64
    })
}

/// Window length for a moving-average stage approximating `cutoff_hz` at `fs`.
pub fn window_for_cutoff(fs: f64, cutoff_hz: f64) -> usize {
    if cutoff_hz <= 0.0 {
        return 1;
    }
    ((fs / cutoff_hz).round() as usize).max(1)
}

/// Lowpass then highpass, both built from moving averages.
pub fn bandpass_filter(data: ArrayView1<f64>, lowcut: f64, highcut: f64, fs: f64) -> Array1<f64> {
    let low_window = window_for_cutoff(fs, highcut);
    let high_window = window_for_cutoff(fs, lowcut);

    let lowpassed = moving_average(data, low_window);
    let baseline = moving_average(lowpassed.view(), high_window);
    lowpassed - baseline
}

/// Five-point derivative `(-x[i-2] - 2x[i-1] + 2x[i+1] + x[i+2]) / 8`.
///
/// Only interior samples are defined, so the output is `DERIVATIVE_EDGE`
/// samples shorter at each end. Output index `j` belongs to input index
/// `j + DERIVATIVE_EDGE`.
pub fn five_point_derivative(data: ArrayView1<f64>) -> Array1<f64> {
    let n = data.len();
    if n < 2 * DERIVATIVE_EDGE + 1 {
        return Array1::zeros(0);
    }

    let out_len = n - 2 * DERIVATIVE_EDGE;
    Array1::from_shape_fn(out_len, |j| {
        let i = j + DERIVATIVE_EDGE;
        (-data[i - 2] - 2.0 * data[i - 1] + 2.0 * data[i + 1] + data[i + 2]) / 8.0
    })
}

pub fn square(data: ArrayView1<f64>) -> Array1<f64> {
    data.mapv(|x| x * x)
}

pub fn moving_window_integration(data: ArrayView1<f64>, window_size: usize) -> Array1<f64> {
    moving_average(data, window_size)
}

/// Energy series plus the offset that maps its indices back onto the input.
pub struct Conditioned {
    pub energy: Array1<f64>,
    pub offset: usize,
}

/// Full conditioning chain: bandpass, derivative, squaring, integration.
pub fn condition(
    signal: ArrayView1<f64>,
    fs: f64,
    band: (f64, f64),
    integration_window: usize,
) -> Conditioned {
    let (low, high) = band;
    let filtered = bandpass_filter(signal, low, high, fs);
    let derivative = five_point_derivative(filtered.view());
    let squared = square(derivative.view());
    let energy = moving_window_integration(squared.view(), integration_window);

    Conditioned {
        energy,
        offset: DERIVATIVE_EDGE,
    }
}

/// Maps an inclusive energy-index region back to the input signal, clipped to `len`.
pub fn region_in_signal(start: usize, end: usize, offset: usize, len: usize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let from = (start + offset).min(len - 1);
    let to = (end + offset).min(len - 1);
    Some((from, to))
}

/// Index of the maximum of `signal[from..=to]`.
pub fn argmax_in(signal: ArrayView1<f64>, from: usize, to: usize) -> Option<usize> {
    if from > to || to >= signal.len() {
        return None;
    }
    signal
        .slice(s![from..=to])
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, bv)) if bv >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| from + i)
}
