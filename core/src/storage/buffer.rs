//! Observer-side reconstruction of a display timeline from live batches.
//!
//! Batches carry the device's own relative clock, which means nothing to the
//! viewer. The buffer instead chains batches onto a local timeline: each new
//! sample lands one sample interval after the previous one, and the very
//! first batch is anchored at the wall-clock time it arrived.

use serde::{Deserialize, Serialize};

use super::ringbuffer::SliceableRingBuffer;
use crate::config::Calibration;
use crate::error::{CoreError, Result};
use crate::link::protocol::RawSample;

/// Last emitted display timestamp plus the spacing between samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleClock {
    last_timestamp: Option<f64>,
    interval_ms: f64,
}

impl SampleClock {
    pub fn new(sample_rate: f64) -> Result<Self> {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(CoreError::InvalidBatch(format!(
                "sample rate must be positive, got {sample_rate}"
            )));
        }
        Ok(Self {
            last_timestamp: None,
            interval_ms: 1000.0 / sample_rate,
        })
    }

    pub fn interval_ms(&self) -> f64 {
        self.interval_ms
    }

    pub fn last_timestamp(&self) -> Option<f64> {
        self.last_timestamp
    }

    /// Timestamps for the next `count` samples.
    ///
    /// `now_ms` is only consulted while the clock has no history. The result
    /// is strictly increasing and continues strictly after any earlier output.
    pub fn advance(&mut self, count: usize, now_ms: f64) -> Vec<f64> {
        if count == 0 {
            return Vec::new();
        }
        let first = match self.last_timestamp {
            Some(last) => last + self.interval_ms,
            None => now_ms,
        };
        let stamps: Vec<f64> = (0..count).map(|i| first + i as f64 * self.interval_ms).collect();
        self.last_timestamp = stamps.last().copied();
        stamps
    }

    pub fn reset(&mut self) {
        self.last_timestamp = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplaySample {
    pub timestamp: f64,
    pub voltage: f64,
    pub leads_off: bool,
}

impl Default for DisplaySample {
    fn default() -> Self {
        Self { timestamp: 0.0, voltage: 0.0, leads_off: false }
    }
}

pub struct IngestionBuffer {
    clock: SampleClock,
    samples: SliceableRingBuffer<DisplaySample>,
    calibration: Calibration,
}

impl IngestionBuffer {
    /// Buffer keeping roughly `retention_secs` of samples at `sample_rate`.
    pub fn new(sample_rate: f64, retention_secs: f64, calibration: Calibration) -> Result<Self> {
        let clock = SampleClock::new(sample_rate)?;
        let capacity = (sample_rate * retention_secs.max(0.0)).ceil() as usize;
        Ok(Self {
            clock,
            samples: SliceableRingBuffer::new(capacity, DisplaySample::default()),
            calibration,
        })
    }

    /// Appends a batch using the current wall-clock time as the anchor.
    pub fn push_batch(&mut self, batch: &[RawSample]) -> usize {
        let now_ms = chrono::Utc::now().timestamp_millis() as f64;
        self.push_batch_at(batch, now_ms)
    }

    /// Appends a batch, anchoring to `now_ms` if nothing came before.
    /// Returns how many old samples were evicted to respect the retention cap.
    pub fn push_batch_at(&mut self, batch: &[RawSample], now_ms: f64) -> usize {
        let stamps = self.clock.advance(batch.len(), now_ms);
        let mut evicted = 0;
        for (sample, timestamp) in batch.iter().zip(stamps) {
            let display = DisplaySample {
                timestamp,
                voltage: self.calibration.apply(sample.voltage),
                leads_off: sample.leads_off,
            };
            if self.samples.write(display) {
                evicted += 1;
            }
        }
        evicted
    }

    pub fn samples(&self) -> &[DisplaySample] {
        self.samples.get_slice()
    }

    /// Samples no older than `duration_ms` before the newest one.
    pub fn window(&self, duration_ms: f64) -> &[DisplaySample] {
        let count = (duration_ms / self.clock.interval_ms()).floor() as usize + 1;
        self.samples.get_slice_with_len(count)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.samples.capacity()
    }

    pub fn clock(&self) -> &SampleClock {
        &self.clock
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.clock.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(voltages: &[f64]) -> Vec<RawSample> {
        voltages
            .iter()
            .enumerate()
            .map(|(i, &voltage)| RawSample {
                timestamp: i as f64,
                voltage,
                leads_off: false,
                quality_score: None,
            })
            .collect()
    }

    #[test]
    fn first_batch_anchors_to_now() {
        let mut clock = SampleClock::new(250.0).unwrap();
        assert_eq!(clock.advance(3, 1_000.0), vec![1_000.0, 1_004.0, 1_008.0]);
    }

    #[test]
    fn later_batches_chain_on_last_timestamp() {
        let mut clock = SampleClock::new(250.0).unwrap();
        clock.advance(2, 1_000.0);
        // the anchor is ignored once the clock has history
        assert_eq!(clock.advance(2, 99_999.0), vec![1_008.0, 1_012.0]);
    }

    #[test]
    fn empty_batch_leaves_clock_alone() {
        let mut clock = SampleClock::new(100.0).unwrap();
        assert!(clock.advance(0, 5.0).is_empty());
        assert_eq!(clock.last_timestamp(), None);
    }

    #[test]
    fn invalid_rate_is_rejected() {
        assert!(SampleClock::new(0.0).is_err());
        assert!(SampleClock::new(f64::NAN).is_err());
    }

    #[test]
    fn reconstruction_is_deterministic_and_monotonic() {
        let batches: Vec<Vec<RawSample>> = (0..20).map(|_| batch(&[0.1; 25])).collect();

        let run = || {
            let mut buffer = IngestionBuffer::new(250.0, 30.0, Calibration::identity()).unwrap();
            for b in &batches {
                buffer.push_batch_at(b, 5_000.0);
            }
            buffer.samples().iter().map(|s| s.timestamp).collect::<Vec<_>>()
        };

        let first = run();
        assert_eq!(first, run());
        assert_eq!(first.len(), 500);
        assert!(first.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn retention_cap_drops_oldest() {
        let mut buffer = IngestionBuffer::new(10.0, 1.0, Calibration::identity()).unwrap();
        assert_eq!(buffer.capacity(), 10);

        let evicted = buffer.push_batch_at(&batch(&[1.0; 8]), 0.0);
        assert_eq!(evicted, 0);
        let evicted = buffer.push_batch_at(&batch(&[2.0; 8]), 0.0);
        assert_eq!(evicted, 6);

        let samples = buffer.samples();
        assert_eq!(samples.len(), 10);
        assert_eq!(samples[0].voltage, 1.0);
        assert_eq!(samples[1].voltage, 1.0);
        assert_eq!(samples[2].voltage, 2.0);
        assert_eq!(samples[0].timestamp, 600.0);
        assert_eq!(samples[9].timestamp, 1_500.0);
    }

    #[test]
    fn calibration_scales_display_voltage() {
        let mut buffer = IngestionBuffer::new(250.0, 1.0, Calibration::default()).unwrap();
        buffer.push_batch_at(&batch(&[1500.0]), 0.0);
        assert_eq!(buffer.samples()[0].voltage, 1.5);
    }

    #[test]
    fn window_returns_recent_span() {
        let mut buffer = IngestionBuffer::new(100.0, 10.0, Calibration::identity()).unwrap();
        buffer.push_batch_at(&batch(&[0.0; 50]), 0.0);
        // 100 ms at 10 ms spacing covers the newest 11 samples
        let window = buffer.window(100.0);
        assert_eq!(window.len(), 11);
        assert_eq!(window[0].timestamp, 390.0);
        assert_eq!(window[10].timestamp, 490.0);
    }
}
