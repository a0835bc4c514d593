//! In-process fake devices, for running the server without hardware.

use std::sync::Arc;

use serde_json::json;
use slog::{debug, info, Logger};
use tokio::time::{interval, Duration, MissedTickBehavior};

use super::protocol::GatewayMessage;
use super::DeviceGateway;

const BATCH_LEN: usize = 25;
const HEARTBEAT_EVERY: Duration = Duration::from_secs(30);

/// Gaussian bump centered at `center` seconds.
fn wave(t: f64, center: f64, height: f64, width: f64) -> f64 {
    height * (-((t - center) * (t - center)) / (2.0 * width * width)).exp()
}

/// One heartbeat of a lead-II-like trace, `t` seconds after the R wave, in mV.
fn beat(t: f64) -> f64 {
    wave(t, -0.16, 0.1, 0.025) // P
        + wave(t, -0.025, -0.1, 0.008) // Q
        + wave(t, 0.0, 1.0, 0.010) // R
        + wave(t, 0.025, -0.1, 0.008) // S
        + wave(t, 0.25, 0.15, 0.05) // T
}

/// Value at `time` seconds of a trace beating at `bpm`, with the first R
/// wave half a period in.
pub fn ecg_value(time: f64, bpm: f64) -> f64 {
    let period = 60.0 / bpm;
    let phase = (time - period / 2.0).rem_euclid(period);
    // neighbours bleed into each other at high rates
    beat(phase) + beat(phase - period) + beat(phase + period)
}

/// `secs` seconds of synthetic ECG at `fs` Hz with uniform noise of up to `noise_mv`.
pub fn synthetic_ecg(fs: f64, bpm: f64, secs: f64, noise_mv: f64) -> Vec<f64> {
    let n = (fs * secs).round() as usize;
    (0..n)
        .map(|i| {
            let noise = if noise_mv > 0.0 {
                rand::random::<f64>() * 2.0 * noise_mv - noise_mv
            } else {
                0.0
            };
            ecg_value(i as f64 / fs, bpm) + noise
        })
        .collect()
}

/// Drives one fake device through the gateway exactly like a socket would:
/// registers, heartbeats, and streams 25-sample batches while a session is
/// running.
pub async fn mock_device_loop(gateway: Arc<DeviceGateway>, index: usize, sample_rate: f64, logger: Logger) {
    let sample_rate = if sample_rate.is_finite() && sample_rate > 0.0 { sample_rate } else { 250.0 };
    let device_id = format!("mock-{index:02}");
    let logger = logger.new(slog::o!("device_id" => device_id.clone()));
    let (mut link, mut inbox) = gateway.open();

    let register = json!({
        "type": "register",
        "deviceId": device_id,
        "deviceName": format!("Mock ECG {index}"),
        "firmwareVersion": "mock-1.0.0",
        "sampleRate": sample_rate,
        "batteryLevel": 100.0,
    });
    gateway.handle_text(&mut link, &register.to_string()).await;
    info!(logger, "mock device started");

    let mut batches = interval(Duration::from_secs_f64(BATCH_LEN as f64 / sample_rate));
    batches.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut heartbeats = interval(HEARTBEAT_EVERY);
    let mut session: Option<String> = None;
    let mut sample_index: u64 = 0;
    let mut battery = 100.0_f64;

    loop {
        tokio::select! {
            message = inbox.recv() => match message {
                Some(GatewayMessage::RecordingStarted { session_id }) => {
                    info!(logger, "mock recording started"; "session_id" => &session_id);
                    session = Some(session_id);
                    sample_index = 0;
                }
                Some(GatewayMessage::RecordingStopped { session_id }) => {
                    info!(logger, "mock recording stopped"; "session_id" => &session_id);
                    session = None;
                }
                Some(other) => debug!(logger, "mock device got"; "message" => ?other),
                None => break,
            },
            _ = batches.tick() => {
                let Some(session_id) = session.as_deref() else { continue };
                let data: Vec<_> = (0..BATCH_LEN as u64)
                    .map(|k| {
                        let t = (sample_index + k) as f64 / sample_rate;
                        json!({
                            "timestamp": t * 1000.0,
                            "voltage": ecg_value(t, 75.0) + rand::random::<f64>() * 0.04 - 0.02,
                            "leads_off": false,
                            "quality_score": 95.0,
                        })
                    })
                    .collect();
                sample_index += BATCH_LEN as u64;
                let batch = json!({
                    "type": "ecg-data",
                    "sessionId": session_id,
                    "deviceId": device_id,
                    "data": data,
                });
                gateway.handle_text(&mut link, &batch.to_string()).await;
            },
            _ = heartbeats.tick() => {
                battery = (battery - 0.1).max(5.0);
                let heartbeat = json!({
                    "type": "heartbeat",
                    "deviceId": device_id,
                    "batteryLevel": battery,
                });
                gateway.handle_text(&mut link, &heartbeat.to_string()).await;
            },
        }
    }

    gateway.disconnect(&mut link).await;
}
