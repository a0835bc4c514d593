use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use slog::{error, info};

use hwcore::config::{Calibration, Config, LeadsOffPolicy};
use hwcore::log::create_logger;
use hwcore::storage::MemoryStore;
use hwcore::{server, HwCore};

/// ECG acquisition gateway and analysis service
#[derive(Parser, Debug)]
#[command(name = "hwcore-server")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "HWCORE_BIND", default_value = "0.0.0.0:3001")]
    bind: SocketAddr,

    /// Sample rate assumed for devices that do not report one (Hz)
    #[arg(long, env = "HWCORE_SAMPLE_RATE", default_value_t = 250.0)]
    sample_rate: f64,

    /// Largest accepted ecg-data batch
    #[arg(long, env = "HWCORE_MAX_BATCH", default_value_t = 250)]
    max_batch: usize,

    /// Seconds of samples kept for live display
    #[arg(long, env = "HWCORE_RETENTION_SECS", default_value_t = 30.0)]
    retention_secs: f64,

    /// Base URL of the external classification service
    #[arg(long, env = "HWCORE_CLASSIFIER_URL")]
    classifier_url: Option<String>,

    /// Timeout for one classifier call, in seconds
    #[arg(long, env = "HWCORE_CLASSIFIER_TIMEOUT_SECS", default_value_t = 10)]
    classifier_timeout_secs: u64,

    /// Analyze samples flagged as leads-off instead of dropping them
    #[arg(long, env = "HWCORE_KEEP_LEADS_OFF")]
    keep_leads_off: bool,

    /// Divisor applied to voltages for live display
    #[arg(long, env = "HWCORE_VOLTAGE_DIVISOR", default_value_t = 1000.0)]
    voltage_divisor: f64,

    /// Number of simulated devices to start
    #[arg(long, env = "HWCORE_MOCK_DEVICES", default_value_t = 0)]
    mock_devices: usize,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Config {
            bind_addr: args.bind,
            default_sample_rate: args.sample_rate,
            max_batch_len: args.max_batch,
            retention_secs: args.retention_secs,
            classifier_url: args.classifier_url.filter(|url| !url.trim().is_empty()),
            classifier_timeout: Duration::from_secs(args.classifier_timeout_secs),
            leads_off_policy: if args.keep_leads_off {
                LeadsOffPolicy::Keep
            } else {
                LeadsOffPolicy::Exclude
            },
            calibration: Calibration {
                voltage_divisor: args.voltage_divisor,
            },
            mock_devices: args.mock_devices,
        }
    }
}

#[tokio::main]
async fn main() {
    let logger = create_logger("server");
    let config = Config::from(Args::parse());
    info!(logger, "starting";
        "bind" => %config.bind_addr,
        "sample_rate" => config.default_sample_rate,
        "classifier" => config.classifier_url.as_deref().unwrap_or("none"));

    let core = match HwCore::new(config, Arc::new(MemoryStore::new()), logger.clone()) {
        Ok(core) => Arc::new(core),
        Err(e) => {
            error!(logger, "failed to start"; "error" => %e);
            std::process::exit(1);
        }
    };
    let _mocks = core.start_mock_devices();
    server::serve(core).await;
}
