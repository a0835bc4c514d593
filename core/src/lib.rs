use std::sync::Arc;

use slog::{info, Logger};
use tokio::task::JoinHandle;

pub mod analysis;
pub mod config;
pub mod error;
pub mod link;
pub mod log;
pub mod orchestrator;
pub mod router;
pub mod server;
pub mod sessions;
pub mod storage;

use config::Config;
use error::Result;
use link::registry::DeviceRegistry;
use link::DeviceGateway;
use orchestrator::classifier::{Classifier, HttpClassifier};
use orchestrator::AnalysisOrchestrator;
use router::SessionRouter;
use sessions::SessionService;
use storage::buffer::IngestionBuffer;
use storage::SampleStore;

/// All long-lived components of the acquisition pipeline, wired together.
pub struct HwCore {
    pub config: Config,
    pub store: Arc<dyn SampleStore>,
    pub router: Arc<SessionRouter>,
    pub gateway: Arc<DeviceGateway>,
    pub sessions: Arc<SessionService>,
    pub orchestrator: Arc<AnalysisOrchestrator>,
    logger: Logger,
}

impl HwCore {
    /// Builds the pipeline, with an HTTP classifier if one is configured.
    pub fn new(config: Config, store: Arc<dyn SampleStore>, logger: Logger) -> Result<Self> {
        let classifier = match &config.classifier_url {
            Some(url) => Some(Arc::new(HttpClassifier::new(url, config.classifier_timeout)?) as Arc<dyn Classifier>),
            None => None,
        };
        Ok(Self::with_classifier(config, store, classifier, logger))
    }

    pub fn with_classifier(
        config: Config,
        store: Arc<dyn SampleStore>,
        classifier: Option<Arc<dyn Classifier>>,
        logger: Logger,
    ) -> Self {
        let router = Arc::new(SessionRouter::new(logger.new(slog::o!("part" => "router"))));
        let gateway = Arc::new(DeviceGateway::new(
            Arc::new(DeviceRegistry::new()),
            router.clone(),
            store.clone(),
            config.max_batch_len,
            config.default_sample_rate,
            logger.new(slog::o!("part" => "gateway")),
        ));
        let sessions = Arc::new(SessionService::new(
            store.clone(),
            gateway.clone(),
            router.clone(),
            config.default_sample_rate,
            logger.new(slog::o!("part" => "sessions")),
        ));
        let orchestrator = Arc::new(AnalysisOrchestrator::new(
            store.clone(),
            classifier,
            config.classifier_timeout,
            config.leads_off_policy,
            logger.new(slog::o!("part" => "orchestrator")),
        ));

        Self {
            config,
            store,
            router,
            gateway,
            sessions,
            orchestrator,
            logger,
        }
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Display buffer for an observer following a stream at `sample_rate`,
    /// sized and calibrated from the configuration.
    pub fn display_buffer(&self, sample_rate: f64) -> Result<IngestionBuffer> {
        IngestionBuffer::new(sample_rate, self.config.retention_secs, self.config.calibration)
    }

    /// Starts the configured number of in-process fake devices.
    pub fn start_mock_devices(&self) -> Vec<JoinHandle<()>> {
        if self.config.mock_devices > 0 {
            info!(self.logger, "starting mock devices"; "count" => self.config.mock_devices);
        }
        (0..self.config.mock_devices)
            .map(|index| {
                tokio::spawn(link::mock::mock_device_loop(
                    self.gateway.clone(),
                    index,
                    self.config.default_sample_rate,
                    self.logger.new(slog::o!("part" => "mock")),
                ))
            })
            .collect()
    }
}
