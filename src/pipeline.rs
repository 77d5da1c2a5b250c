//! End-to-end driver: export the trend raster, then fetch it locally.

use crate::config::PipelineConfig;
use crate::core::export::{
    CancellationToken, ExportAttempt, ExportBackend, ExportOrchestrator, PollPolicy,
};
use crate::core::trend::HarmonicTrendModel;
use crate::io::drive::RemoteStorage;
use crate::io::locator::ArtifactLocator;
use crate::types::TrendResult;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Pipeline stages that are timed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Export,
    Download,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Export => write!(f, "Export"),
            Stage::Download => write!(f, "Download"),
        }
    }
}

/// Summary of a successful run
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub timings: Vec<(Stage, Duration)>,
    pub attempts: Vec<ExportAttempt>,
    pub output_path: PathBuf,
}

impl PipelineReport {
    pub fn duration(&self, stage: Stage) -> Option<Duration> {
        self.timings
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, d)| *d)
    }
}

/// Runs the export and the download in sequence
pub struct PipelineDriver<E: ExportBackend, S: RemoteStorage> {
    config: PipelineConfig,
    model: HarmonicTrendModel,
    orchestrator: ExportOrchestrator<E>,
    locator: ArtifactLocator<S>,
}

impl<E: ExportBackend, S: RemoteStorage> PipelineDriver<E, S> {
    pub fn new(config: PipelineConfig, backend: E, storage: S) -> TrendResult<Self> {
        config.validate()?;
        let model = HarmonicTrendModel::new(&config)?;
        let orchestrator = ExportOrchestrator::new(
            backend,
            config.export.clone(),
            PollPolicy::from(&config.polling),
        );
        let locator = ArtifactLocator::new(storage, config.export.file_format.mime_type());
        Ok(Self {
            config,
            model,
            orchestrator,
            locator,
        })
    }

    /// Share a cancellation token with the export poller
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.orchestrator = self.orchestrator.with_cancellation(cancel);
        self
    }

    pub fn run(&self) -> TrendResult<PipelineReport> {
        let config = &self.config;
        let mut timings = Vec::with_capacity(2);

        log::info!(
            "Harmonic trend export: {} → {}/{}",
            config.project,
            config.drive_folder,
            config.raster_name
        );
        let start = Instant::now();
        let image = self.model.coefficients_graph();
        let outcome = self.orchestrator.export(
            &image,
            self.model.region(),
            &config.raster_name,
            &config.drive_folder,
        )?;
        let elapsed = start.elapsed();
        log::info!("{} stage finished in {:.2?}", Stage::Export, elapsed);
        timings.push((Stage::Export, elapsed));

        let start = Instant::now();
        let output_path = self.locator.retrieve(
            &config.raster_name,
            &config.drive_folder,
            &config.output_path(),
        )?;
        let elapsed = start.elapsed();
        log::info!("{} stage finished in {:.2?}", Stage::Download, elapsed);
        timings.push((Stage::Download, elapsed));

        Ok(PipelineReport {
            timings,
            attempts: outcome.attempts,
            output_path,
        })
    }
}
