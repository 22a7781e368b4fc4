//! The retraining run: extract → preprocess → train → register.

pub mod extract;
pub mod ingest;
pub mod quality;
pub mod register;
pub mod train;

use std::{
    fmt,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;

use crate::{
    config::{PipelineConfig, TrackingConfig},
    core::{
        db::{ImageRepository, Table},
        tracking::{ModelVersion, Tracking},
    },
    error::{Error as PipelineError, Outcome, Result, SkipReason},
};

use extract::ExtractionReport;
use quality::{QualityOptions, QualityReport};
use train::{Artifact, Trainer, TrainingStage};

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Image files directly inside `dir`, sorted by name.
pub(crate) fn image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = vec![];
    for entry in fs::read_dir(dir).map_err(|e| PipelineError::io(dir, e))? {
        let path = entry.map_err(|e| PipelineError::io(dir, e))?.path();
        let is_image = path.is_file()
            && path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
                .unwrap_or(false);
        if is_image {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Image files anywhere below `dir`.
pub(crate) fn count_images(dir: &Path) -> Result<usize> {
    let mut count = image_files(dir)?.len();
    for entry in fs::read_dir(dir).map_err(|e| PipelineError::io(dir, e))? {
        let path = entry.map_err(|e| PipelineError::io(dir, e))?.path();
        if path.is_dir() {
            count += count_images(&path)?;
        }
    }
    Ok(count)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extracting,
    Preprocessing,
    Training,
    Registering,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Extracting => "extracting",
            Stage::Preprocessing => "preprocessing",
            Stage::Training => "training",
            Stage::Registering => "registering",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running(Stage),
    Done,
    Failed(Stage),
}

#[derive(Error, Debug)]
#[error("pipeline run failed while {stage}: {source}")]
pub struct StageFailure {
    pub stage: Stage,
    #[source]
    pub source: PipelineError,
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub extracted: ExtractionReport,
    pub quality: Option<QualityReport>,
    pub artifact: Option<Artifact>,
    pub promotion: Option<Outcome<ModelVersion>>,
}

impl RunReport {
    pub fn promoted(&self) -> Option<&ModelVersion> {
        match &self.promotion {
            Some(Outcome::Done(version)) => Some(version),
            _ => None,
        }
    }
}

/// Runs the stages strictly in order. A failing stage ends the run; nothing is
/// retried here. Overlapping runs are the trigger side's concern.
pub struct Orchestrator<S> {
    store: S,
    tracking: Tracking,
    training: TrainingStage,
    pipeline: PipelineConfig,
    tracking_config: TrackingConfig,
    state: RunState,
}

impl<S: ImageRepository> Orchestrator<S> {
    pub fn new(
        store: S,
        tracking: Tracking,
        trainer: Arc<dyn Trainer>,
        pipeline: PipelineConfig,
        tracking_config: TrackingConfig,
    ) -> Self {
        let training = TrainingStage::new(
            tracking.clone(),
            trainer,
            tracking_config.experiment.clone(),
            tracking_config.artifact_name.clone(),
        );
        Self {
            store,
            tracking,
            training,
            pipeline,
            tracking_config,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn enter(&mut self, stage: Stage) {
        log::info!("pipeline: {}", stage);
        self.state = RunState::Running(stage);
    }

    fn fail(&mut self, stage: Stage, source: PipelineError) -> StageFailure {
        log::error!("pipeline failed while {}: {}", stage, source);
        self.state = RunState::Failed(stage);
        StageFailure { stage, source }
    }

    fn finish(&mut self, report: RunReport) -> std::result::Result<RunReport, StageFailure> {
        self.state = RunState::Done;
        log::info!("pipeline run done");
        Ok(report)
    }

    pub async fn run(&mut self) -> std::result::Result<RunReport, StageFailure> {
        let mut report = RunReport::default();

        self.enter(Stage::Extracting);
        report.extracted =
            match extract::extract(&self.store, Table::Pending, &self.pipeline.raw_dir).await {
                Ok(extracted) => extracted,
                Err(e) => return Err(self.fail(Stage::Extracting, e)),
            };
        if report.extracted.total() == 0 && self.pipeline.skip_empty_batches {
            log::info!("pipeline: empty batch, skipping training");
            report.promotion = Some(Outcome::Skipped(SkipReason::EmptyBatch));
            return self.finish(report);
        }

        self.enter(Stage::Preprocessing);
        let options = QualityOptions {
            target_size: (self.pipeline.target_width, self.pipeline.target_height),
            blur: self.pipeline.blur,
        };
        let input = self.pipeline.raw_dir.clone();
        let output = self.pipeline.preprocessed_dir.clone();
        let processed =
            tokio::task::spawn_blocking(move || quality::process(&input, &output, &options)).await;
        report.quality = match processed {
            Ok(Ok(quality)) => Some(quality),
            Ok(Err(e)) => return Err(self.fail(Stage::Preprocessing, e)),
            Err(e) => return Err(self.fail(Stage::Preprocessing, e.into())),
        };

        self.enter(Stage::Training);
        let artifact = match self.training.train(&self.pipeline.preprocessed_dir).await {
            Ok(artifact) => artifact,
            Err(e) => return Err(self.fail(Stage::Training, e)),
        };
        report.artifact = Some(artifact);

        self.enter(Stage::Registering);
        let promotion = match register::register(
            &self.tracking,
            &self.tracking_config.experiment,
            &self.tracking_config.artifact_name,
            &self.tracking_config.registered_name,
        )
        .await
        {
            Ok(promotion) => promotion,
            Err(e) => return Err(self.fail(Stage::Registering, e)),
        };
        if let Outcome::Skipped(reason) = &promotion {
            if self.pipeline.require_promotion {
                let reason = reason.to_string();
                return Err(self.fail(Stage::Registering, PipelineError::Registration(reason)));
            }
            log::warn!("pipeline: registration skipped ({})", reason);
        }
        report.promotion = Some(promotion);

        self.finish(report)
    }
}
