//! Training boundary: run an opaque trainer and record the result as a tracked run.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    core::{
        db::Label,
        tracking::{RunStatus, Tracking},
    },
    error::{Error, Result},
    pipeline::count_images,
};

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingMetrics {
    pub train_accuracy: f64,
    pub val_accuracy: f64,
    pub labels_seen: BTreeSet<Label>,
}

/// The model itself. Implementations write whatever they need to reload the model
/// into `model_dir`.
pub trait Trainer: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Hyperparameters recorded on the run.
    fn params(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn train(&self, data_dir: &Path, model_dir: &Path) -> anyhow::Result<TrainingMetrics>;
}

#[derive(Debug, Clone)]
pub struct Artifact {
    pub run_id: String,
    pub model_uri: String,
    pub model_dir: PathBuf,
    pub metrics: TrainingMetrics,
}

#[derive(Clone)]
pub struct TrainingStage {
    tracking: Tracking,
    trainer: Arc<dyn Trainer>,
    experiment: String,
    artifact_name: String,
}

impl std::fmt::Debug for TrainingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingStage")
            .field("trainer", &self.trainer.name())
            .field("experiment", &self.experiment)
            .field("artifact_name", &self.artifact_name)
            .finish()
    }
}

impl TrainingStage {
    pub fn new(
        tracking: Tracking,
        trainer: Arc<dyn Trainer>,
        experiment: impl Into<String>,
        artifact_name: impl Into<String>,
    ) -> Self {
        Self {
            tracking,
            trainer,
            experiment: experiment.into(),
            artifact_name: artifact_name.into(),
        }
    }

    pub async fn train(&self, preprocessed_dir: &Path) -> Result<Artifact> {
        if !preprocessed_dir.is_dir() {
            return Err(Error::Configuration(format!(
                "path not found: {:?}",
                preprocessed_dir
            )));
        }
        let dir = preprocessed_dir.to_path_buf();
        let image_count = tokio::task::spawn_blocking(move || count_images(&dir)).await??;
        if image_count == 0 {
            return Err(Error::Configuration(format!(
                "no images found in {:?}",
                preprocessed_dir
            )));
        }

        let experiment_id = self.tracking.get_or_create_experiment(&self.experiment).await?;
        let run = self.tracking.start_run(experiment_id).await?;
        let run_id = run.run_id;

        self.tracking
            .log_param(&run_id, "trainer", self.trainer.name())
            .await?;
        self.tracking
            .log_param(&run_id, "image_count", &image_count.to_string())
            .await?;
        for (key, value) in self.trainer.params() {
            self.tracking.log_param(&run_id, &key, &value).await?;
        }

        let staging = self.tracking.run_artifact_dir(&run_id).with_extension("staging");
        let trained = {
            let trainer = self.trainer.clone();
            let data_dir = preprocessed_dir.to_path_buf();
            let model_dir = staging.clone();
            tokio::task::spawn_blocking(move || {
                std::fs::create_dir_all(&model_dir)?;
                trainer.train(&data_dir, &model_dir)
            })
            .await
        };

        let metrics = match trained {
            Ok(Ok(metrics)) => metrics,
            Ok(Err(e)) => return Err(self.abort(&run_id, &staging, format!("{:#}", e)).await),
            Err(e) => return Err(self.abort(&run_id, &staging, e.to_string()).await),
        };

        self.tracking
            .log_metric(&run_id, "train_accuracy", metrics.train_accuracy)
            .await?;
        self.tracking
            .log_metric(&run_id, "val_accuracy", metrics.val_accuracy)
            .await?;
        let labels = metrics
            .labels_seen
            .iter()
            .map(|l| l.as_str())
            .collect::<Vec<_>>()
            .join(",");
        self.tracking.log_param(&run_id, "labels_seen", &labels).await?;

        let model_dir = self
            .tracking
            .log_artifacts(&run_id, &self.artifact_name, &staging)
            .await?;
        remove_staging(&staging).await;
        self.tracking.finish_run(&run_id, RunStatus::Finished).await?;

        log::info!(
            "run {} trained: train_accuracy {:.3}, val_accuracy {:.3}",
            run_id,
            metrics.train_accuracy,
            metrics.val_accuracy
        );
        Ok(Artifact {
            model_uri: format!("runs:/{}/{}", run_id, self.artifact_name),
            run_id,
            model_dir,
            metrics,
        })
    }

    async fn abort(&self, run_id: &str, staging: &Path, reason: String) -> Error {
        log::error!("training run {} failed: {}", run_id, reason);
        remove_staging(staging).await;
        if let Err(e) = self.tracking.finish_run(run_id, RunStatus::Failed).await {
            log::error!("could not mark run {} as failed: {}", run_id, e);
        }
        Error::Training(reason)
    }
}

async fn remove_staging(staging: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(staging).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("could not remove staging directory {:?}: {}", staging, e);
        }
    }
}
