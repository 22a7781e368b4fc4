//! Runtime configuration.
//!
//! Every field has a default matching the stock deployment, so an absent or
//! partial JSON file is fine.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    pipeline::quality::BlurFilter,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub counter: CounterConfig,
    pub trigger: TriggerConfig,
    pub pipeline: PipelineConfig,
    pub tracking: TrackingConfig,
    pub setup: SetupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("mlops_image_db.sqlite"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterBackend {
    File,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterConfig {
    pub backend: CounterBackend,
    /// Used by the file backend only.
    pub path: PathBuf,
    /// Predictions per retraining run. 1 fires on every prediction.
    pub threshold: u64,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            backend: CounterBackend::Sqlite,
            path: PathBuf::from("utils/prediction_counter.json"),
            threshold: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub timeout_secs: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://airflow:8080/api/v1/dags/rock_paper_scissors_retrain_pipeline/dagRuns"
                .to_string(),
            username: "admin".to_string(),
            password: "admin".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Extraction output, one subdirectory per label.
    pub raw_dir: PathBuf,
    pub preprocessed_dir: PathBuf,
    pub target_width: u32,
    pub target_height: u32,
    pub blur: BlurFilter,
    /// Treat a skipped registration as a failed run.
    pub require_promotion: bool,
    /// End the run after extraction when nothing was pending.
    pub skip_empty_batches: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            raw_dir: PathBuf::from("Data/raw_data"),
            preprocessed_dir: PathBuf::from("Data/for_retraining_prep"),
            target_width: 224,
            target_height: 224,
            blur: BlurFilter::default(),
            require_promotion: false,
            skip_empty_batches: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub database: PathBuf,
    pub artifact_root: PathBuf,
    pub registry_root: PathBuf,
    pub experiment: String,
    pub artifact_name: String,
    pub registered_name: String,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("tracking.sqlite"),
            artifact_root: PathBuf::from("mlruns"),
            registry_root: PathBuf::from("registry"),
            experiment: "play-rock-paper-scissors-exp".to_string(),
            artifact_name: "rps_cnn_model".to_string(),
            registered_name: "RockPaperScissorsModel".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupConfig {
    pub attempts: u32,
    pub backoff_secs: u64,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            backoff_secs: 5,
        }
    }
}

impl Config {
    /// Load from `path`, or use the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
                serde_json::from_slice(&bytes)?
            }
            None => Config::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.counter.threshold == 0 {
            return Err(Error::Configuration(
                "counter.threshold must be at least 1".to_string(),
            ));
        }
        if self.pipeline.target_width == 0 || self.pipeline.target_height == 0 {
            return Err(Error::Configuration(format!(
                "target size must be non-zero, got {}x{}",
                self.pipeline.target_width, self.pipeline.target_height
            )));
        }
        if self.setup.attempts == 0 {
            return Err(Error::Configuration(
                "setup.attempts must be at least 1".to_string(),
            ));
        }
        if self.pipeline.blur.threshold < 0.0 {
            return Err(Error::Configuration(
                "blur threshold cannot be negative".to_string(),
            ));
        }
        Ok(())
    }

    pub fn target_size(&self) -> (u32, u32) {
        (self.pipeline.target_width, self.pipeline.target_height)
    }
}
