pub mod bootstrap;
pub mod config;
pub mod core;
pub mod counter;
pub mod error;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod serving;
pub mod trigger;

pub use config::Config;
pub use error::{Error, Outcome, Result, SkipReason};
pub use counter::{ConfiguredCounter, FileCounter, MemoryCounter, PredictionCounter, SqliteCounter};
pub use pipeline::{Orchestrator, RunReport, RunState, Stage, StageFailure};
pub use serving::{Classifier, Prediction, PredictionService};
pub use trigger::{PipelineRun, TriggerClient};
