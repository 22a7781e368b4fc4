//! Crate-wide error type.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Connection or query failure in one of the SQLite stores.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// A single image could not be decoded or encoded.
    #[error("image error ({context}): {source}")]
    Decode {
        context: String,
        #[source]
        source: image::ImageError,
    },

    /// The workflow engine answered with something other than 200.
    #[error("pipeline trigger rejected with status {status}: {body}")]
    Trigger { status: u16, body: String },

    #[error("pipeline trigger transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("training failed: {0}")]
    Training(String),

    #[error("registration failed: {0}")]
    Registration(String),

    /// Missing directories, empty datasets and invalid settings.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn decode(context: impl Into<String>, source: image::ImageError) -> Self {
        Error::Decode {
            context: context.into(),
            source,
        }
    }
}

/// Result of an operation that may legitimately decline to act.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Done(T),
    Skipped(SkipReason),
}

impl<T> Outcome<T> {
    pub fn done(self) -> Option<T> {
        match self {
            Outcome::Done(value) => Some(value),
            Outcome::Skipped(_) => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::Skipped(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The experiment does not exist or has no runs.
    NoRun,
    /// The latest run did not finish successfully.
    RunNotFinished { run_id: String },
    /// The latest run has no artifact with the expected name.
    MissingArtifact { run_id: String, artifact: String },
    /// Nothing was pending, so there is nothing to train on.
    EmptyBatch,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NoRun => write!(f, "no run found"),
            SkipReason::RunNotFinished { run_id } => {
                write!(f, "latest run {} did not finish", run_id)
            }
            SkipReason::MissingArtifact { run_id, artifact } => {
                write!(f, "latest run {} has no artifact '{}'", run_id, artifact)
            }
            SkipReason::EmptyBatch => write!(f, "empty batch"),
        }
    }
}
