use crate::{
    core::tracking::{ModelVersion, RunStatus, Tracking},
    error::{Error, Outcome, Result, SkipReason},
};

/// Promote the artifact of the experiment's most recently started run.
///
/// Only the latest run is considered: if it is unfinished or lacks
/// `artifact_dir_name`, nothing is registered even when an older run would qualify.
/// Those cases are skips, not errors.
pub async fn register(
    tracking: &Tracking,
    experiment_name: &str,
    artifact_dir_name: &str,
    registered_name: &str,
) -> Result<Outcome<ModelVersion>> {
    let Some(experiment_id) = tracking.experiment_id(experiment_name).await? else {
        log::info!("experiment '{}' does not exist, nothing to register", experiment_name);
        return Ok(Outcome::Skipped(SkipReason::NoRun));
    };
    let Some(latest) = tracking.latest_run(experiment_id).await? else {
        log::info!("experiment '{}' has no runs, nothing to register", experiment_name);
        return Ok(Outcome::Skipped(SkipReason::NoRun));
    };

    if latest.status != RunStatus::Finished {
        log::info!("latest run {} is {:?}, not registering", latest.run_id, latest.status);
        return Ok(Outcome::Skipped(SkipReason::RunNotFinished {
            run_id: latest.run_id,
        }));
    }

    let artifacts = tracking.list_artifacts(&latest.run_id).await?;
    if !artifacts.iter().any(|a| a == artifact_dir_name) {
        log::info!(
            "latest run {} has no artifact '{}', not registering",
            latest.run_id,
            artifact_dir_name
        );
        return Ok(Outcome::Skipped(SkipReason::MissingArtifact {
            run_id: latest.run_id,
            artifact: artifact_dir_name.to_string(),
        }));
    }

    let version = tracking
        .register_model(registered_name, &latest.run_id, artifact_dir_name)
        .await
        .map_err(|e| match e {
            Error::Registration(_) => e,
            other => Error::Registration(other.to_string()),
        })?;
    Ok(Outcome::Done(version))
}
