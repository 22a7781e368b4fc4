//! Integration tests for promotion of the latest run's artifact.

mod common;

use std::path::Path;

use common::*;
use rpsloop::pipeline::register::register;

const ARTIFACT: &str = "rps_cnn_model";
const NAME: &str = "RockPaperScissorsModel";

/// Start a run, optionally attach a model artifact, and set its final status.
async fn tracked_run(
    tracking: &Tracking,
    experiment: &str,
    artifact: Option<&str>,
    status: Option<RunStatus>,
    scratch: &Path,
) -> anyhow::Result<String> {
    let experiment_id = tracking.get_or_create_experiment(experiment).await?;
    let run = tracking.start_run(experiment_id).await?;
    if let Some(name) = artifact {
        let model = scratch.join(&run.run_id);
        write_file(&model.join("model.json"), run.run_id.as_bytes());
        tracking.log_artifacts(&run.run_id, name, &model).await?;
    }
    if let Some(status) = status {
        tracking.finish_run(&run.run_id, status).await?;
    }
    Ok(run.run_id)
}

#[tokio::test]
async fn test_missing_experiment_is_skipped() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let tracking = create_test_tracking(&test_config(dir.path())).await;

    let outcome = register(&tracking, "nobody-made-this", ARTIFACT, NAME).await?;
    assert!(outcome.is_skipped());
    assert_eq!(outcome, Outcome::Skipped(SkipReason::NoRun));
    Ok(())
}

#[tokio::test]
async fn test_experiment_without_runs_is_skipped() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let config = test_config(dir.path());
    let tracking = create_test_tracking(&config).await;
    tracking
        .get_or_create_experiment(&config.tracking.experiment)
        .await?;

    let outcome = register(&tracking, &config.tracking.experiment, ARTIFACT, NAME).await?;
    assert_eq!(outcome, Outcome::Skipped(SkipReason::NoRun));
    assert!(tracking.latest_version(NAME).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_latest_run_without_artifact_is_skipped() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let config = test_config(dir.path());
    let tracking = create_test_tracking(&config).await;
    let exp = &config.tracking.experiment;
    let scratch = dir.path().join("scratch");

    // An older run would qualify, but only the latest one counts
    tracked_run(&tracking, exp, Some(ARTIFACT), Some(RunStatus::Finished), &scratch).await?;
    let latest = tracked_run(&tracking, exp, None, Some(RunStatus::Finished), &scratch).await?;

    let outcome = register(&tracking, exp, ARTIFACT, NAME).await?;
    assert_eq!(
        outcome,
        Outcome::Skipped(SkipReason::MissingArtifact {
            run_id: latest,
            artifact: ARTIFACT.to_string(),
        })
    );
    assert!(tracking.versions(NAME).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_artifact_under_another_name_is_skipped() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let config = test_config(dir.path());
    let tracking = create_test_tracking(&config).await;
    let exp = &config.tracking.experiment;

    tracked_run(
        &tracking,
        exp,
        Some("something_else"),
        Some(RunStatus::Finished),
        &dir.path().join("scratch"),
    )
    .await?;

    let outcome = register(&tracking, exp, ARTIFACT, NAME).await?;
    assert!(matches!(
        outcome,
        Outcome::Skipped(SkipReason::MissingArtifact { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_unfinished_or_failed_latest_run_is_skipped() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let config = test_config(dir.path());
    let tracking = create_test_tracking(&config).await;
    let exp = &config.tracking.experiment;
    let scratch = dir.path().join("scratch");

    let running = tracked_run(&tracking, exp, Some(ARTIFACT), None, &scratch).await?;
    assert_eq!(
        register(&tracking, exp, ARTIFACT, NAME).await?,
        Outcome::Skipped(SkipReason::RunNotFinished { run_id: running })
    );

    let failed = tracked_run(&tracking, exp, Some(ARTIFACT), Some(RunStatus::Failed), &scratch)
        .await?;
    assert_eq!(
        register(&tracking, exp, ARTIFACT, NAME).await?,
        Outcome::Skipped(SkipReason::RunNotFinished { run_id: failed })
    );
    Ok(())
}

#[tokio::test]
async fn test_successive_registrations_increment_version() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let config = test_config(dir.path());
    let tracking = create_test_tracking(&config).await;
    let exp = &config.tracking.experiment;
    let scratch = dir.path().join("scratch");

    let first = tracked_run(&tracking, exp, Some(ARTIFACT), Some(RunStatus::Finished), &scratch)
        .await?;
    let v1 = register(&tracking, exp, ARTIFACT, NAME)
        .await?
        .done()
        .expect("first registration");
    assert_eq!(v1.version, 1);
    assert_eq!(v1.run_id, first);
    assert_eq!(v1.source, format!("runs:/{}/{}", first, ARTIFACT));
    assert!(tracking.archive_path(NAME, 1).is_file());

    let second = tracked_run(&tracking, exp, Some(ARTIFACT), Some(RunStatus::Finished), &scratch)
        .await?;
    let v2 = register(&tracking, exp, ARTIFACT, NAME)
        .await?
        .done()
        .expect("second registration");
    assert_eq!(v2.version, 2);
    assert_eq!(v2.run_id, second);

    let latest = tracking.latest_version(NAME).await?.expect("registered");
    assert_eq!(latest.version, 2);
    assert_eq!(
        tracking
            .versions(NAME)
            .await?
            .iter()
            .map(|v| v.version)
            .collect::<Vec<_>>(),
        vec![1, 2]
    );
    Ok(())
}

#[tokio::test]
async fn test_checkout_restores_registered_files() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let config = test_config(dir.path());
    let tracking = create_test_tracking(&config).await;
    let exp = &config.tracking.experiment;

    let run_id = tracked_run(
        &tracking,
        exp,
        Some(ARTIFACT),
        Some(RunStatus::Finished),
        &dir.path().join("scratch"),
    )
    .await?;
    let version = register(&tracking, exp, ARTIFACT, NAME)
        .await?
        .done()
        .expect("registered");

    // The frozen copy survives removal of the run's artifacts
    std::fs::remove_dir_all(tracking.run_artifact_dir(&run_id))?;

    let model_dir = tracking.checkout(&version).await?;
    assert_eq!(std::fs::read(model_dir.join("model.json"))?, run_id.as_bytes());

    // A second checkout reuses the unpacked directory
    assert_eq!(tracking.checkout(&version).await?, model_dir);
    Ok(())
}
