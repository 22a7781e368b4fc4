//! Experiment tracking and model registry.
//!
//! Runs belong to named experiments and carry params, metrics and artifact
//! directories. Registered model versions are numbered per name starting at 1 and
//! their artifacts are frozen as `registry/<name>/v<version>.tar.zst`.

mod archive;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use sqlx::{Row, sqlite::SqliteRow};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use uuid::Uuid;

use crate::{
    config::TrackingConfig,
    core::db::PoolState,
    error::{Error, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
}

impl TryFrom<i64> for RunStatus {
    type Error = anyhow::Error;

    fn try_from(value: i64) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(RunStatus::Running),
            1 => Ok(RunStatus::Finished),
            2 => Ok(RunStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid RunStatus value: {}", value)),
        }
    }
}

impl From<RunStatus> for i64 {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Running => 0,
            RunStatus::Finished => 1,
            RunStatus::Failed => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedRun {
    pub run_id: String,
    pub experiment_id: i64,
    pub status: RunStatus,
    pub started_at: OffsetDateTime,
    pub ended_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelVersion {
    pub name: String,
    pub version: u32,
    pub run_id: String,
    pub source: String,
    pub created_at: OffsetDateTime,
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(|e| Error::Storage(sqlx::Error::Encode(Box::new(e))))
}

fn parse_ts(column: &str, value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339).map_err(|e| {
        Error::Storage(sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: Box::new(e),
        })
    })
}

fn run_from_row(row: &SqliteRow) -> Result<TrackedRun> {
    let status: i64 = row.try_get("status")?;
    let started_at: String = row.try_get("started_at")?;
    let ended_at: Option<String> = row.try_get("ended_at")?;
    Ok(TrackedRun {
        run_id: row.try_get("run_id")?,
        experiment_id: row.try_get("experiment_id")?,
        status: RunStatus::try_from(status).map_err(|e| {
            Error::Storage(sqlx::Error::ColumnDecode {
                index: "status".to_string(),
                source: e.into(),
            })
        })?,
        started_at: parse_ts("started_at", &started_at)?,
        ended_at: ended_at
            .as_deref()
            .map(|v| parse_ts("ended_at", v))
            .transpose()?,
    })
}

fn version_from_row(row: &SqliteRow) -> Result<ModelVersion> {
    let version: i64 = row.try_get("version")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(ModelVersion {
        name: row.try_get("name")?,
        version: version as u32,
        run_id: row.try_get("run_id")?,
        source: row.try_get("source")?,
        created_at: parse_ts("created_at", &created_at)?,
    })
}

#[derive(Debug, Clone)]
pub struct Tracking {
    state: Arc<PoolState>,
    artifact_root: PathBuf,
    registry_root: PathBuf,
}

impl Tracking {
    pub async fn open(config: &TrackingConfig) -> Result<Self> {
        let state = PoolState::open(&config.database).await?;
        state
            .with_pool(|pool| async move {
                sqlx::migrate!("./migrations").run(&pool).await?;
                Ok(())
            })
            .await?;
        tokio::fs::create_dir_all(&config.artifact_root)
            .await
            .map_err(|e| Error::io(&config.artifact_root, e))?;
        Ok(Self {
            state: Arc::new(state),
            artifact_root: config.artifact_root.clone(),
            registry_root: config.registry_root.clone(),
        })
    }

    pub async fn close(&self) -> Result<()> {
        self.state.close().await
    }

    pub async fn experiment_id(&self, name: &str) -> Result<Option<i64>> {
        let mut conn = self.state.conn().await?;
        Ok(sqlx::query("SELECT id FROM experiment WHERE name = $1")
            .bind(name)
            .fetch_optional(&mut **conn)
            .await?
            .map(|row| row.try_get("id"))
            .transpose()?)
    }

    pub async fn get_or_create_experiment(&self, name: &str) -> Result<i64> {
        let created_at = now_rfc3339()?;
        let mut conn = self.state.conn().await?;
        sqlx::query(
            "INSERT INTO experiment (name, created_at) VALUES ($1, $2) ON CONFLICT (name) DO NOTHING",
        )
        .bind(name)
        .bind(created_at)
        .execute(&mut **conn)
        .await?;
        Ok(sqlx::query("SELECT id FROM experiment WHERE name = $1")
            .bind(name)
            .fetch_one(&mut **conn)
            .await?
            .try_get("id")?)
    }

    pub async fn start_run(&self, experiment_id: i64) -> Result<TrackedRun> {
        let run_id = Uuid::new_v4().simple().to_string();
        let started_at = now_rfc3339()?;
        let mut conn = self.state.conn().await?;
        let row = sqlx::query(
            r#"INSERT INTO run (run_id, experiment_id, status, started_at)
               VALUES ($1, $2, $3, $4)
               RETURNING run_id, experiment_id, status, started_at, ended_at"#,
        )
        .bind(&run_id)
        .bind(experiment_id)
        .bind(i64::from(RunStatus::Running))
        .bind(started_at)
        .fetch_one(&mut **conn)
        .await?;
        log::info!("started run {} in experiment {}", run_id, experiment_id);
        run_from_row(&row)
    }

    pub async fn finish_run(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let ended_at = now_rfc3339()?;
        let mut conn = self.state.conn().await?;
        sqlx::query("UPDATE run SET status = $1, ended_at = $2 WHERE run_id = $3")
            .bind(i64::from(status))
            .bind(ended_at)
            .bind(run_id)
            .execute(&mut **conn)
            .await?;
        log::info!("run {} ended as {:?}", run_id, status);
        Ok(())
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<TrackedRun>> {
        let mut conn = self.state.conn().await?;
        sqlx::query(
            "SELECT run_id, experiment_id, status, started_at, ended_at FROM run WHERE run_id = $1",
        )
        .bind(run_id)
        .fetch_optional(&mut **conn)
        .await?
        .as_ref()
        .map(run_from_row)
        .transpose()
    }

    /// The most recently started run of the experiment, whatever its status.
    pub async fn latest_run(&self, experiment_id: i64) -> Result<Option<TrackedRun>> {
        let mut conn = self.state.conn().await?;
        sqlx::query(
            r#"SELECT run_id, experiment_id, status, started_at, ended_at FROM run
               WHERE experiment_id = $1 ORDER BY seq DESC LIMIT 1"#,
        )
        .bind(experiment_id)
        .fetch_optional(&mut **conn)
        .await?
        .as_ref()
        .map(run_from_row)
        .transpose()
    }

    pub async fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        let mut conn = self.state.conn().await?;
        sqlx::query(
            r#"INSERT INTO run_param (run_id, key, value) VALUES ($1, $2, $3)
               ON CONFLICT (run_id, key) DO UPDATE SET value = EXCLUDED.value"#,
        )
        .bind(run_id)
        .bind(key)
        .bind(value)
        .execute(&mut **conn)
        .await?;
        Ok(())
    }

    pub async fn log_metric(&self, run_id: &str, key: &str, value: f64) -> Result<()> {
        let mut conn = self.state.conn().await?;
        sqlx::query(
            r#"INSERT INTO run_metric (run_id, key, value) VALUES ($1, $2, $3)
               ON CONFLICT (run_id, key) DO UPDATE SET value = EXCLUDED.value"#,
        )
        .bind(run_id)
        .bind(key)
        .bind(value)
        .execute(&mut **conn)
        .await?;
        Ok(())
    }

    pub async fn metrics(&self, run_id: &str) -> Result<BTreeMap<String, f64>> {
        let mut conn = self.state.conn().await?;
        sqlx::query("SELECT key, value FROM run_metric WHERE run_id = $1 ORDER BY key")
            .bind(run_id)
            .fetch_all(&mut **conn)
            .await?
            .iter()
            .map(|row| -> Result<(String, f64)> {
                Ok((row.try_get("key")?, row.try_get("value")?))
            })
            .collect()
    }

    pub async fn params(&self, run_id: &str) -> Result<BTreeMap<String, String>> {
        let mut conn = self.state.conn().await?;
        sqlx::query("SELECT key, value FROM run_param WHERE run_id = $1 ORDER BY key")
            .bind(run_id)
            .fetch_all(&mut **conn)
            .await?
            .iter()
            .map(|row| -> Result<(String, String)> {
                Ok((row.try_get("key")?, row.try_get("value")?))
            })
            .collect()
    }

    pub fn run_artifact_dir(&self, run_id: &str) -> PathBuf {
        self.artifact_root.join(run_id)
    }

    /// Copy `src_dir` into the run's artifacts as `name`.
    pub async fn log_artifacts(
        &self,
        run_id: &str,
        name: &str,
        src_dir: &Path,
    ) -> Result<PathBuf> {
        let dest = self.run_artifact_dir(run_id).join(name);
        let src = src_dir.to_path_buf();
        let target = dest.clone();
        tokio::task::spawn_blocking(move || archive::copy_tree(&src, &target)).await??;
        log::info!("logged artifact '{}' for run {}", name, run_id);
        Ok(dest)
    }

    /// Top-level artifact names of a run. A run without artifacts lists nothing.
    pub async fn list_artifacts(&self, run_id: &str) -> Result<Vec<String>> {
        let dir = self.run_artifact_dir(run_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(Error::io(&dir, e)),
        };
        let mut names = vec![];
        while let Some(entry) = entries.next_entry().await.map_err(|e| Error::io(&dir, e))? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    /// Register `runs:/<run_id>/<artifact>` under `name` as the next version.
    ///
    /// The version row and the frozen archive are written together: if packing fails
    /// the version number is not consumed.
    pub async fn register_model(
        &self,
        name: &str,
        run_id: &str,
        artifact: &str,
    ) -> Result<ModelVersion> {
        let artifact_dir = self.run_artifact_dir(run_id).join(artifact);
        if !artifact_dir.is_dir() {
            return Err(Error::Registration(format!(
                "artifact directory {:?} does not exist",
                artifact_dir
            )));
        }
        let source = format!("runs:/{}/{}", run_id, artifact);
        let created_at = now_rfc3339()?;

        let mut conn = self.state.conn().await?;
        let mut tx = conn.begin_transaction().await?;
        let row = sqlx::query(
            r#"INSERT INTO model_version (name, version, run_id, source, created_at) VALUES ($1, (
                SELECT COALESCE(MAX(version), 0) + 1 FROM model_version WHERE name = $1
            ), $2, $3, $4) RETURNING name, version, run_id, source, created_at"#,
        )
        .bind(name)
        .bind(run_id)
        .bind(&source)
        .bind(created_at)
        .fetch_one(&mut *tx)
        .await?;
        let version = version_from_row(&row)?;

        let dest = self.archive_path(name, version.version);
        tokio::task::spawn_blocking(move || archive::pack_dir(&artifact_dir, &dest))
            .await?
            .map_err(|e| Error::Registration(e.to_string()))?;

        tx.commit().await?;
        log::info!(
            "model registered as '{}' (version: {})",
            version.name,
            version.version
        );
        Ok(version)
    }

    pub async fn latest_version(&self, name: &str) -> Result<Option<ModelVersion>> {
        let mut conn = self.state.conn().await?;
        sqlx::query(
            r#"SELECT name, version, run_id, source, created_at FROM model_version
               WHERE name = $1 ORDER BY version DESC LIMIT 1"#,
        )
        .bind(name)
        .fetch_optional(&mut **conn)
        .await?
        .as_ref()
        .map(version_from_row)
        .transpose()
    }

    pub async fn versions(&self, name: &str) -> Result<Vec<ModelVersion>> {
        let mut conn = self.state.conn().await?;
        sqlx::query(
            r#"SELECT name, version, run_id, source, created_at FROM model_version
               WHERE name = $1 ORDER BY version ASC"#,
        )
        .bind(name)
        .fetch_all(&mut **conn)
        .await?
        .iter()
        .map(version_from_row)
        .collect()
    }

    pub fn archive_path(&self, name: &str, version: u32) -> PathBuf {
        self.registry_root
            .join(name)
            .join(format!("v{}.tar.zst", version))
    }

    /// Unpack a registered version next to its archive and return the directory.
    /// Already unpacked versions are reused.
    pub async fn checkout(&self, version: &ModelVersion) -> Result<PathBuf> {
        let dir = self
            .registry_root
            .join(&version.name)
            .join(format!("v{}", version.version));
        if dir.is_dir() {
            return Ok(dir);
        }
        let archive_file = self.archive_path(&version.name, version.version);
        let target = dir.clone();
        tokio::task::spawn_blocking(move || archive::unpack(&archive_file, &target)).await??;
        Ok(dir)
    }
}
