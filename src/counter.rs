//! Prediction counters deciding when a retraining run is due.
//!
//! Every backend treats increment, compare and reset as a single critical section:
//! for `N` calls with threshold `T` exactly `N / T` calls return `true`, whatever the
//! interleaving of concurrent callers.

use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use crate::{
    config::{CounterBackend, CounterConfig},
    core::db::ImageStore,
    error::{Error, Result},
};

pub trait PredictionCounter {
    /// Count one served prediction. Returns `true` when this call made the count
    /// reach the threshold, in which case the count is back at zero.
    fn increment_and_check(&self) -> impl Future<Output = Result<bool>> + Send;

    /// Current count without modifying it.
    fn current(&self) -> impl Future<Output = Result<u64>> + Send;
}

fn checked_threshold(threshold: u64) -> Result<u64> {
    if threshold == 0 {
        return Err(Error::Configuration(
            "counter threshold must be at least 1".to_string(),
        ));
    }
    Ok(threshold)
}

/// Advance `count` by one and report whether the threshold was crossed.
fn step(count: u64, threshold: u64) -> (u64, bool) {
    let next = count + 1;
    if next >= threshold { (0, true) } else { (next, false) }
}

/// In-memory counter for a single process.
#[derive(Debug)]
pub struct MemoryCounter {
    threshold: u64,
    count: Mutex<u64>,
}

impl MemoryCounter {
    pub fn new(threshold: u64) -> Result<Self> {
        Ok(Self {
            threshold: checked_threshold(threshold)?,
            count: Mutex::new(0),
        })
    }
}

impl PredictionCounter for MemoryCounter {
    async fn increment_and_check(&self) -> Result<bool> {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        let (next, crossed) = step(*count, self.threshold);
        *count = next;
        Ok(crossed)
    }

    async fn current(&self) -> Result<u64> {
        Ok(*self.count.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CounterFile {
    count: u64,
}

/// Counter persisted as `{"count": n}` in a JSON file.
///
/// Each update holds an exclusive lock on `<path>.lock` while it reads, advances and
/// replaces the file, so any number of instances and processes sharing `path` see
/// one sequence of counts. The file is replaced through a writer-unique temp file
/// and a rename, so it is never observed half-written.
#[derive(Debug, Clone)]
pub struct FileCounter {
    path: PathBuf,
    threshold: u64,
}

impl FileCounter {
    pub fn new<P: AsRef<Path>>(path: P, threshold: u64) -> Result<Self> {
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            threshold: checked_threshold(threshold)?,
        })
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Open the lock file, creating it and the counter directory when missing.
    fn open_lock(&self) -> Result<File> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let lock_path = self.lock_path();
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| Error::io(&lock_path, e))
    }

    fn read(&self) -> Result<CounterFile> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CounterFile::default()),
            Err(e) => Err(Error::io(&self.path, e)),
        }
    }

    fn write(&self, state: &CounterFile) -> Result<()> {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{}.tmp", Uuid::new_v4().simple()));
        let tmp = PathBuf::from(name);
        fs::write(&tmp, serde_json::to_vec(state)?).map_err(|e| Error::io(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::io(&self.path, e)
        })
    }

    fn advance(&self) -> Result<bool> {
        let lock = self.open_lock()?;
        lock.lock().map_err(|e| Error::io(self.lock_path(), e))?;
        let mut state = self.read()?;
        let (next, crossed) = step(state.count, self.threshold);
        state.count = next;
        self.write(&state)?;
        // Released when `lock` is dropped
        Ok(crossed)
    }

    fn peek(&self) -> Result<u64> {
        let lock = self.open_lock()?;
        lock.lock_shared().map_err(|e| Error::io(self.lock_path(), e))?;
        Ok(self.read()?.count)
    }
}

impl PredictionCounter for FileCounter {
    async fn increment_and_check(&self) -> Result<bool> {
        let counter = self.clone();
        tokio::task::spawn_blocking(move || counter.advance()).await?
    }

    async fn current(&self) -> Result<u64> {
        let counter = self.clone();
        tokio::task::spawn_blocking(move || counter.peek()).await?
    }
}

/// Counter kept in a single-row table next to the image tables.
///
/// The update is one `INSERT .. ON CONFLICT .. RETURNING` statement, so it is atomic
/// across connections and processes.
#[derive(Debug, Clone)]
pub struct SqliteCounter {
    store: ImageStore,
    threshold: u64,
}

impl SqliteCounter {
    pub async fn new(store: ImageStore, threshold: u64) -> Result<Self> {
        let threshold = checked_threshold(threshold)?;
        let mut conn = store.pool_state().conn().await?;
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS prediction_counter (
                slot INTEGER PRIMARY KEY CHECK (slot = 0),
                count INTEGER NOT NULL
            )"#,
        )
        .execute(&mut **conn)
        .await?;
        drop(conn);
        Ok(Self { store, threshold })
    }
}

impl PredictionCounter for SqliteCounter {
    async fn increment_and_check(&self) -> Result<bool> {
        let mut conn = self.store.pool_state().conn().await?;
        let threshold = self.threshold as i64;
        // Zero after the update can only mean the threshold was just reached.
        let count: i64 = sqlx::query(
            r#"INSERT INTO prediction_counter (slot, count)
               VALUES (0, CASE WHEN 1 >= $1 THEN 0 ELSE 1 END)
               ON CONFLICT (slot) DO UPDATE SET count =
                   CASE WHEN prediction_counter.count + 1 >= $1 THEN 0
                        ELSE prediction_counter.count + 1 END
               RETURNING count"#,
        )
        .bind(threshold)
        .fetch_one(&mut **conn)
        .await?
        .try_get("count")?;
        Ok(count == 0)
    }

    async fn current(&self) -> Result<u64> {
        let mut conn = self.store.pool_state().conn().await?;
        let count: Option<i64> =
            sqlx::query("SELECT count FROM prediction_counter WHERE slot = 0")
                .fetch_optional(&mut **conn)
                .await?
                .map(|row| row.try_get("count"))
                .transpose()?;
        Ok(count.unwrap_or(0) as u64)
    }
}

/// The counter selected by configuration.
#[derive(Debug)]
pub enum ConfiguredCounter {
    File(FileCounter),
    Sqlite(SqliteCounter),
}

impl ConfiguredCounter {
    pub async fn from_config(config: &CounterConfig, store: &ImageStore) -> Result<Self> {
        Ok(match config.backend {
            CounterBackend::File => {
                ConfiguredCounter::File(FileCounter::new(&config.path, config.threshold)?)
            }
            CounterBackend::Sqlite => {
                ConfiguredCounter::Sqlite(SqliteCounter::new(store.clone(), config.threshold).await?)
            }
        })
    }
}

impl PredictionCounter for ConfiguredCounter {
    async fn increment_and_check(&self) -> Result<bool> {
        match self {
            ConfiguredCounter::File(counter) => counter.increment_and_check().await,
            ConfiguredCounter::Sqlite(counter) => counter.increment_and_check().await,
        }
    }

    async fn current(&self) -> Result<u64> {
        match self {
            ConfiguredCounter::File(counter) => counter.current().await,
            ConfiguredCounter::Sqlite(counter) => counter.current().await,
        }
    }
}
