use sqlx::{
    Connection, Sqlite, Transaction,
    pool::PoolConnection,
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
    },
};
use tokio::sync::{RwLock, RwLockReadGuard};

use std::{
    ops::{Deref, DerefMut},
    path::{Path, PathBuf},
    time::Duration,
};

use crate::error::{Error, Result};

const MAX_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct PoolState {
    db_file: PathBuf,
    pool: RwLock<SqlitePool>,
}

impl std::fmt::Debug for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolState")
            .field("db_file", &self.db_file)
            .finish()
    }
}

impl PoolState {
    pub(crate) async fn open<P: AsRef<Path>>(db_file: P) -> Result<Self> {
        let db_file = db_file.as_ref().to_path_buf();
        if let Some(parent) = db_file.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent, e))?;
        }
        let pool = Self::connect(&db_file).await?;
        Ok(Self {
            db_file,
            pool: RwLock::new(pool),
        })
    }

    async fn connect(db_file: &Path) -> Result<SqlitePool> {
        let connect_opts = SqliteConnectOptions::new()
            .filename(db_file)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        Ok(SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(connect_opts)
            .await?)
    }

    /// Acquire a pooled connection and hold the pool read lock for the entire lifetime
    /// of the returned guard.
    pub(crate) async fn conn(&self) -> Result<DbConnGuard<'_>> {
        let pool_guard = self.pool.read().await;

        // Acquire while the read lock is held; the guard keeps it held.
        let conn = pool_guard.acquire().await?;

        Ok(DbConnGuard {
            _pool_guard: pool_guard,
            conn,
        })
    }

    /// Runs `f` against the pool itself, e.g. for migrations.
    pub(crate) async fn with_pool<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(SqlitePool) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let pool_guard = self.pool.read().await;
        f(pool_guard.clone()).await
    }

    /// Exclusive close:
    /// - waits for all in-flight queries (takes the WRITE lock)
    /// - checkpoints the WAL so the db file is current
    /// - closes the pool to release file handles
    pub(crate) async fn close(&self) -> Result<()> {
        let pool_guard = self.pool.write().await;
        if pool_guard.is_closed() {
            return Ok(());
        }
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE);")
            .execute(&*pool_guard)
            .await?;
        pool_guard.close().await;
        log::debug!("closed database {:?}", self.db_file);
        Ok(())
    }

    pub(crate) fn db_file(&self) -> &Path {
        &self.db_file
    }
}

pub(crate) struct DbConnGuard<'a> {
    _pool_guard: RwLockReadGuard<'a, SqlitePool>,
    conn: PoolConnection<Sqlite>,
}

impl<'a> Deref for DbConnGuard<'a> {
    type Target = PoolConnection<Sqlite>;
    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<'a> DerefMut for DbConnGuard<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl<'a> DbConnGuard<'a> {
    pub(crate) async fn begin_transaction(&mut self) -> Result<Transaction<'_, Sqlite>> {
        Ok(self.conn.begin().await?)
    }
}
