mod model;
mod state;

use std::{path::Path, sync::Arc};

use sqlx::{Row, sqlite::SqliteRow};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::error::Result;

pub use model::{ImageRecord, Label, PendingSnapshot, Table};
pub(crate) use state::PoolState;

/// Durable storage for served images.
///
/// Every operation acquires a pooled connection for its own duration; a failure to
/// acquire or execute surfaces as [`crate::Error::Storage`] and nothing is assumed
/// to have been written.
pub trait ImageRepository {
    /// Create `table` if it does not exist yet.
    fn create(&self, table: Table) -> impl Future<Output = Result<()>> + Send;
    fn insert(&self, table: Table, image: &[u8], label: &str)
    -> impl Future<Output = Result<i64>> + Send;
    fn fetch_latest(
        &self,
        table: Table,
    ) -> impl Future<Output = Result<Option<ImageRecord>>> + Send;
    /// Remove and return every row; the returned set is exactly the removed set.
    fn drain(&self, table: Table) -> impl Future<Output = Result<Vec<ImageRecord>>> + Send;
    fn clear(&self, table: Table) -> impl Future<Output = Result<u64>> + Send;
    /// Read every row plus the highest id read, without deleting anything.
    fn snapshot(&self, table: Table) -> impl Future<Output = Result<PendingSnapshot>> + Send;
    /// Delete rows with `id <= fence`. Rows inserted after the snapshot survive.
    fn clear_through(
        &self,
        table: Table,
        fence: i64,
    ) -> impl Future<Output = Result<u64>> + Send;
    fn count(&self, table: Table) -> impl Future<Output = Result<u64>> + Send;
}

#[derive(Debug, Clone)]
pub struct ImageStore {
    state: Arc<PoolState>,
}

impl ImageStore {
    pub async fn open<P: AsRef<Path>>(db_file: P) -> Result<Self> {
        Ok(Self {
            state: Arc::new(PoolState::open(db_file).await?),
        })
    }

    /// Open the database and make sure both image tables exist.
    pub async fn open_and_create<P: AsRef<Path>>(db_file: P) -> Result<Self> {
        let store = Self::open(db_file).await?;
        store.create(Table::History).await?;
        store.create(Table::Pending).await?;
        Ok(store)
    }

    pub fn db_file(&self) -> &Path {
        self.state.db_file()
    }

    /// Checkpoint and close the underlying pool. Further calls fail.
    pub async fn close(&self) -> Result<()> {
        self.state.close().await
    }

    pub(crate) fn pool_state(&self) -> &PoolState {
        &self.state
    }
}

fn record_from_row(row: &SqliteRow) -> Result<ImageRecord> {
    let captured_at: String = row.try_get("timestamp")?;
    let captured_at = OffsetDateTime::parse(&captured_at, &Rfc3339).map_err(|e| {
        sqlx::Error::ColumnDecode {
            index: "timestamp".to_string(),
            source: Box::new(e),
        }
    })?;
    Ok(ImageRecord {
        id: row.try_get("id")?,
        image: row.try_get("image")?,
        label: row.try_get("label")?,
        captured_at,
        _guard: (),
    })
}

fn records_from_rows(rows: &[SqliteRow]) -> Result<Vec<ImageRecord>> {
    let mut records = rows.iter().map(record_from_row).collect::<Result<Vec<_>>>()?;
    // RETURNING gives no ordering guarantee
    records.sort_by_key(|r| r.id);
    Ok(records)
}

impl ImageRepository for ImageStore {
    async fn create(&self, table: Table) -> Result<()> {
        let mut conn = self.state.conn().await?;
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                image BLOB NOT NULL,
                label TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )"#,
            table.name()
        ))
        .execute(&mut **conn)
        .await?;
        log::info!("table '{}' created or already exists", table);
        Ok(())
    }

    async fn insert(&self, table: Table, image: &[u8], label: &str) -> Result<i64> {
        let captured_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        let mut conn = self.state.conn().await?;
        let id: i64 = sqlx::query(&format!(
            "INSERT INTO {} (image, label, timestamp) VALUES ($1, $2, $3) RETURNING id",
            table.name()
        ))
        .bind(image)
        .bind(label)
        .bind(captured_at)
        .fetch_one(&mut **conn)
        .await?
        .try_get("id")?;
        log::debug!("image record {} inserted into '{}'", id, table);
        Ok(id)
    }

    async fn fetch_latest(&self, table: Table) -> Result<Option<ImageRecord>> {
        let mut conn = self.state.conn().await?;
        sqlx::query(&format!(
            "SELECT id, image, label, timestamp FROM {} ORDER BY id DESC LIMIT 1",
            table.name()
        ))
        .fetch_optional(&mut **conn)
        .await?
        .as_ref()
        .map(record_from_row)
        .transpose()
    }

    async fn drain(&self, table: Table) -> Result<Vec<ImageRecord>> {
        let mut conn = self.state.conn().await?;
        // A single statement: the rows returned are the rows deleted.
        let rows = sqlx::query(&format!(
            "DELETE FROM {} RETURNING id, image, label, timestamp",
            table.name()
        ))
        .fetch_all(&mut **conn)
        .await?;
        log::info!("drained {} record(s) from '{}'", rows.len(), table);
        records_from_rows(&rows)
    }

    async fn clear(&self, table: Table) -> Result<u64> {
        let mut conn = self.state.conn().await?;
        let deleted = sqlx::query(&format!("DELETE FROM {}", table.name()))
            .execute(&mut **conn)
            .await?
            .rows_affected();
        log::info!("table '{}' cleared ({} row(s))", table, deleted);
        Ok(deleted)
    }

    async fn snapshot(&self, table: Table) -> Result<PendingSnapshot> {
        let mut conn = self.state.conn().await?;
        let rows = sqlx::query(&format!(
            "SELECT id, image, label, timestamp FROM {} ORDER BY id ASC",
            table.name()
        ))
        .fetch_all(&mut **conn)
        .await?;
        let records = records_from_rows(&rows)?;
        let fence = records.last().map(|r| r.id);
        Ok(PendingSnapshot { records, fence })
    }

    async fn clear_through(&self, table: Table, fence: i64) -> Result<u64> {
        let mut conn = self.state.conn().await?;
        let deleted = sqlx::query(&format!("DELETE FROM {} WHERE id <= $1", table.name()))
            .bind(fence)
            .execute(&mut **conn)
            .await?
            .rows_affected();
        log::info!(
            "cleared {} record(s) from '{}' through id {}",
            deleted,
            table,
            fence
        );
        Ok(deleted)
    }

    async fn count(&self, table: Table) -> Result<u64> {
        let mut conn = self.state.conn().await?;
        let count: i64 = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {}", table.name()))
            .fetch_one(&mut **conn)
            .await?
            .try_get("n")?;
        Ok(count as u64)
    }
}
