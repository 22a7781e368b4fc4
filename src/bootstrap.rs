//! Infrastructure setup with a fixed retry budget.

use std::time::Duration;

use crate::{
    config::{Config, CounterBackend},
    core::{db::ImageStore, tracking::Tracking},
    counter::SqliteCounter,
    error::Result,
};

/// Run `op` up to `attempts` times, sleeping `backoff` between failures. The last
/// error is returned once the budget is spent.
pub async fn with_retries<T, F, Fut>(
    what: &str,
    attempts: u32,
    backoff: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        log::info!("[Try {}] attempting {}...", attempt, what);
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                log::warn!("error during {}: {}", what, e);
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => {
                log::error!("exceeded max retries ({}) for {}: {}", attempts, what, e);
                return Err(e);
            }
        }
    }
}

/// Create the image tables, the counter table when used, and the tracking schema.
pub async fn setup(config: &Config) -> Result<(ImageStore, Tracking)> {
    let backoff = Duration::from_secs(config.setup.backoff_secs);
    with_retries("database setup", config.setup.attempts, backoff, || async {
        let store = ImageStore::open_and_create(&config.store.database).await?;
        if config.counter.backend == CounterBackend::Sqlite {
            SqliteCounter::new(store.clone(), config.counter.threshold).await?;
        }
        let tracking = Tracking::open(&config.tracking).await?;
        log::info!("database and tables created successfully");
        Ok((store, tracking))
    })
    .await
}
