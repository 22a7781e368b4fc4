//! Integration tests for the prediction counters.
//!
//! Tests cover:
//! - `N / T` crossings for every backend
//! - Threshold validation
//! - Persistence of the file and table backends
//! - Exact crossing counts under concurrent callers, sharing one instance or
//!   holding separate instances on the same file or database

mod common;

use std::sync::Arc;

use common::*;
use rpsloop::{
    ConfiguredCounter, FileCounter, MemoryCounter, PredictionCounter, SqliteCounter,
    config::CounterBackend,
};

async fn crossings<K: PredictionCounter>(counter: &K, calls: usize) -> anyhow::Result<Vec<usize>> {
    let mut fired = Vec::new();
    for call in 1..=calls {
        if counter.increment_and_check().await? {
            fired.push(call);
        }
    }
    Ok(fired)
}

#[tokio::test]
async fn test_memory_counter_fires_every_threshold_calls() -> anyhow::Result<()> {
    let counter = MemoryCounter::new(3)?;
    assert_eq!(crossings(&counter, 10).await?, vec![3, 6, 9]);
    assert_eq!(counter.current().await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_threshold_one_fires_on_every_call() -> anyhow::Result<()> {
    let counter = MemoryCounter::new(1)?;
    assert_eq!(crossings(&counter, 4).await?, vec![1, 2, 3, 4]);
    assert_eq!(counter.current().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_zero_threshold_is_rejected() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    assert!(matches!(MemoryCounter::new(0), Err(Error::Configuration(_))));
    assert!(matches!(
        FileCounter::new(dir.path().join("c.json"), 0),
        Err(Error::Configuration(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_file_counter_starts_at_zero_and_persists() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("utils").join("prediction_counter.json");

    let counter = FileCounter::new(&path, 5)?;
    assert_eq!(counter.current().await?, 0);
    assert_eq!(crossings(&counter, 3).await?, Vec::<usize>::new());

    let stored: serde_json::Value = serde_json::from_slice(&std::fs::read(&path)?)?;
    assert_eq!(stored["count"], 3);

    // A new instance picks up where the previous one stopped
    let reopened = FileCounter::new(&path, 5)?;
    assert_eq!(reopened.current().await?, 3);
    assert_eq!(crossings(&reopened, 2).await?, vec![2]);
    assert_eq!(reopened.current().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_file_counter_rejects_corrupt_file() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("prediction_counter.json");
    std::fs::write(&path, b"not json")?;

    let counter = FileCounter::new(&path, 2)?;
    assert!(matches!(
        counter.increment_and_check().await,
        Err(Error::Json(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_sqlite_counter_fires_and_persists() -> anyhow::Result<()> {
    let (store, _dir) = create_test_store().await;
    let counter = SqliteCounter::new(store.clone(), 4).await?;
    assert_eq!(counter.current().await?, 0);
    assert_eq!(crossings(&counter, 9).await?, vec![4, 8]);
    assert_eq!(counter.current().await?, 1);

    let reopened = SqliteCounter::new(store, 4).await?;
    assert_eq!(reopened.current().await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_default_backend_is_the_shared_table() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let config = test_config(dir.path());
    let store = ImageStore::open_and_create(&config.store.database).await?;

    let counter = ConfiguredCounter::from_config(&config.counter, &store).await?;
    assert!(matches!(counter, ConfiguredCounter::Sqlite(_)));
    Ok(())
}

#[tokio::test]
async fn test_configured_counter_selects_backend() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let mut config = test_config(dir.path());
    let store = ImageStore::open_and_create(&config.store.database).await?;

    config.counter.threshold = 2;
    config.counter.backend = CounterBackend::File;
    let file = ConfiguredCounter::from_config(&config.counter, &store).await?;
    assert!(matches!(file, ConfiguredCounter::File(_)));
    assert_eq!(crossings(&file, 2).await?, vec![2]);

    config.counter.backend = CounterBackend::Sqlite;
    let table = ConfiguredCounter::from_config(&config.counter, &store).await?;
    assert!(matches!(table, ConfiguredCounter::Sqlite(_)));
    assert_eq!(crossings(&table, 3).await?, vec![2]);
    Ok(())
}

async fn hammer<K>(counter: Arc<K>, tasks: usize, per_task: usize) -> anyhow::Result<usize>
where
    K: PredictionCounter + Send + Sync + 'static,
{
    let mut handles = Vec::new();
    for _ in 0..tasks {
        let counter = counter.clone();
        handles.push(tokio::spawn(async move {
            let mut fired = 0usize;
            for _ in 0..per_task {
                if counter.increment_and_check().await? {
                    fired += 1;
                }
            }
            Ok::<_, rpsloop::Error>(fired)
        }));
    }
    let mut total = 0;
    for handle in handles {
        total += handle.await??;
    }
    Ok(total)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_memory_counter_crossings_are_exact() -> anyhow::Result<()> {
    let counter = Arc::new(MemoryCounter::new(7)?);
    assert_eq!(hammer(counter, 8, 25).await?, 200 / 7);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_file_counter_crossings_are_exact() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let counter = Arc::new(FileCounter::new(dir.path().join("c.json"), 5)?);
    assert_eq!(hammer(counter.clone(), 4, 10).await?, 40 / 5);
    assert_eq!(counter.current().await?, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sqlite_counter_crossings_are_exact() -> anyhow::Result<()> {
    let (store, _dir) = create_test_store().await;
    let counter = Arc::new(SqliteCounter::new(store, 3).await?);
    assert_eq!(hammer(counter.clone(), 4, 10).await?, 40 / 3);
    assert_eq!(counter.current().await?, 40 % 3);
    Ok(())
}

/// One counter per simulated process, all sharing `path`.
async fn hammer_separate<K, F>(
    mut make: F,
    instances: usize,
    per_instance: usize,
) -> anyhow::Result<usize>
where
    K: PredictionCounter + Send + Sync + 'static,
    F: FnMut() -> anyhow::Result<K>,
{
    let mut handles = Vec::new();
    for _ in 0..instances {
        let counter = make()?;
        handles.push(tokio::spawn(async move {
            let mut fired = 0usize;
            for _ in 0..per_instance {
                if counter.increment_and_check().await? {
                    fired += 1;
                }
            }
            Ok::<_, rpsloop::Error>(fired)
        }));
    }
    let mut total = 0;
    for handle in handles {
        total += handle.await??;
    }
    Ok(total)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_separate_file_counters_on_one_path_are_exact() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("utils").join("prediction_counter.json");

    let fired = hammer_separate(|| Ok(FileCounter::new(&path, 5)?), 4, 10).await?;
    assert_eq!(fired, 40 / 5);
    assert_eq!(FileCounter::new(&path, 5)?.current().await?, 0);

    // No writer leaves its temp file behind
    let leftovers: Vec<_> = std::fs::read_dir(path.parent().expect("has parent"))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_separate_stores_share_one_sqlite_count() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let db = dir.path().join("images.sqlite");
    ImageStore::open_and_create(&db).await?;

    let mut counters = Vec::new();
    for _ in 0..4 {
        // Each instance has its own pool, like a separate process would
        let store = ImageStore::open(&db).await?;
        counters.push(SqliteCounter::new(store, 3).await?);
    }
    let mut pool = counters.into_iter();
    let fired = hammer_separate(
        || pool.next().ok_or_else(|| anyhow::anyhow!("out of counters")),
        4,
        10,
    )
    .await?;
    assert_eq!(fired, 40 / 3);
    Ok(())
}
