//! Integration tests for the prediction bookkeeping path.

mod common;

use common::*;
use image::DynamicImage;
use rpsloop::{
    Classifier, MemoryCounter, PredictionCounter, PredictionService, TriggerClient,
    config::TriggerConfig,
};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

const DAG_PATH: &str = "/api/v1/dags/rock_paper_scissors_retrain_pipeline/dagRuns";

/// Always answers the same label.
struct Always(Label);

impl Classifier for Always {
    fn classify(&self, _image: &DynamicImage) -> rpsloop::Result<Label> {
        Ok(self.0)
    }
}

async fn mock_engine(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(DAG_PATH))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

fn trigger_for(server: &MockServer) -> anyhow::Result<TriggerClient> {
    Ok(TriggerClient::new(&TriggerConfig {
        endpoint: format!("{}{}", server.uri(), DAG_PATH),
        timeout_secs: 5,
        ..TriggerConfig::default()
    })?)
}

#[tokio::test]
async fn test_prediction_is_recorded_in_both_tables() -> anyhow::Result<()> {
    let (store, _dir) = create_test_store().await;
    let service = PredictionService::new(
        store.clone(),
        Always(Label::Paper),
        MemoryCounter::new(10)?,
        None,
    );

    let bytes = solid_png(GREEN, 12, 12);
    let prediction = service.predict(&bytes).await?;
    assert_eq!(prediction.label, Label::Paper);
    assert!(prediction.trigger.is_none());

    for (table, id) in [
        (Table::History, prediction.history_id),
        (Table::Pending, prediction.pending_id),
    ] {
        let record = store.fetch_latest(table).await?.expect("recorded");
        assert_eq!(Some(record.id), id);
        assert_eq!(record.label, "paper");
        assert_eq!(record.image, bytes);
    }
    assert_eq!(service.counter().current().await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_threshold_crossing_fires_trigger() -> anyhow::Result<()> {
    let server = mock_engine(200).await;
    let (store, _dir) = create_test_store().await;
    let service = PredictionService::new(
        store,
        Always(Label::Rock),
        MemoryCounter::new(2)?,
        Some(trigger_for(&server)?),
    );
    let bytes = solid_png(RED, 8, 8);

    let first = service.predict(&bytes).await?;
    assert!(first.trigger.is_none());

    let second = service.predict(&bytes).await?;
    let handle = second.trigger.expect("threshold reached");
    let run = handle.await??;
    assert!(run.run_id.starts_with("run_"));
    assert_eq!(server.received_requests().await.map(|r| r.len()), Some(1));
    assert_eq!(service.counter().current().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_rejected_trigger_does_not_fail_prediction() -> anyhow::Result<()> {
    let server = mock_engine(500).await;
    let (store, _dir) = create_test_store().await;
    let service = PredictionService::new(
        store,
        Always(Label::Scissors),
        MemoryCounter::new(1)?,
        Some(trigger_for(&server)?),
    );

    let prediction = service.predict(&solid_png(BLUE, 8, 8)).await?;
    assert_eq!(prediction.label, Label::Scissors);
    let outcome = prediction.trigger.expect("threshold reached").await?;
    assert!(matches!(outcome, Err(Error::Trigger { status: 500, .. })));
    Ok(())
}

#[tokio::test]
async fn test_storage_failure_does_not_fail_prediction() -> anyhow::Result<()> {
    let (store, _dir) = create_test_store().await;
    store.close().await?;
    let service = PredictionService::new(store, Always(Label::Rock), MemoryCounter::new(5)?, None);

    let prediction = service.predict(&solid_png(RED, 8, 8)).await?;
    assert_eq!(prediction.label, Label::Rock);
    assert_eq!(prediction.history_id, None);
    assert_eq!(prediction.pending_id, None);
    assert_eq!(service.counter().current().await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_undecodable_upload_is_rejected_before_bookkeeping() -> anyhow::Result<()> {
    let (store, _dir) = create_test_store().await;
    let service = PredictionService::new(
        store.clone(),
        Always(Label::Rock),
        MemoryCounter::new(5)?,
        None,
    );

    let result = service.predict(b"not an image").await;
    assert!(matches!(result, Err(Error::Decode { .. })));
    assert_eq!(store.count(Table::History).await?, 0);
    assert_eq!(store.count(Table::Pending).await?, 0);
    assert_eq!(service.counter().current().await?, 0);
    Ok(())
}
