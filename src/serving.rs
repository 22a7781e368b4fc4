//! Bookkeeping around a served prediction.
//!
//! Classification decides the response. Storing the image, counting it and firing
//! the retraining trigger happen afterwards and never turn a successful
//! classification into an error.

use std::collections::BTreeMap;

use image::DynamicImage;
use tokio::task::JoinHandle;

use crate::{
    core::db::{ImageRepository, Label, Table},
    counter::PredictionCounter,
    error::{Error, Result},
    trigger::{PipelineRun, TriggerClient},
};

pub trait Classifier {
    fn classify(&self, image: &DynamicImage) -> Result<Label>;
}

#[derive(Debug)]
pub struct Prediction {
    pub label: Label,
    pub history_id: Option<i64>,
    pub pending_id: Option<i64>,
    /// Set when this prediction crossed the counter threshold and a trigger is in
    /// flight. Dropping the handle does not cancel the trigger.
    pub trigger: Option<JoinHandle<Result<PipelineRun>>>,
}

pub struct PredictionService<S, C, K> {
    store: S,
    classifier: C,
    counter: K,
    trigger: Option<TriggerClient>,
}

impl<S, C, K> PredictionService<S, C, K>
where
    S: ImageRepository,
    C: Classifier,
    K: PredictionCounter,
{
    pub fn new(store: S, classifier: C, counter: K, trigger: Option<TriggerClient>) -> Self {
        Self {
            store,
            classifier,
            counter,
            trigger,
        }
    }

    pub fn counter(&self) -> &K {
        &self.counter
    }

    pub async fn predict(&self, image_bytes: &[u8]) -> Result<Prediction> {
        let image = image::load_from_memory(image_bytes)
            .map_err(|e| Error::decode("uploaded image", e))?;
        let label = self.classifier.classify(&image)?;
        log::info!("prediction: {}", label);

        let history_id = self.record(Table::History, image_bytes, label).await;
        let pending_id = self.record(Table::Pending, image_bytes, label).await;

        let crossed = match self.counter.increment_and_check().await {
            Ok(crossed) => crossed,
            Err(e) => {
                log::warn!("prediction counter update failed: {}", e);
                false
            }
        };

        let trigger = match (&self.trigger, crossed) {
            (Some(client), true) => Some(spawn_trigger(client.clone())),
            (None, true) => {
                log::info!("threshold reached but no trigger client is configured");
                None
            }
            _ => None,
        };

        Ok(Prediction {
            label,
            history_id,
            pending_id,
            trigger,
        })
    }

    async fn record(&self, table: Table, image_bytes: &[u8], label: Label) -> Option<i64> {
        match self.store.insert(table, image_bytes, label.as_str()).await {
            Ok(id) => Some(id),
            Err(e) => {
                log::error!("failed to insert image into '{}': {}", table, e);
                None
            }
        }
    }
}

/// Fire-and-forget: failures are logged here and also available through the handle.
fn spawn_trigger(client: TriggerClient) -> JoinHandle<Result<PipelineRun>> {
    tokio::spawn(async move {
        let result = client.trigger(BTreeMap::new()).await;
        match &result {
            Ok(run) => log::info!("retraining triggered as {}", run.run_id),
            Err(e) => log::warn!("retraining trigger failed: {}", e),
        }
        result
    })
}
