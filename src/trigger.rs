//! Client for starting a retraining run on the workflow engine.

use std::{collections::BTreeMap, time::Duration};

use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use uuid::Uuid;

use crate::{
    config::TriggerConfig,
    error::{Error, Result},
};

/// A run request accepted by the workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineRun {
    #[serde(rename = "dag_run_id")]
    pub run_id: String,
    #[serde(skip)]
    pub requested_at: OffsetDateTime,
    pub conf: BTreeMap<String, Value>,
}

impl PipelineRun {
    /// A fresh run request. Ids combine the request time with random bits, so two
    /// calls never produce the same id and the engine never deduplicates them.
    pub fn new(conf: BTreeMap<String, Value>) -> Self {
        let requested_at = OffsetDateTime::now_utc();
        let stamp = requested_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| requested_at.unix_timestamp_nanos().to_string());
        let nonce = Uuid::new_v4().simple().to_string();
        Self {
            run_id: format!("run_{}_{}", stamp, &nonce[..8]),
            requested_at,
            conf,
        }
    }
}

/// Fires retraining runs. Never retries; callers decide what a failure means.
#[derive(Debug, Clone)]
pub struct TriggerClient {
    client: reqwest::Client,
    endpoint: String,
    username: String,
    password: String,
}

impl TriggerClient {
    pub fn new(config: &TriggerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn trigger(&self, conf: BTreeMap<String, Value>) -> Result<PipelineRun> {
        let run = PipelineRun::new(conf);
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .json(&run)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Trigger {
                status: status.as_u16(),
                body,
            });
        }
        log::info!("pipeline run {} requested at {}", run.run_id, self.endpoint);
        Ok(run)
    }
}
