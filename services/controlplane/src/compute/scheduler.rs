//! Placement of instances onto clusters and nodes.
//!
//! The scheduler itself is an external service. [`HttpScheduler`] talks to it
//! over JSON; [`UnconfiguredScheduler`] stands in when no URL is configured, in
//! which case instances must be created with explicit placement.
use crate::model::{Instance, Record};
use anyhow::{Context, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// One placement per instance, in batch order. With `dry_run` the
    /// scheduler must not reserve capacity.
    async fn schedule(
        &self,
        instances: &[Record<Instance>],
        dry_run: bool,
    ) -> anyhow::Result<Vec<Placement>>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleRequest<'a> {
    instances: &'a [Record<Instance>],
    dry_run: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleResponse {
    #[serde(default)]
    instance_results: Vec<Placement>,
}

pub struct HttpScheduler {
    client: reqwest::Client,
    url: String,
}

impl HttpScheduler {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build scheduler client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Scheduler for HttpScheduler {
    async fn schedule(
        &self,
        instances: &[Record<Instance>],
        dry_run: bool,
    ) -> anyhow::Result<Vec<Placement>> {
        let response = self
            .client
            .post(&self.url)
            .json(&ScheduleRequest { instances, dry_run })
            .send()
            .await
            .context("send schedule request")?
            .error_for_status()
            .context("schedule request rejected")?;
        let body: ScheduleResponse = response.json().await.context("decode schedule response")?;
        Ok(body.instance_results)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredScheduler;

#[async_trait]
impl Scheduler for UnconfiguredScheduler {
    async fn schedule(
        &self,
        _instances: &[Record<Instance>],
        _dry_run: bool,
    ) -> anyhow::Result<Vec<Placement>> {
        bail!("no scheduler configured")
    }
}
