#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use controlplane::api::types::{FeatureFlags, Region};
use controlplane::app::{AppState, EngineSettings, build_private_router, build_router};
use controlplane::compute::{Placement, Scheduler, StaticQuota};
use controlplane::engine::FeedConfig;
use controlplane::model::{Instance, Record};
use controlplane::retry::BackoffPolicy;
use controlplane::store::RecordBackend;
use controlplane::store::memory::InMemoryStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub type TestApp = axum::routing::RouterIntoService<Body, ()>;

/// Places every instance on cluster `c1`, one node per position.
pub struct RoundRobinScheduler;

#[async_trait]
impl Scheduler for RoundRobinScheduler {
    async fn schedule(
        &self,
        instances: &[Record<Instance>],
        _dry_run: bool,
    ) -> anyhow::Result<Vec<Placement>> {
        Ok((0..instances.len())
            .map(|index| Placement {
                cluster_id: "c1".to_string(),
                node_id: format!("n{index}"),
                partition: None,
            })
            .collect())
    }
}

pub fn fast_retry(max_attempts: u32) -> BackoffPolicy {
    BackoffPolicy {
        max_attempts,
        base_delay_ms: 1,
        factor: 1.0,
        jitter: 0.0,
        max_delay_ms: 5,
    }
}

pub fn test_state_with(backend: Arc<dyn RecordBackend>, instance_quota: i64) -> AppState {
    let settings = EngineSettings {
        cas_retry: fast_retry(5),
        scheduling_retry: fast_retry(3),
        feed: FeedConfig {
            poll_interval: Duration::from_millis(20),
            page_limit: 100,
        },
    };
    AppState::new(
        Region {
            region_id: "local".to_string(),
            display_name: "local".to_string(),
        },
        FeatureFlags {
            durable_storage: backend.is_durable(),
            scheduler: true,
        },
        backend,
        settings,
        Arc::new(StaticQuota::new(instance_quota, HashMap::new())),
        Arc::new(RoundRobinScheduler),
    )
}

pub fn test_state() -> AppState {
    test_state_with(Arc::new(InMemoryStore::new()), 10)
}

pub fn app() -> TestApp {
    build_router(test_state()).into_service()
}

pub fn app_with_quota(instance_quota: i64) -> TestApp {
    build_router(test_state_with(Arc::new(InMemoryStore::new()), instance_quota)).into_service()
}

/// Tenant-facing and private routers over one shared state.
pub fn public_and_private_apps(instance_quota: i64) -> (TestApp, TestApp) {
    let state = test_state_with(Arc::new(InMemoryStore::new()), instance_quota);
    (
        build_router(state.clone()).into_service(),
        build_private_router(state).into_service(),
    )
}

pub async fn read_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}
