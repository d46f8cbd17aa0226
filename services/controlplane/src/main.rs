//! Nimbus control-plane HTTP service entry point.
//!
//! # Purpose
//! Wires configuration, the record backend, the quota provider and scheduler
//! client into the HTTP routers, then serves them until shutdown. The public
//! router, the private router and metrics each get their own listener.
//!
//! # Notes
//! The `build_state` helper keeps wiring testable and minimizes main setup logic.
use anyhow::Context;
use controlplane::api::types::{FeatureFlags, Region};
use controlplane::app::{AppState, EngineSettings, build_private_router, build_router};
use controlplane::compute::{HttpScheduler, Scheduler, StaticQuota, UnconfiguredScheduler};
use controlplane::config::{self, ControlPlaneConfig};
use controlplane::engine::FeedConfig;
use controlplane::observability;
use controlplane::store::{RecordBackend, StoreConfig, memory::InMemoryStore, postgres::PostgresStore};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ControlPlaneConfig::from_env_or_yaml().context("control plane config")?;
    run_with_shutdown(config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(config: ControlPlaneConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle =
        observability::init_observability("nimbus-controlplane", &config.region_id)?;
    let state = build_state(config.clone()).await?;
    tracing::info!(
        backend = state.backend.backend_name(),
        region_id = %state.region.region_id,
        scheduler = state.features.scheduler,
        "control plane state ready"
    );
    let metrics_listener = tokio::net::TcpListener::bind(config.metrics_bind)
        .await
        .with_context(|| format!("bind metrics listener {}", config.metrics_bind))?;
    let metrics_task = tokio::spawn(observability::serve_metrics(metrics_handle, metrics_listener));

    let private_task = match config.private_bind {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("bind private listener {addr}"))?;
            tracing::info!(%addr, "private api listening");
            let router = build_private_router(state.clone());
            Some(tokio::spawn(async move {
                if let Err(err) = axum::serve(listener, router.into_make_service()).await {
                    tracing::error!(error = %err, "private api server stopped");
                }
            }))
        }
        None => None,
    };

    let app = build_router(state);

    let addr = config.bind_addr;
    tracing::info!(%addr, "control plane listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tokio::pin!(shutdown);
    tokio::select! {
        result = axum::serve(listener, app.into_make_service()) => {
            result?;
        }
        _ = &mut shutdown => {}
    }

    if let Some(task) = private_task {
        task.abort();
        let _ = task.await;
    }
    metrics_task.abort();
    let _ = metrics_task.await;
    Ok(())
}

async fn build_state(config: ControlPlaneConfig) -> anyhow::Result<AppState> {
    let backend: Arc<dyn RecordBackend> = match config.storage {
        config::StorageBackend::Memory => Arc::new(InMemoryStore::new()),
        config::StorageBackend::Postgres => {
            let pg = config
                .postgres
                .as_ref()
                .context("postgres configuration missing")?;
            let store_config = StoreConfig {
                changes_limit: config.changes_limit,
            };
            Arc::new(PostgresStore::connect(pg, store_config).await?)
        }
    };

    let scheduler: Arc<dyn Scheduler> = match &config.scheduler_url {
        Some(url) => Arc::new(HttpScheduler::new(
            url.clone(),
            Duration::from_millis(config.scheduler_timeout_ms),
        )?),
        None => {
            tracing::warn!("no scheduler configured; instances need explicit placement through the private api");
            Arc::new(UnconfiguredScheduler)
        }
    };
    let quota = Arc::new(StaticQuota::new(
        config.quota.default_limit,
        config.quota.per_instance_type.clone(),
    ));

    let settings = EngineSettings {
        cas_retry: config.cas_retry,
        scheduling_retry: config.scheduling_retry,
        feed: FeedConfig {
            poll_interval: config.watch_poll_interval(),
            page_limit: config.changes_limit,
        },
    };
    let features = FeatureFlags {
        durable_storage: backend.is_durable(),
        scheduler: config.scheduler_url.is_some(),
    };
    let region = Region {
        display_name: config.region_id.clone(),
        region_id: config.region_id,
    };
    Ok(AppState::new(region, features, backend, settings, quota, scheduler))
}
