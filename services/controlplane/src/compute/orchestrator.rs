//! Instance creation: quota, naming, vnet checks and scheduling before the
//! batch is written.
//!
//! # Key invariants
//! - Nothing is written unless every check passed and every instance has a
//!   placement.
//! - Tenant requests always count against quota and always go through the
//!   scheduler; placement fields they send are discarded.
//! - An internal caller either places every instance of a batch or none of
//!   them. Mixed batches are rejected.
//! - The batch is inserted atomically.
//! - A dry run performs every check (including a dry-run scheduling call) and
//!   returns the records that would have been written.
use crate::compute::quota::QuotaProvider;
use crate::compute::scheduler::{Placement, Scheduler};
use crate::engine::VersionedStore;
use crate::model::{Instance, NewResource, Record, RecordKey, SearchFilter, Vnet};
use crate::observability;
use crate::retry::{BackoffPolicy, retry_with_backoff};
use crate::store::{StoreError, StoreResult};
use anyhow::anyhow;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Origin of a create request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    Tenant,
    /// Other control-plane services, reached only through the private API.
    Internal { skip_quota_check: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateOptions {
    pub dry_run: bool,
    pub caller: Caller,
}

impl CreateOptions {
    pub fn tenant(dry_run: bool) -> Self {
        Self {
            dry_run,
            caller: Caller::Tenant,
        }
    }

    pub fn internal(dry_run: bool, skip_quota_check: bool) -> Self {
        Self {
            dry_run,
            caller: Caller::Internal { skip_quota_check },
        }
    }

    fn skips_quota(&self) -> bool {
        matches!(
            self.caller,
            Caller::Internal {
                skip_quota_check: true
            }
        )
    }
}

#[derive(Clone)]
pub struct InstanceOrchestrator {
    instances: VersionedStore<Instance>,
    vnets: VersionedStore<Vnet>,
    quota: Arc<dyn QuotaProvider>,
    scheduler: Arc<dyn Scheduler>,
    scheduling_retry: BackoffPolicy,
}

impl InstanceOrchestrator {
    pub fn new(
        instances: VersionedStore<Instance>,
        vnets: VersionedStore<Vnet>,
        quota: Arc<dyn QuotaProvider>,
        scheduler: Arc<dyn Scheduler>,
        scheduling_retry: BackoffPolicy,
    ) -> Self {
        Self {
            instances,
            vnets,
            quota,
            scheduler,
            scheduling_retry,
        }
    }

    pub async fn create(
        &self,
        tenant_id: &str,
        draft: NewResource<Instance>,
        options: CreateOptions,
    ) -> StoreResult<Record<Instance>> {
        self.create_batch(tenant_id, vec![draft], options)
            .await?
            .pop()
            .ok_or_else(|| StoreError::Unexpected(anyhow!("instance batch returned no records")))
    }

    pub async fn create_batch(
        &self,
        tenant_id: &str,
        drafts: Vec<NewResource<Instance>>,
        options: CreateOptions,
    ) -> StoreResult<Vec<Record<Instance>>> {
        if drafts.is_empty() {
            return Err(StoreError::InvalidArgument(
                "at least one instance is required".to_string(),
            ));
        }
        let mut records = drafts
            .into_iter()
            .map(|draft| self.instances.prepare(tenant_id, draft))
            .collect::<StoreResult<Vec<_>>>()?;
        if options.caller == Caller::Tenant {
            for record in &mut records {
                record.spec.clear_placement();
            }
        }
        let placed = explicitly_placed(&records)?;

        if options.skips_quota() {
            tracing::debug!(tenant_id, count = records.len(), "quota check skipped");
        } else {
            self.check_quota(tenant_id, &records).await?;
        }
        ensure_distinct_names(&records)?;
        self.ensure_names_free(tenant_id, &records).await?;
        self.check_vnets(tenant_id, &records).await?;

        if placed {
            tracing::debug!(tenant_id, count = records.len(), "instances carry placement, skipping scheduler");
        } else {
            self.schedule(&mut records, options.dry_run).await?;
        }

        if options.dry_run {
            tracing::info!(tenant_id, count = records.len(), "instance create dry run passed");
            return Ok(records);
        }
        let created = self.instances.insert_prepared(records).await?;
        tracing::info!(tenant_id, count = created.len(), "instances created");
        Ok(created)
    }

    /// Existing active instances of a type plus the requested count must fit
    /// the allowed quota.
    async fn check_quota(&self, tenant_id: &str, records: &[Record<Instance>]) -> StoreResult<()> {
        let mut requested: BTreeMap<&str, i64> = BTreeMap::new();
        for record in records {
            *requested.entry(record.spec.instance_type.as_str()).or_default() += 1;
        }

        for (instance_type, count) in requested {
            let filter = SearchFilter::default()
                .with_spec_field("instanceType", Value::String(instance_type.to_string()));
            let current = self
                .instances
                .search(tenant_id, &filter)
                .await
                .map_err(|err| quota_failure(tenant_id, err))?
                .len() as i64;
            let allowed = self
                .quota
                .allowed_quota(tenant_id, instance_type)
                .await
                .map_err(|err| quota_failure(tenant_id, err))?;
            tracing::debug!(tenant_id, instance_type, current, requested = count, allowed, "quota check");
            if allowed < current + count {
                metrics::counter!(observability::QUOTA_REJECTIONS, "instance_type" => instance_type.to_string())
                    .increment(1);
                return Err(StoreError::OutOfRange(format!(
                    "Your account has reached the maximum allowed limit for the {instance_type} instance you requested"
                )));
            }
        }
        Ok(())
    }

    async fn ensure_names_free(&self, tenant_id: &str, records: &[Record<Instance>]) -> StoreResult<()> {
        for record in records {
            let name = &record.metadata.name;
            match self.instances.get(tenant_id, &RecordKey::Name(name.clone())).await {
                Ok(_) => {
                    return Err(StoreError::AlreadyExists(format!(
                        "instance name {name} already exists"
                    )));
                }
                Err(StoreError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn check_vnets(&self, tenant_id: &str, records: &[Record<Instance>]) -> StoreResult<()> {
        let mut checked = HashSet::new();
        for record in records {
            let spec = &record.spec;
            if !checked.insert((spec.vnet.as_str(), spec.availability_zone.as_str())) {
                continue;
            }
            let vnet = match self.vnets.get(tenant_id, &RecordKey::Name(spec.vnet.clone())).await {
                Ok(vnet) => vnet,
                Err(StoreError::NotFound(_)) => {
                    return Err(StoreError::InvalidArgument(format!(
                        "vnet {} not found",
                        spec.vnet
                    )));
                }
                Err(err) => return Err(err),
            };
            if vnet.spec.availability_zone != spec.availability_zone {
                return Err(StoreError::InvalidArgument(format!(
                    "vnet {} is in availability zone {}, not {}",
                    spec.vnet, vnet.spec.availability_zone, spec.availability_zone
                )));
            }
        }
        Ok(())
    }

    async fn schedule(&self, records: &mut [Record<Instance>], dry_run: bool) -> StoreResult<()> {
        let batch: &[Record<Instance>] = records;
        let placements = retry_with_backoff(
            &self.scheduling_retry,
            "schedule_instances",
            |_: &anyhow::Error| true,
            |attempt| async move {
                metrics::counter!(observability::SCHEDULING_ATTEMPTS).increment(1);
                tracing::debug!(attempt, count = batch.len(), dry_run, "scheduling instances");
                let placements = self.scheduler.schedule(batch, dry_run).await?;
                validate_placements(batch.len(), &placements)?;
                Ok::<_, anyhow::Error>(placements)
            },
        )
        .await
        .map_err(|err| {
            tracing::warn!(error = %err, count = batch.len(), "scheduling failed");
            StoreError::ResourceExhausted(
                "insufficient capacity to place the requested instances".to_string(),
            )
        })?;

        for (record, placement) in records.iter_mut().zip(placements) {
            record.spec.cluster_id = Some(placement.cluster_id);
            record.spec.node_id = Some(placement.node_id);
            record.spec.partition = placement.partition;
        }
        Ok(())
    }
}

fn validate_placements(expected: usize, placements: &[Placement]) -> anyhow::Result<()> {
    if placements.len() != expected {
        anyhow::bail!(
            "scheduler returned {} results for {expected} instances",
            placements.len()
        );
    }
    if placements
        .iter()
        .any(|placement| placement.cluster_id.is_empty() || placement.node_id.is_empty())
    {
        anyhow::bail!("scheduler did not return clusterId or nodeId");
    }
    Ok(())
}

/// Whether the batch arrived fully placed. Partial placement, on one
/// instance or across the batch, is rejected.
fn explicitly_placed(records: &[Record<Instance>]) -> StoreResult<bool> {
    let with_placement = records
        .iter()
        .filter(|record| record.spec.has_placement())
        .count();
    if with_placement == 0 {
        return Ok(false);
    }
    if with_placement == records.len() && records.iter().all(|record| record.spec.is_placed()) {
        return Ok(true);
    }
    Err(StoreError::InvalidArgument(
        "explicit placement requires clusterId and nodeId on every instance of the batch"
            .to_string(),
    ))
}

fn ensure_distinct_names(records: &[Record<Instance>]) -> StoreResult<()> {
    let mut seen = HashSet::new();
    for record in records {
        if !seen.insert(record.metadata.name.as_str()) {
            return Err(StoreError::AlreadyExists(format!(
                "instance name {} is duplicated in the request",
                record.metadata.name
            )));
        }
    }
    Ok(())
}

fn quota_failure(tenant_id: &str, err: impl std::fmt::Display) -> StoreError {
    tracing::error!(tenant_id, error = %err, "quota lookup failed");
    StoreError::Unexpected(anyhow!("error in quota processing"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::quota::StaticQuota;
    use crate::model::{InstanceSpec, VnetSpec};
    use crate::store::RecordBackend;
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then places every instance.
    #[derive(Default)]
    struct FlakyScheduler {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Scheduler for FlakyScheduler {
        async fn schedule(
            &self,
            instances: &[Record<Instance>],
            _dry_run: bool,
        ) -> anyhow::Result<Vec<Placement>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                anyhow::bail!("scheduler unavailable");
            }
            Ok(instances
                .iter()
                .enumerate()
                .map(|(i, _)| Placement {
                    cluster_id: "cluster-a".to_string(),
                    node_id: format!("node-{i}"),
                    partition: None,
                })
                .collect())
        }
    }

    struct BrokenQuota;

    #[async_trait]
    impl QuotaProvider for BrokenQuota {
        async fn allowed_quota(&self, _: &str, _: &str) -> anyhow::Result<i64> {
            anyhow::bail!("quota service down")
        }
    }

    fn fast_retry() -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            factor: 2.0,
            jitter: 0.0,
            max_delay_ms: 2,
        }
    }

    struct Fixture {
        orchestrator: InstanceOrchestrator,
        instances: VersionedStore<Instance>,
        scheduler: Arc<FlakyScheduler>,
    }

    async fn fixture(failures: u32, quota: Arc<dyn QuotaProvider>) -> Fixture {
        let backend: Arc<dyn RecordBackend> = Arc::new(InMemoryStore::new());
        let instances = VersionedStore::new(Arc::clone(&backend), BackoffPolicy::cas_default());
        let vnets: VersionedStore<Vnet> = VersionedStore::new(backend, BackoffPolicy::cas_default());
        vnets
            .create(
                "t1",
                NewResource::named(
                    "net1",
                    VnetSpec {
                        region: "us-west".to_string(),
                        availability_zone: "az1".to_string(),
                        prefix_length: 24,
                    },
                ),
            )
            .await
            .expect("vnet");
        let scheduler = Arc::new(FlakyScheduler {
            failures,
            calls: AtomicU32::new(0),
        });
        let orchestrator = InstanceOrchestrator::new(
            instances.clone(),
            vnets,
            quota,
            scheduler.clone(),
            fast_retry(),
        );
        Fixture {
            orchestrator,
            instances,
            scheduler,
        }
    }

    const TENANT: CreateOptions = CreateOptions {
        dry_run: false,
        caller: Caller::Tenant,
    };

    fn quota(limit: i64) -> Arc<dyn QuotaProvider> {
        Arc::new(StaticQuota::new(limit, HashMap::new()))
    }

    fn draft(name: &str) -> NewResource<Instance> {
        NewResource::named(
            name,
            InstanceSpec {
                availability_zone: "az1".to_string(),
                instance_type: "small".to_string(),
                machine_image: "ubuntu".to_string(),
                vnet: "net1".to_string(),
                ssh_public_key_names: vec!["key1".to_string()],
                instance_group: None,
                instance_group_size: None,
                cluster_id: None,
                node_id: None,
                partition: None,
            },
        )
    }

    #[tokio::test]
    async fn batch_is_scheduled_and_written_atomically() {
        let fx = fixture(1, quota(10)).await;
        let created = fx
            .orchestrator
            .create_batch("t1", vec![draft("a"), draft("b")], TENANT)
            .await
            .expect("batch");
        assert_eq!(created.len(), 2);
        assert_eq!(created[1].spec.node_id.as_deref(), Some("node-1"));
        assert_eq!(fx.scheduler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            fx.instances.search("t1", &SearchFilter::default()).await.expect("search").len(),
            2
        );
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let fx = fixture(0, quota(10)).await;
        let planned = fx
            .orchestrator
            .create("t1", draft("a"), CreateOptions::tenant(true))
            .await
            .expect("dry run");
        assert!(planned.spec.is_placed());
        let err = fx
            .instances
            .get("t1", &RecordKey::Name("a".to_string()))
            .await
            .expect_err("not written");
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn quota_counts_existing_and_requested_instances() {
        let fx = fixture(0, quota(2)).await;
        fx.orchestrator.create("t1", draft("a"), TENANT).await.expect("first");
        let err = fx
            .orchestrator
            .create_batch("t1", vec![draft("b"), draft("c")], TENANT)
            .await
            .expect_err("over quota");
        assert!(matches!(err, StoreError::OutOfRange(_)));

        fx.orchestrator
            .create_batch(
                "t1",
                vec![draft("b"), draft("c")],
                CreateOptions::internal(false, true),
            )
            .await
            .expect("internal caller skips quota");
    }

    #[tokio::test]
    async fn quota_lookup_failure_is_internal() {
        let fx = fixture(0, Arc::new(BrokenQuota)).await;
        let err = fx
            .orchestrator
            .create("t1", draft("a"), TENANT)
            .await
            .expect_err("quota down");
        assert!(matches!(err, StoreError::Unexpected(e) if e.to_string() == "error in quota processing"));
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected_before_scheduling() {
        let fx = fixture(0, quota(10)).await;
        let err = fx
            .orchestrator
            .create_batch("t1", vec![draft("a"), draft("a")], TENANT)
            .await
            .expect_err("duplicate in batch");
        assert!(matches!(err, StoreError::AlreadyExists(_)));

        fx.orchestrator.create("t1", draft("a"), TENANT).await.expect("create");
        let calls = fx.scheduler.calls.load(Ordering::SeqCst);
        let err = fx
            .orchestrator
            .create("t1", draft("a"), TENANT)
            .await
            .expect_err("existing name");
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert_eq!(fx.scheduler.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn vnet_must_exist_in_the_same_zone() {
        let fx = fixture(0, quota(10)).await;
        let mut missing = draft("a");
        missing.spec.vnet = "nope".to_string();
        let err = fx
            .orchestrator
            .create("t1", missing, TENANT)
            .await
            .expect_err("missing vnet");
        assert!(matches!(err, StoreError::InvalidArgument(_)));

        let mut elsewhere = draft("a");
        elsewhere.spec.availability_zone = "az2".to_string();
        let err = fx
            .orchestrator
            .create("t1", elsewhere, TENANT)
            .await
            .expect_err("zone mismatch");
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn exhausted_scheduling_retries_fail_the_batch() {
        let fx = fixture(u32::MAX, quota(10)).await;
        let err = fx
            .orchestrator
            .create("t1", draft("a"), TENANT)
            .await
            .expect_err("unschedulable");
        assert!(matches!(err, StoreError::ResourceExhausted(_)));
        assert_eq!(fx.scheduler.calls.load(Ordering::SeqCst), 3);
    }

    fn placed(name: &str, node: &str) -> NewResource<Instance> {
        let mut placed = draft(name);
        placed.spec.cluster_id = Some("c9".to_string());
        placed.spec.node_id = Some(node.to_string());
        placed
    }

    #[tokio::test]
    async fn internal_placement_skips_the_scheduler() {
        let fx = fixture(u32::MAX, quota(10)).await;
        let created = fx
            .orchestrator
            .create_batch(
                "t1",
                vec![placed("a", "n9"), placed("b", "n8")],
                CreateOptions::internal(false, false),
            )
            .await
            .expect("placed");
        assert_eq!(created[0].spec.cluster_id.as_deref(), Some("c9"));
        assert_eq!(created[1].spec.node_id.as_deref(), Some("n8"));
        assert_eq!(fx.scheduler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tenant_placement_is_replaced_by_the_scheduler() {
        let fx = fixture(0, quota(10)).await;
        let created = fx
            .orchestrator
            .create("t1", placed("a", "n9"), TENANT)
            .await
            .expect("scheduled");
        assert_eq!(created.spec.cluster_id.as_deref(), Some("cluster-a"));
        assert_eq!(created.spec.node_id.as_deref(), Some("node-0"));
        assert_eq!(fx.scheduler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn partially_placed_batches_are_rejected() {
        let fx = fixture(0, quota(10)).await;
        let internal = CreateOptions::internal(false, false);

        let err = fx
            .orchestrator
            .create_batch("t1", vec![placed("a", "n9"), draft("b")], internal)
            .await
            .expect_err("mixed batch");
        assert!(matches!(err, StoreError::InvalidArgument(_)));

        let mut half = draft("c");
        half.spec.cluster_id = Some("c9".to_string());
        let err = fx
            .orchestrator
            .create("t1", half, internal)
            .await
            .expect_err("cluster without node");
        assert!(matches!(err, StoreError::InvalidArgument(_)));

        assert_eq!(fx.scheduler.calls.load(Ordering::SeqCst), 0);
        assert!(
            fx.instances
                .search("t1", &SearchFilter::default())
                .await
                .expect("search")
                .is_empty()
        );
    }
}
