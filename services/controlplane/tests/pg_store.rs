#![cfg(feature = "pg-tests")]

//! Record engine over a real Postgres database. Set
//! `NIMBUS_TEST_DATABASE_URL` (or `DATABASE_URL`); without it these tests skip.

use controlplane::config;
use controlplane::engine::{ChangeFeed, FeedConfig, SubnetAllocator, VersionedStore};
use controlplane::model::{NewResource, RecordKey, Subnet, SubnetSpec, Vpc, VpcSpec};
use controlplane::retry::BackoffPolicy;
use controlplane::store::postgres::PostgresStore;
use controlplane::store::{RecordBackend, StoreConfig, StoreError};
use serial_test::serial;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;

async fn reset_postgres(url: &str) -> Result<(), sqlx::Error> {
    let pool = match tokio::time::timeout(
        Duration::from_secs(2),
        PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(2))
            .connect(url),
    )
    .await
    {
        Ok(result) => result?,
        Err(_) => return Err(sqlx::Error::PoolTimedOut),
    };
    let exists: Option<String> = sqlx::query_scalar("SELECT to_regclass('vpc')::text")
        .fetch_one(&pool)
        .await?;
    if exists.is_some() {
        sqlx::query("TRUNCATE instance, load_balancer, vnet, vpc, subnet, port")
            .execute(&pool)
            .await?;
    }
    Ok(())
}

async fn pg_backend() -> Option<Arc<dyn RecordBackend>> {
    let url = match std::env::var("NIMBUS_TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
    {
        Ok(url) => url,
        Err(_) => {
            eprintln!("skipping pg-tests: set NIMBUS_TEST_DATABASE_URL or DATABASE_URL");
            return None;
        }
    };
    if let Err(err) = reset_postgres(&url).await {
        eprintln!("skipping pg-tests: cannot connect to postgres: {err}");
        return None;
    }
    let pg = config::PostgresConfig {
        url,
        max_connections: 8,
        connect_timeout_ms: 5_000,
        acquire_timeout_ms: 5_000,
    };
    match PostgresStore::connect(
        &pg,
        StoreConfig {
            changes_limit: config::DEFAULT_CHANGES_LIMIT,
        },
    )
    .await
    {
        Ok(store) => Some(Arc::new(store) as Arc<dyn RecordBackend>),
        Err(err) => {
            eprintln!("skipping pg-tests: connect postgres store failed: {err}");
            None
        }
    }
}

fn vpc(name: &str) -> NewResource<Vpc> {
    NewResource::named(
        name,
        VpcSpec {
            cidr_block: "10.0.0.0/16".to_string(),
        },
    )
}

#[tokio::test]
#[serial]
async fn pg_versions_increase_and_finalized_rows_reach_the_feed() {
    let Some(backend) = pg_backend().await else {
        return;
    };
    let store = VersionedStore::<Vpc>::new(Arc::clone(&backend), BackoffPolicy::cas_default());
    let feed = ChangeFeed::<Vpc>::new(
        Arc::clone(&backend),
        FeedConfig {
            poll_interval: Duration::from_millis(20),
            page_limit: 100,
        },
    );

    let created = store.create("t1", vpc("orders")).await.expect("create");
    let key = RecordKey::Id(created.metadata.resource_id);
    let updated = store
        .update_fields("t1", &key, Some(created.metadata.resource_version), None, None)
        .await
        .expect("update");
    assert!(updated.metadata.resource_version > created.metadata.resource_version);

    let page = feed
        .poll(created.metadata.resource_version - 1)
        .await
        .expect("poll");
    let labels: Vec<&str> = page.events.iter().map(|event| event.label()).collect();
    assert_eq!(labels, vec!["updated", "bookmark"]);
    assert_eq!(page.resume_from, updated.metadata.resource_version);

    store.mark_deletion_intent("t1", &key, None).await.expect("intent");
    store.remove_finalizer("t1", &key, None).await.expect("finalize");
    assert!(matches!(
        store.get("t1", &key).await,
        Err(StoreError::NotFound(_))
    ));
    let page = feed.poll(page.resume_from).await.expect("poll");
    let labels: Vec<&str> = page.events.iter().map(|event| event.label()).collect();
    assert_eq!(labels, vec!["deleted", "bookmark"]);

    // The name is reusable after finalization.
    store.create("t1", vpc("orders")).await.expect("recreate");
}

#[tokio::test]
#[serial]
async fn pg_duplicate_active_names_are_rejected() {
    let Some(backend) = pg_backend().await else {
        return;
    };
    let store = VersionedStore::<Vpc>::new(backend, BackoffPolicy::cas_default());
    store.create("t1", vpc("dup")).await.expect("create");
    assert!(matches!(
        store.create("t1", vpc("dup")).await,
        Err(StoreError::AlreadyExists(_))
    ));
    store.create("t2", vpc("dup")).await.expect("other tenant");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn pg_concurrent_overlapping_subnets_admit_one() {
    let Some(backend) = pg_backend().await else {
        return;
    };
    let vpcs = VersionedStore::<Vpc>::new(Arc::clone(&backend), BackoffPolicy::cas_default());
    let parent = vpcs.create("t1", vpc("net")).await.expect("vpc");
    let allocator = SubnetAllocator::new(
        VersionedStore::new(Arc::clone(&backend), BackoffPolicy::cas_default()),
        vpcs,
    );

    let mut tasks = Vec::new();
    for index in 0..6 {
        let allocator = allocator.clone();
        let draft = NewResource::<Subnet>::named(
            format!("s{index}"),
            SubnetSpec {
                vpc_id: parent.metadata.resource_id,
                cidr_block: "10.0.8.0/24".to_string(),
                availability_zone: "az1".to_string(),
            },
        );
        tasks.push(tokio::spawn(async move { allocator.create("t1", draft).await }));
    }
    let mut admitted = 0;
    for task in tasks {
        if task.await.expect("join").is_ok() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 1);
}
