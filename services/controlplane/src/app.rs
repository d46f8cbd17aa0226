//! Control-plane HTTP application wiring.
//!
//! # Purpose
//! Builds the Axum router, configures middleware, and defines the shared
//! application state injected into handlers.
//!
//! # Notes
//! Every resource kind gets the same route set from [`with_kind_routes`];
//! only the create handler differs (instances go through the orchestrator,
//! subnets through the allocator and ports through the reserver).
//!
//! [`build_private_router`] serves the routes meant for other control-plane
//! services. It is bound to its own listener and never merged into the
//! tenant-facing router.
use crate::api;
use crate::api::openapi::ApiDoc;
use crate::api::types::{FeatureFlags, Region};
use crate::compute::{InstanceGroups, InstanceOrchestrator, QuotaProvider, Scheduler};
use crate::engine::{ChangeFeed, FeedConfig, PortReserver, SubnetAllocator, VersionedStore};
use crate::model::{Instance, LoadBalancer, Port, ResourceKind, Subnet, Vnet, Vpc};
use crate::observability;
use crate::retry::BackoffPolicy;
use crate::store::RecordBackend;
use axum::Router;
use axum::routing::{MethodRouter, delete, get, post, put};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use utoipa::OpenApi;

/// Retry and polling knobs shared by the engine components.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub cas_retry: BackoffPolicy,
    pub scheduling_retry: BackoffPolicy,
    pub feed: FeedConfig,
}

#[derive(Clone)]
pub struct AppState {
    pub region: Region,
    pub api_version: String,
    pub features: FeatureFlags,
    pub backend: Arc<dyn RecordBackend>,
    pub settings: EngineSettings,
    pub allocator: SubnetAllocator,
    pub ports: PortReserver,
    pub orchestrator: InstanceOrchestrator,
    pub groups: InstanceGroups,
}

impl AppState {
    pub fn new(
        region: Region,
        features: FeatureFlags,
        backend: Arc<dyn RecordBackend>,
        settings: EngineSettings,
        quota: Arc<dyn QuotaProvider>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let allocator = SubnetAllocator::new(
            VersionedStore::new(Arc::clone(&backend), settings.cas_retry),
            VersionedStore::new(Arc::clone(&backend), settings.cas_retry),
        );
        let orchestrator = InstanceOrchestrator::new(
            VersionedStore::new(Arc::clone(&backend), settings.cas_retry),
            VersionedStore::new(Arc::clone(&backend), settings.cas_retry),
            quota,
            scheduler,
            settings.scheduling_retry,
        );
        let ports = PortReserver::new(
            VersionedStore::new(Arc::clone(&backend), settings.cas_retry),
            VersionedStore::new(Arc::clone(&backend), settings.cas_retry),
        );
        let groups = InstanceGroups::new(
            orchestrator.clone(),
            VersionedStore::new(Arc::clone(&backend), settings.cas_retry),
        );
        Self {
            region,
            api_version: "v1".to_string(),
            features,
            backend,
            settings,
            allocator,
            ports,
            orchestrator,
            groups,
        }
    }

    pub fn records<K: ResourceKind>(&self) -> VersionedStore<K> {
        VersionedStore::new(Arc::clone(&self.backend), self.settings.cas_retry)
    }

    pub fn feed<K: ResourceKind>(&self) -> ChangeFeed<K> {
        ChangeFeed::new(Arc::clone(&self.backend), self.settings.feed)
    }
}

pub fn build_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/v1/system/info", get(api::system::system_info))
        .route("/v1/system/health", get(api::system::system_health))
        .route(
            "/v1/tenants/:tenant_id/instances/batch",
            post(api::instances::batch_create),
        )
        .route(
            "/v1/tenants/:tenant_id/instance-groups",
            post(api::instance_groups::create_group).get(api::instance_groups::search_groups),
        )
        .route(
            "/v1/tenants/:tenant_id/instance-groups/:name",
            get(api::instance_groups::get_group)
                .put(api::instance_groups::update_group)
                .delete(api::instance_groups::delete_group),
        )
        .route(
            "/v1/tenants/:tenant_id/instance-groups/:name/members/name/:member",
            delete(api::instance_groups::delete_member_by_name),
        )
        .route(
            "/v1/tenants/:tenant_id/instance-groups/:name/members/id/:resource_id",
            delete(api::instance_groups::delete_member_by_id),
        )
        .route(
            "/v1/tenants/:tenant_id/instance-groups/:name/scale-up",
            post(api::instance_groups::scale_up),
        );

    let router = with_kind_routes::<Instance>(router, post(api::instances::create_instance));
    let router = with_kind_routes::<Subnet>(router, post(api::subnets::create_subnet));
    let router = with_kind_routes::<Vpc>(router, post(api::resources::create::<Vpc>));
    let router = with_kind_routes::<Vnet>(router, post(api::resources::create::<Vnet>));
    let router = with_kind_routes::<Port>(router, post(api::ports::reserve_port));
    let router =
        with_kind_routes::<LoadBalancer>(router, post(api::resources::create::<LoadBalancer>));

    let router = router.merge(
        utoipa_swagger_ui::SwaggerUi::new("/docs").url("/v1/openapi.json", ApiDoc::openapi()),
    );
    with_tracing(router).with_state(state)
}

/// Routes for other control-plane services: quota bypass and explicit
/// placement.
pub fn build_private_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/v1/system/health", get(api::system::system_health))
        .route(
            "/v1/private/tenants/:tenant_id/instances/batch",
            post(api::instances::private_batch_create),
        )
        .route(
            "/v1/private/tenants/:tenant_id/instance-groups",
            post(api::instance_groups::private_create_group),
        );
    with_tracing(router).with_state(state)
}

fn with_tracing(router: Router<AppState>) -> Router<AppState> {
    let trace_layer =
        TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            let parent = observability::trace_context_from_headers(request.headers());
            let span = tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version()
            );
            span.set_parent(parent);
            span
        });
    router.layer(trace_layer)
}

fn with_kind_routes<K: ResourceKind>(
    router: Router<AppState>,
    create: MethodRouter<AppState>,
) -> Router<AppState> {
    let collection = format!("/v1/tenants/:tenant_id/{}", K::COLLECTION);
    router
        .route(&collection, create.get(api::resources::search::<K>))
        .route(
            &format!("{collection}/id/:resource_id"),
            get(api::resources::get_by_id::<K>)
                .put(api::resources::update_by_id::<K>)
                .delete(api::resources::delete_by_id::<K>),
        )
        .route(
            &format!("{collection}/name/:name"),
            get(api::resources::get_by_name::<K>)
                .put(api::resources::update_by_name::<K>)
                .delete(api::resources::delete_by_name::<K>),
        )
        .route(
            &format!("{collection}/id/:resource_id/status"),
            put(api::resources::update_status::<K>),
        )
        .route(
            &format!("{collection}/id/:resource_id/remove-finalizer"),
            post(api::resources::remove_finalizer::<K>),
        )
        .route(
            &format!("/v1/{}/search-stream", K::COLLECTION),
            get(api::feed::search_stream::<K>),
        )
        .route(
            &format!("/v1/{}/watch", K::COLLECTION),
            get(api::feed::watch::<K>),
        )
}
