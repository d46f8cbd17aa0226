//! OpenAPI schema aggregation for the control-plane API.
//!
//! # Purpose
//! Collects the documented routes and schema types into a single OpenAPI
//! document served next to the Swagger UI. Only the kind-specific routes are
//! listed; the generic resource and change-feed routes are not.
use crate::api::{
    instance_groups, instances, ports, subnets, system,
    types::{ErrorResponse, FeatureFlags, HealthStatus, Region, ScaleUpRequest, SystemInfo},
};
use crate::compute::{InstanceGroup, NewInstanceGroup, ScaleStatus};
use crate::model::{
    InstancePhase, InstanceSpec, ListenerSpec, LoadBalancerPhase, LoadBalancerSecurity,
    LoadBalancerSpec, PortPhase, PortSpec, SubnetPhase, SubnetSpec, VnetPhase, VnetSpec,
    VpcPhase, VpcSpec,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "nimbus-controlplane",
        version = "v1",
        description = "Nimbus provisioning control plane HTTP API"
    ),
    paths(
        system::system_info,
        system::system_health,
        instances::create_instance,
        instances::batch_create,
        instances::private_batch_create,
        instance_groups::create_group,
        instance_groups::scale_up,
        subnets::create_subnet,
        ports::reserve_port
    ),
    components(schemas(
        FeatureFlags,
        SystemInfo,
        HealthStatus,
        Region,
        ErrorResponse,
        InstanceSpec,
        InstancePhase,
        NewInstanceGroup,
        InstanceGroup,
        ScaleUpRequest,
        ScaleStatus,
        LoadBalancerSpec,
        ListenerSpec,
        LoadBalancerSecurity,
        LoadBalancerPhase,
        VnetSpec,
        VnetPhase,
        VpcSpec,
        VpcPhase,
        SubnetSpec,
        SubnetPhase,
        PortSpec,
        PortPhase
    )),
    tags(
        (name = "system", description = "System and discovery endpoints"),
        (name = "instances", description = "Instance scheduling and creation"),
        (name = "instance-groups", description = "Groups of identical instances"),
        (name = "subnets", description = "Subnet address allocation"),
        (name = "ports", description = "Port reservation inside a subnet"),
        (name = "private", description = "Internal listener for other control-plane services")
    )
)]
pub struct ApiDoc;
