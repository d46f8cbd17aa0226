//! Subnet resource. Created only through the CIDR allocator.
use super::record::{LifecyclePhase, ResourceKind};
use crate::store::Table;
use nimbus_common::cidr::CidrBlock;
use nimbus_common::ids::ResourceId;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet;

#[derive(Serialize, Deserialize, ToSchema, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    #[schema(value_type = String, format = Uuid)]
    pub vpc_id: ResourceId,
    pub cidr_block: String,
    pub availability_zone: String,
}

#[derive(Serialize, Deserialize, ToSchema, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SubnetPhase {
    #[default]
    Provisioning,
    Ready,
    Deleting,
}

impl LifecyclePhase for SubnetPhase {
    const DELETING: Self = SubnetPhase::Deleting;
}

impl ResourceKind for Subnet {
    type Spec = SubnetSpec;
    type Phase = SubnetPhase;

    const TABLE: Table = Table::Subnet;
    const COLLECTION: &'static str = "subnets";
    const KIND: &'static str = "subnet";

    fn validate_spec(spec: &SubnetSpec) -> Result<(), String> {
        if spec.availability_zone.trim().is_empty() {
            return Err("missing spec.availabilityZone".to_string());
        }
        let block = CidrBlock::parse(&spec.cidr_block).map_err(|err| err.to_string())?;
        block.ensure_allocatable().map_err(|err| err.to_string())
    }

    fn apply_spec_update(current: &SubnetSpec, requested: SubnetSpec) -> Result<SubnetSpec, String> {
        if current.vpc_id != requested.vpc_id || current.cidr_block != requested.cidr_block {
            return Err("spec.vpcId and spec.cidrBlock are immutable".to_string());
        }
        Ok(requested)
    }
}
