//! VPC resource: the parent network subnets are carved from.
use super::record::{LifecyclePhase, ResourceKind};
use crate::store::Table;
use nimbus_common::cidr::CidrBlock;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vpc;

#[derive(Serialize, Deserialize, ToSchema, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VpcSpec {
    pub cidr_block: String,
}

#[derive(Serialize, Deserialize, ToSchema, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum VpcPhase {
    #[default]
    Ready,
    Deleting,
}

impl LifecyclePhase for VpcPhase {
    const DELETING: Self = VpcPhase::Deleting;
}

impl ResourceKind for Vpc {
    type Spec = VpcSpec;
    type Phase = VpcPhase;

    const TABLE: Table = Table::Vpc;
    const COLLECTION: &'static str = "vpcs";
    const KIND: &'static str = "vpc";

    fn validate_spec(spec: &VpcSpec) -> Result<(), String> {
        CidrBlock::parse(&spec.cidr_block)
            .and_then(|block| block.ensure_allocatable())
            .map_err(|err| err.to_string())
    }

    fn apply_spec_update(current: &VpcSpec, requested: VpcSpec) -> Result<VpcSpec, String> {
        // Existing subnets were validated against the current block.
        if current.cidr_block != requested.cidr_block {
            return Err("spec.cidrBlock is immutable".to_string());
        }
        Ok(requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(cidr: &str) -> VpcSpec {
        VpcSpec {
            cidr_block: cidr.to_string(),
        }
    }

    #[test]
    fn block_must_be_allocatable() {
        assert!(Vpc::validate_spec(&spec("10.0.0.0/16")).is_ok());
        assert!(Vpc::validate_spec(&spec("192.168.4.0/28")).is_ok());
        for cidr in ["10.0.0.0/8", "0.0.0.0/0", "10.0.0.0/30", "169.254.0.0/16", "10.0.0.1/16"] {
            assert!(Vpc::validate_spec(&spec(cidr)).is_err(), "{cidr}");
        }
    }

    #[test]
    fn cidr_block_is_immutable() {
        assert!(Vpc::apply_spec_update(&spec("10.0.0.0/16"), spec("10.1.0.0/16")).is_err());
        assert!(Vpc::apply_spec_update(&spec("10.0.0.0/16"), spec("10.0.0.0/16")).is_ok());
    }
}
