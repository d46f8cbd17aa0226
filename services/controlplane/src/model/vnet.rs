//! Virtual network resource. Instances attach to a vnet by name.
use super::record::{LifecyclePhase, ResourceKind};
use crate::store::Table;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vnet;

#[derive(Serialize, Deserialize, ToSchema, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VnetSpec {
    pub region: String,
    pub availability_zone: String,
    pub prefix_length: u8,
}

#[derive(Serialize, Deserialize, ToSchema, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum VnetPhase {
    #[default]
    Ready,
    Deleting,
}

impl LifecyclePhase for VnetPhase {
    const DELETING: Self = VnetPhase::Deleting;
}

impl ResourceKind for Vnet {
    type Spec = VnetSpec;
    type Phase = VnetPhase;

    const TABLE: Table = Table::Vnet;
    const COLLECTION: &'static str = "vnets";
    const KIND: &'static str = "vnet";

    fn validate_spec(spec: &VnetSpec) -> Result<(), String> {
        if spec.region.trim().is_empty() {
            return Err("missing spec.region".to_string());
        }
        if spec.availability_zone.trim().is_empty() {
            return Err("missing spec.availabilityZone".to_string());
        }
        if !(1..=32).contains(&spec.prefix_length) {
            return Err("spec.prefixLength should be between 1 and 32".to_string());
        }
        Ok(())
    }
}
