//! Compute instance resource.
use super::record::{LifecyclePhase, ResourceKind};
use crate::store::Table;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instance;

#[derive(Serialize, Deserialize, ToSchema, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    pub availability_zone: String,
    pub instance_type: String,
    pub machine_image: String,
    /// Name of the vnet the instance attaches to.
    pub vnet: String,
    #[serde(default)]
    pub ssh_public_key_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_group: Option<String>,
    /// Active member count of the instance group, kept in sync by group
    /// operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_group_size: Option<u32>,
    /// Placement. Filled by the scheduler; only internal callers may supply it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
}

fn is_set(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|id| !id.is_empty())
}

impl InstanceSpec {
    pub fn is_placed(&self) -> bool {
        is_set(&self.cluster_id) && is_set(&self.node_id)
    }

    /// True when any placement field was supplied.
    pub fn has_placement(&self) -> bool {
        is_set(&self.cluster_id) || is_set(&self.node_id)
    }

    pub fn clear_placement(&mut self) {
        self.cluster_id = None;
        self.node_id = None;
        self.partition = None;
    }
}

#[derive(Serialize, Deserialize, ToSchema, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum InstancePhase {
    #[default]
    Provisioning,
    Ready,
    Stopping,
    Stopped,
    Terminating,
    Failed,
}

impl LifecyclePhase for InstancePhase {
    const DELETING: Self = InstancePhase::Terminating;
}

impl ResourceKind for Instance {
    type Spec = InstanceSpec;
    type Phase = InstancePhase;

    const TABLE: Table = Table::Instance;
    const COLLECTION: &'static str = "instances";
    const KIND: &'static str = "instance";

    fn validate_spec(spec: &InstanceSpec) -> Result<(), String> {
        let required = [
            ("availabilityZone", &spec.availability_zone),
            ("instanceType", &spec.instance_type),
            ("machineImage", &spec.machine_image),
            ("vnet", &spec.vnet),
        ];
        if let Some((field, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(format!("missing spec.{field}"));
        }
        if spec.ssh_public_key_names.iter().any(|key| key.trim().is_empty()) {
            return Err("spec.sshPublicKeyNames must not contain empty names".to_string());
        }
        Ok(())
    }

    /// Only `sshPublicKeyNames` changes. Placement and group fields belong
    /// to the server and are ignored in the request.
    fn apply_spec_update(
        current: &InstanceSpec,
        requested: InstanceSpec,
    ) -> Result<InstanceSpec, String> {
        let fixed = [
            ("availabilityZone", &current.availability_zone, &requested.availability_zone),
            ("instanceType", &current.instance_type, &requested.instance_type),
            ("machineImage", &current.machine_image, &requested.machine_image),
            ("vnet", &current.vnet, &requested.vnet),
        ];
        if let Some((field, _, _)) = fixed.iter().find(|(_, have, want)| have != want) {
            return Err(format!(
                "spec.{field} is immutable; only spec.sshPublicKeyNames can be updated"
            ));
        }
        Ok(InstanceSpec {
            ssh_public_key_names: requested.ssh_public_key_names,
            ..current.clone()
        })
    }
}
