//! Network port resource attached to a subnet.
use super::record::{LifecyclePhase, ResourceKind};
use crate::store::Table;
use nimbus_common::ids::ResourceId;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Port;

#[derive(Serialize, Deserialize, ToSchema, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PortSpec {
    #[schema(value_type = String, format = Uuid)]
    pub subnet_id: ResourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

#[derive(Serialize, Deserialize, ToSchema, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PortPhase {
    #[default]
    Pending,
    Active,
    Deleting,
}

impl LifecyclePhase for PortPhase {
    const DELETING: Self = PortPhase::Deleting;
}

fn is_mac_address(value: &str) -> bool {
    let octets: Vec<&str> = value.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|octet| octet.len() == 2 && u8::from_str_radix(octet, 16).is_ok())
}

impl ResourceKind for Port {
    type Spec = PortSpec;
    type Phase = PortPhase;

    const TABLE: Table = Table::Port;
    const COLLECTION: &'static str = "ports";
    const KIND: &'static str = "port";

    fn validate_spec(spec: &PortSpec) -> Result<(), String> {
        if let Some(ip) = &spec.ip_address {
            ip.parse::<Ipv4Addr>()
                .map_err(|_| format!("invalid spec.ipAddress {ip}"))?;
        }
        if let Some(mac) = &spec.mac_address {
            if !is_mac_address(mac) {
                return Err(format!("invalid spec.macAddress {mac}"));
            }
        }
        Ok(())
    }

    fn apply_spec_update(current: &PortSpec, requested: PortSpec) -> Result<PortSpec, String> {
        if current.subnet_id != requested.subnet_id {
            return Err("spec.subnetId is immutable".to_string());
        }
        Ok(requested)
    }
}
