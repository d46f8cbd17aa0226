//! Load balancer resource.
use super::record::{LifecyclePhase, ResourceKind};
use crate::store::Table;
use nimbus_common::cidr::CidrBlock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadBalancer;

#[derive(Serialize, Deserialize, ToSchema, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    pub listeners: Vec<ListenerSpec>,
    #[serde(default)]
    pub security: LoadBalancerSecurity,
}

#[derive(Serialize, Deserialize, ToSchema, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListenerSpec {
    pub port: u16,
    pub pool_port: u16,
    /// Instances whose labels contain all of these join the pool.
    #[serde(default)]
    pub instance_selectors: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, ToSchema, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSecurity {
    /// Allowed client addresses: `any`, an IPv4 address or a CIDR block.
    #[serde(default)]
    pub source_ips: Vec<String>,
}

#[derive(Serialize, Deserialize, ToSchema, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LoadBalancerPhase {
    #[default]
    Pending,
    Active,
    Deleting,
    Failed,
}

impl LifecyclePhase for LoadBalancerPhase {
    const DELETING: Self = LoadBalancerPhase::Deleting;
}

impl ResourceKind for LoadBalancer {
    type Spec = LoadBalancerSpec;
    type Phase = LoadBalancerPhase;

    const TABLE: Table = Table::LoadBalancer;
    const COLLECTION: &'static str = "loadbalancers";
    const KIND: &'static str = "load balancer";

    fn validate_spec(spec: &LoadBalancerSpec) -> Result<(), String> {
        if spec.listeners.is_empty() {
            return Err("missing spec.listeners".to_string());
        }
        let mut ports = BTreeSet::new();
        for listener in &spec.listeners {
            if listener.port == 0 || listener.pool_port == 0 {
                return Err("listener ports must be non-zero".to_string());
            }
            if !ports.insert(listener.port) {
                return Err(format!("duplicate listener port {}", listener.port));
            }
        }
        for source in &spec.security.source_ips {
            let valid = source == "any"
                || source.parse::<Ipv4Addr>().is_ok()
                || CidrBlock::parse(source).is_ok();
            if !valid {
                return Err(format!("invalid source ip {source}"));
            }
        }
        Ok(())
    }
}
