//! Control-plane data model module.
//!
//! # Purpose
//! Re-exports the generic record types and the six resource kinds that share
//! the record engine.
mod instance;
mod load_balancer;
mod port;
mod record;
mod subnet;
mod vnet;
mod vpc;

pub use instance::{Instance, InstancePhase, InstanceSpec};
pub use load_balancer::{
    ListenerSpec, LoadBalancer, LoadBalancerPhase, LoadBalancerSecurity, LoadBalancerSpec,
};
pub use port::{Port, PortPhase, PortSpec};
pub use record::{
    LifecyclePhase, Metadata, NewResource, Record, ResourceKind, ResourceStatus, SearchFilter,
};
pub use subnet::{Subnet, SubnetPhase, SubnetSpec};
pub use vnet::{Vnet, VnetPhase, VnetSpec};
pub use vpc::{Vpc, VpcPhase, VpcSpec};

pub use crate::store::RecordKey;
