//! Port reservation inside a tenant subnet.
//!
//! # Purpose
//! Ports reference a subnet and may pin an address. The reserver resolves the
//! subnet for the tenant, checks the address against its block, and inserts
//! with the subnet row locked so two ports never claim the same address or
//! MAC.
//!
//! # Key invariants
//! - `subnetId` must name an active subnet of the same tenant.
//! - A pinned `ipAddress` is a host address of the subnet block and unique
//!   among the subnet's active ports.
//! - Reserving again with a MAC that already has a port returns that port
//!   unchanged, so callers can retry a reservation safely.
use crate::engine::versioned::VersionedStore;
use crate::model::{NewResource, Port, Record, RecordKey, ResourceKind, SearchFilter, Subnet};
use crate::observability;
use crate::store::{ParentLock, StoreError, StoreResult, StoredRow};
use nimbus_common::cidr::CidrBlock;
use serde_json::{Value, json};
use std::net::Ipv4Addr;

const INVALID_SUBNET: &str = "invalid subnet";

#[derive(Clone)]
pub struct PortReserver {
    ports: VersionedStore<Port>,
    subnets: VersionedStore<Subnet>,
}

/// Outcome of a reservation.
#[derive(Debug)]
pub struct Reservation {
    pub port: Record<Port>,
    /// False when an existing port with the same MAC was returned.
    pub created: bool,
}

impl PortReserver {
    pub fn new(ports: VersionedStore<Port>, subnets: VersionedStore<Subnet>) -> Self {
        Self { ports, subnets }
    }

    pub async fn reserve(&self, tenant_id: &str, draft: NewResource<Port>) -> StoreResult<Reservation> {
        let record = self.ports.prepare(tenant_id, draft)?;
        let subnet_id = record.spec.subnet_id;
        let subnet = match self.subnets.get(tenant_id, &RecordKey::Id(subnet_id)).await {
            Ok(subnet) => subnet,
            Err(StoreError::NotFound(_)) | Err(StoreError::InvalidArgument(_)) => {
                return Err(StoreError::InvalidArgument(INVALID_SUBNET.to_string()));
            }
            Err(err) => return Err(err),
        };
        let address = record
            .spec
            .ip_address
            .as_deref()
            .map(parse_address)
            .transpose()?;
        if let Some(address) = address {
            ensure_host(&subnet_block(&subnet)?, address)?;
        }

        let row = VersionedStore::<Port>::to_new_row(&record)?;
        let lock = ParentLock {
            table: Subnet::TABLE,
            tenant_id: tenant_id.to_string(),
            resource_id: subnet_id,
        };
        let siblings = json!({"spec": {"subnetId": subnet_id.to_string()}});
        let mac = record.spec.mac_address.clone();
        let check = |_: &StoredRow, existing: &[StoredRow]| check_siblings(address, mac.as_deref(), existing);

        let inserted = self
            .ports
            .backend()
            .insert_locked(&lock, Port::TABLE, row, &siblings, &check)
            .await;
        match inserted {
            Ok(stored) => {
                metrics::counter!(observability::RECORD_WRITES, "table" => Port::TABLE.as_str(), "op" => "create")
                    .increment(1);
                let port = VersionedStore::<Port>::decode(stored)?;
                tracing::debug!(
                    tenant_id,
                    subnet_id = %subnet_id,
                    port = %port.metadata.name,
                    "port reserved"
                );
                Ok(Reservation { port, created: true })
            }
            // The subnet was finalized between the read and the lock.
            Err(StoreError::NotFound(_)) => Err(StoreError::InvalidArgument(INVALID_SUBNET.to_string())),
            Err(StoreError::AlreadyExists(message)) => {
                match self.existing(tenant_id, &record.spec.subnet_id.to_string(), mac.as_deref()).await? {
                    Some(port) => {
                        tracing::debug!(
                            tenant_id,
                            port = %port.metadata.name,
                            "port already reserved; returning it"
                        );
                        Ok(Reservation { port, created: false })
                    }
                    None => Err(StoreError::AlreadyExists(message)),
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn existing(
        &self,
        tenant_id: &str,
        subnet_id: &str,
        mac: Option<&str>,
    ) -> StoreResult<Option<Record<Port>>> {
        let Some(mac) = mac else {
            return Ok(None);
        };
        let filter = SearchFilter::default()
            .with_spec_field("subnetId", Value::String(subnet_id.to_string()))
            .with_spec_field("macAddress", Value::String(mac.to_string()));
        Ok(self.ports.search(tenant_id, &filter).await?.into_iter().next())
    }
}

fn parse_address(raw: &str) -> StoreResult<Ipv4Addr> {
    raw.parse()
        .map_err(|_| StoreError::InvalidArgument(format!("invalid spec.ipAddress {raw}")))
}

fn subnet_block(subnet: &Record<Subnet>) -> StoreResult<CidrBlock> {
    CidrBlock::parse(&subnet.spec.cidr_block).map_err(|err| {
        StoreError::Unexpected(anyhow::anyhow!(
            "stored subnet {} has invalid cidr block: {err}",
            subnet.metadata.resource_id
        ))
    })
}

fn ensure_host(block: &CidrBlock, address: Ipv4Addr) -> StoreResult<()> {
    if block.contains_host(address) {
        Ok(())
    } else {
        Err(StoreError::InvalidArgument(format!(
            "ipAddress {address} is not a host address of subnet {block}"
        )))
    }
}

/// Runs with the subnet row locked.
fn check_siblings(address: Option<Ipv4Addr>, mac: Option<&str>, siblings: &[StoredRow]) -> StoreResult<()> {
    for sibling in siblings {
        let existing = VersionedStore::<Port>::decode(sibling.clone())?;
        if let Some(mac) = mac {
            if existing.spec.mac_address.as_deref() == Some(mac) {
                return Err(StoreError::AlreadyExists(format!(
                    "macAddress {mac} already has port {}",
                    existing.metadata.name
                )));
            }
        }
        if let Some(address) = address {
            let taken = existing.spec.ip_address.as_deref().and_then(|ip| ip.parse::<Ipv4Addr>().ok());
            if taken == Some(address) {
                return Err(StoreError::InvalidArgument(format!(
                    "ipAddress {address} is already in use by port {}",
                    existing.metadata.name
                )));
            }
        }
    }
    Ok(())
}
