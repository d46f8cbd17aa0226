//! Subnet creation with address-range exclusivity inside a VPC.
//!
//! # Purpose
//! Subnets are the one kind that cannot go through the plain record insert:
//! two concurrent creates in the same VPC could each see no overlap and both
//! commit. The allocator validates the block, then checks containment and
//! sibling overlap while the parent VPC row is locked, and inserts in the
//! same transaction.
//!
//! # Key invariants
//! - Allocations in one VPC are serialized; different VPCs do not contend.
//! - Overlap is checked only against active subnets of the same VPC and tenant.
use crate::engine::versioned::VersionedStore;
use crate::model::{NewResource, Record, RecordKey, ResourceKind, Subnet, Vpc};
use crate::observability;
use crate::store::{ParentLock, StoreError, StoreResult, StoredRow};
use nimbus_common::cidr::CidrBlock;
use serde_json::json;

const INVALID_VPC: &str = "invalid vpcId";
const NOT_WITHIN_VPC: &str = "subnet CIDR is not within VPC CIDR.";
const OVERLAPS_SIBLING: &str = "subnet CIDR overlaps with existing subnet CIDR within the VPC.";

#[derive(Clone)]
pub struct SubnetAllocator {
    subnets: VersionedStore<Subnet>,
    vpcs: VersionedStore<Vpc>,
}

impl SubnetAllocator {
    pub fn new(subnets: VersionedStore<Subnet>, vpcs: VersionedStore<Vpc>) -> Self {
        Self { subnets, vpcs }
    }

    pub async fn create(&self, tenant_id: &str, draft: NewResource<Subnet>) -> StoreResult<Record<Subnet>> {
        let block = parse_block(&draft.spec.cidr_block)?;
        block
            .ensure_allocatable()
            .map_err(|err| StoreError::InvalidArgument(err.to_string()))?;

        let vpc_id = draft.spec.vpc_id;
        let vpc = match self.vpcs.get(tenant_id, &RecordKey::Id(vpc_id)).await {
            Ok(vpc) => vpc,
            Err(StoreError::NotFound(_)) | Err(StoreError::InvalidArgument(_)) => {
                return Err(StoreError::InvalidArgument(INVALID_VPC.to_string()));
            }
            Err(err) => return Err(err),
        };
        // Early rejection; repeated under the lock below.
        ensure_within(&parse_block(&vpc.spec.cidr_block)?, &block)?;

        let record = self.subnets.prepare(tenant_id, draft)?;
        let row = VersionedStore::<Subnet>::to_new_row(&record)?;
        let lock = ParentLock {
            table: Vpc::TABLE,
            tenant_id: tenant_id.to_string(),
            resource_id: vpc_id,
        };
        let siblings = json!({"spec": {"vpcId": vpc_id.to_string()}});
        let check = |parent: &StoredRow, existing: &[StoredRow]| check_allocation(&block, parent, existing);

        let stored = self
            .subnets
            .backend()
            .insert_locked(&lock, Subnet::TABLE, row, &siblings, &check)
            .await
            .map_err(|err| match err {
                // The VPC was finalized between the read and the lock.
                StoreError::NotFound(_) => StoreError::InvalidArgument(INVALID_VPC.to_string()),
                other => other,
            })?;
        metrics::counter!(observability::RECORD_WRITES, "table" => Subnet::TABLE.as_str(), "op" => "create")
            .increment(1);
        tracing::debug!(
            tenant_id,
            vpc_id = %vpc_id,
            cidr_block = %block,
            "subnet allocated"
        );
        VersionedStore::<Subnet>::decode(stored)
    }
}

fn parse_block(input: &str) -> StoreResult<CidrBlock> {
    CidrBlock::parse(input).map_err(|err| StoreError::InvalidArgument(err.to_string()))
}

fn ensure_within(vpc: &CidrBlock, subnet: &CidrBlock) -> StoreResult<()> {
    if vpc.can_allocate(subnet) {
        Ok(())
    } else {
        Err(StoreError::InvalidArgument(NOT_WITHIN_VPC.to_string()))
    }
}

/// Runs with the VPC row locked.
fn check_allocation(block: &CidrBlock, parent: &StoredRow, siblings: &[StoredRow]) -> StoreResult<()> {
    let vpc = VersionedStore::<Vpc>::decode(parent.clone())?;
    ensure_within(&parse_block(&vpc.spec.cidr_block)?, block)?;
    for sibling in siblings {
        let existing = VersionedStore::<Subnet>::decode(sibling.clone())?;
        // Stored blocks were validated on insert; an unparsable one is corrupt.
        let existing_block = CidrBlock::parse(&existing.spec.cidr_block).map_err(|err| {
            StoreError::Unexpected(anyhow::anyhow!(
                "stored subnet {} has invalid cidr block: {err}",
                existing.metadata.resource_id
            ))
        })?;
        if existing_block.overlaps(block) {
            return Err(StoreError::InvalidArgument(OVERLAPS_SIBLING.to_string()));
        }
    }
    Ok(())
}
