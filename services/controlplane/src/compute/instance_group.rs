//! Instance groups: named sets of identical instances created and grown
//! together.
//!
//! # Purpose
//! A group is not stored on its own. Its members are the instances whose
//! `spec.instanceGroup` names it. Members are named `<group>-<index>` and are
//! created as one batch through the [`InstanceOrchestrator`], so quota,
//! naming, vnet and scheduling rules apply unchanged.
//!
//! # Key invariants
//! - A group holds between 1 and [`MAX_GROUP_SIZE`] instances.
//! - Creating or growing a group is all-or-nothing.
//! - The last active member cannot be removed on its own; it is the template
//!   new members are cloned from.
//! - Groups only grow. Scaling down is rejected.
use crate::compute::orchestrator::{CreateOptions, InstanceOrchestrator};
use crate::engine::VersionedStore;
use crate::model::{Instance, InstancePhase, InstanceSpec, NewResource, Record, RecordKey, SearchFilter};
use crate::store::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use utoipa::ToSchema;

pub const MAX_GROUP_SIZE: u32 = 128;
const MAX_NAME_LEN: usize = 59;

/// Create request for a group. `spec` is the template every member gets.
#[derive(Serialize, Deserialize, ToSchema, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewInstanceGroup {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub spec: InstanceSpec,
    pub instance_count: u32,
}

#[derive(Serialize, Deserialize, ToSchema, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroup {
    pub tenant_id: String,
    pub name: String,
    /// Spec shared by the members, without placement.
    pub instance_spec: InstanceSpec,
    pub instance_count: u32,
    pub ready_count: u32,
}

impl InstanceGroup {
    /// Summary of a group from its members; `None` when there are none.
    pub fn from_members(tenant_id: &str, group: &str, members: &[Record<Instance>]) -> Option<Self> {
        let mut instance_spec = members.last()?.spec.clone();
        instance_spec.clear_placement();
        Some(Self {
            tenant_id: tenant_id.to_string(),
            name: group.to_string(),
            instance_spec,
            instance_count: members.len() as u32,
            ready_count: members
                .iter()
                .filter(|record| record.status.phase == InstancePhase::Ready)
                .count() as u32,
        })
    }
}

#[derive(Serialize, Deserialize, ToSchema, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScaleStatus {
    pub current_count: u32,
    pub desired_count: u32,
    pub ready_count: u32,
    pub current_members: Vec<String>,
    pub new_members: Vec<String>,
    pub ready_members: Vec<String>,
}

#[derive(Clone)]
pub struct InstanceGroups {
    orchestrator: InstanceOrchestrator,
    instances: VersionedStore<Instance>,
}

impl InstanceGroups {
    pub fn new(orchestrator: InstanceOrchestrator, instances: VersionedStore<Instance>) -> Self {
        Self {
            orchestrator,
            instances,
        }
    }

    pub async fn create(
        &self,
        tenant_id: &str,
        request: NewInstanceGroup,
        options: CreateOptions,
    ) -> StoreResult<Vec<Record<Instance>>> {
        validate_group_name(&request.name)?;
        validate_count(request.instance_count)?;
        if !self.members(tenant_id, &request.name).await?.is_empty() {
            return Err(StoreError::AlreadyExists(format!(
                "instance group {} already exists",
                request.name
            )));
        }

        let drafts = (0..request.instance_count)
            .map(|index| {
                member_draft(
                    &request.name,
                    index,
                    &request.labels,
                    &request.spec,
                    request.instance_count,
                )
            })
            .collect();
        let created = self
            .orchestrator
            .create_batch(tenant_id, drafts, options)
            .await?;
        tracing::info!(
            tenant_id,
            group = %request.name,
            count = created.len(),
            dry_run = options.dry_run,
            "instance group created"
        );
        Ok(created)
    }

    /// Active instances of the group, ordered by name.
    pub async fn members(&self, tenant_id: &str, group: &str) -> StoreResult<Vec<Record<Instance>>> {
        let filter = SearchFilter::default()
            .with_spec_field("instanceGroup", Value::String(group.to_string()));
        self.instances.search(tenant_id, &filter).await
    }

    pub async fn get(&self, tenant_id: &str, group: &str) -> StoreResult<InstanceGroup> {
        validate_group_name(group)?;
        let members = self.members(tenant_id, group).await?;
        InstanceGroup::from_members(tenant_id, group, &members)
            .ok_or_else(|| StoreError::NotFound(format!("instance group {group}")))
    }

    pub async fn search(&self, tenant_id: &str) -> StoreResult<Vec<InstanceGroup>> {
        let mut groups: BTreeMap<String, Vec<Record<Instance>>> = BTreeMap::new();
        for record in self.instances.search(tenant_id, &SearchFilter::default()).await? {
            if let Some(group) = record.spec.instance_group.clone().filter(|g| !g.is_empty()) {
                groups.entry(group).or_default().push(record);
            }
        }
        Ok(groups
            .iter()
            .filter_map(|(group, members)| InstanceGroup::from_members(tenant_id, group, members))
            .collect())
    }

    /// Apply a spec update to every member. Only `sshPublicKeyNames` can
    /// change, as for a single instance.
    pub async fn update(
        &self,
        tenant_id: &str,
        group: &str,
        spec: InstanceSpec,
    ) -> StoreResult<Vec<Record<Instance>>> {
        let members = self.existing_members(tenant_id, group).await?;
        let mut updated = Vec::with_capacity(members.len());
        for member in members {
            let key = RecordKey::Id(member.metadata.resource_id);
            updated.push(
                self.instances
                    .update_fields(tenant_id, &key, None, None, Some(spec.clone()))
                    .await?,
            );
        }
        tracing::info!(tenant_id, group, count = updated.len(), "instance group updated");
        Ok(updated)
    }

    /// Request deletion of every member. Repeating it is harmless.
    pub async fn delete(&self, tenant_id: &str, group: &str) -> StoreResult<Vec<Record<Instance>>> {
        let members = self.existing_members(tenant_id, group).await?;
        let mut deleting = Vec::with_capacity(members.len());
        for member in members {
            let key = RecordKey::Id(member.metadata.resource_id);
            deleting.push(self.instances.mark_deletion_intent(tenant_id, &key, None).await?);
        }
        tracing::info!(tenant_id, group, count = deleting.len(), "instance group deletion requested");
        Ok(deleting)
    }

    pub async fn delete_member(
        &self,
        tenant_id: &str,
        group: &str,
        member: &RecordKey,
    ) -> StoreResult<Record<Instance>> {
        let members = self.existing_members(tenant_id, group).await?;
        let target = members
            .iter()
            .find(|record| is_addressed_by(record, member))
            .ok_or_else(|| {
                StoreError::NotFound(format!("instance {} in instance group {group}", describe(member)))
            })?;
        let active: Vec<&Record<Instance>> = members.iter().filter(|record| is_active(record)).collect();
        let target_active = is_active(target);
        if target_active && active.len() == 1 {
            return Err(StoreError::FailedPrecondition(format!(
                "{} is the last active instance of instance group {group}; delete the group instead",
                target.metadata.name
            )));
        }

        let target_id = target.metadata.resource_id;
        let deleting = self
            .instances
            .mark_deletion_intent(tenant_id, &RecordKey::Id(target_id), None)
            .await?;
        let remaining: Vec<&Record<Instance>> = active
            .into_iter()
            .filter(|record| record.metadata.resource_id != target_id)
            .collect();
        self.sync_size(tenant_id, &remaining, remaining.len() as u32).await;
        tracing::info!(tenant_id, group, member = %deleting.metadata.name, "instance group member deletion requested");
        Ok(deleting)
    }

    /// Grow the group to `desired` members, cloning the first active member.
    pub async fn scale_up(&self, tenant_id: &str, group: &str, desired: u32) -> StoreResult<ScaleStatus> {
        validate_count(desired)?;
        let members = self.existing_members(tenant_id, group).await?;
        let current = members.len() as u32;
        if current > desired {
            return Err(StoreError::InvalidArgument(format!(
                "scaling down is unsupported: current {current}, desired {desired}"
            )));
        }
        let active: Vec<&Record<Instance>> = members.iter().filter(|record| is_active(record)).collect();
        let template = active
            .first()
            .ok_or_else(|| StoreError::NotFound(format!("instance group {group} is being deleted")))?;

        let ready_members: Vec<String> = members
            .iter()
            .filter(|record| record.status.phase == InstancePhase::Ready)
            .map(|record| record.metadata.name.clone())
            .collect();
        let mut current_members: Vec<String> =
            active.iter().map(|record| record.metadata.name.clone()).collect();
        let taken: HashSet<&str> = members.iter().map(|record| record.metadata.name.as_str()).collect();

        let drafts: Vec<NewResource<Instance>> = (0..desired)
            .filter(|index| !taken.contains(member_name(group, *index).as_str()))
            .map(|index| {
                member_draft(
                    group,
                    index,
                    &template.metadata.labels,
                    &template.spec,
                    desired,
                )
            })
            .collect();

        let mut new_members = Vec::new();
        if !drafts.is_empty() {
            let created = self
                .orchestrator
                .create_batch(tenant_id, drafts, CreateOptions::tenant(false))
                .await?;
            new_members = created.iter().map(|record| record.metadata.name.clone()).collect();
        }
        self.sync_size(tenant_id, &active, desired).await;

        current_members.extend(new_members.iter().cloned());
        current_members.sort();
        tracing::info!(tenant_id, group, desired, added = new_members.len(), "instance group scaled up");
        Ok(ScaleStatus {
            current_count: current_members.len() as u32,
            desired_count: desired,
            ready_count: ready_members.len() as u32,
            current_members,
            new_members,
            ready_members,
        })
    }

    async fn existing_members(&self, tenant_id: &str, group: &str) -> StoreResult<Vec<Record<Instance>>> {
        validate_group_name(group)?;
        let members = self.members(tenant_id, group).await?;
        if members.is_empty() {
            return Err(StoreError::NotFound(format!("instance group {group}")));
        }
        Ok(members)
    }

    /// Record the group size on each member. Failures are logged; the size
    /// is informational and the next group operation rewrites it.
    async fn sync_size(&self, tenant_id: &str, members: &[&Record<Instance>], size: u32) {
        for member in members {
            if member.spec.instance_group_size == Some(size) {
                continue;
            }
            let key = RecordKey::Id(member.metadata.resource_id);
            let result = self
                .instances
                .update(tenant_id, &key, None, |mut record| {
                    record.spec.instance_group_size = Some(size);
                    Ok(record)
                })
                .await;
            if let Err(err) = result {
                tracing::warn!(
                    tenant_id,
                    member = %member.metadata.name,
                    error = %err,
                    "failed to record instance group size"
                );
            }
        }
    }
}

/// Lowercase letters, digits and `-`, not starting or ending with `-`, at
/// most 59 characters.
pub fn validate_group_name(name: &str) -> StoreResult<()> {
    let invalid =
        |reason: String| Err(StoreError::InvalidArgument(format!("invalid instance group name {name:?}: {reason}")));
    if name.is_empty() {
        return invalid("name is empty".to_string());
    }
    if name.len() > MAX_NAME_LEN {
        return invalid(format!("name may contain at most {MAX_NAME_LEN} characters"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return invalid(format!("invalid character {c:?}"));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return invalid("name cannot begin or end with \"-\"".to_string());
    }
    Ok(())
}

fn validate_count(count: u32) -> StoreResult<()> {
    if (1..=MAX_GROUP_SIZE).contains(&count) {
        Ok(())
    } else {
        Err(StoreError::InvalidArgument(format!(
            "instance count must be between 1 and {MAX_GROUP_SIZE}"
        )))
    }
}

fn member_name(group: &str, index: u32) -> String {
    format!("{group}-{index}")
}

fn member_draft(
    group: &str,
    index: u32,
    labels: &BTreeMap<String, String>,
    template: &InstanceSpec,
    size: u32,
) -> NewResource<Instance> {
    let mut spec = template.clone();
    spec.clear_placement();
    spec.instance_group = Some(group.to_string());
    spec.instance_group_size = Some(size);
    let mut draft = NewResource::named(member_name(group, index), spec);
    draft.labels = labels.clone();
    draft
}

fn is_active(record: &Record<Instance>) -> bool {
    record.metadata.deletion_timestamp.is_none()
}

fn is_addressed_by(record: &Record<Instance>, key: &RecordKey) -> bool {
    match key {
        RecordKey::Id(id) => record.metadata.resource_id == *id,
        RecordKey::Name(name) => record.metadata.name == *name,
    }
}

fn describe(key: &RecordKey) -> String {
    match key {
        RecordKey::Id(id) => id.to_string(),
        RecordKey::Name(name) => name.clone(),
    }
}
