//! Resource registry (C2): read-mostly name→resource map populated from
//! the catalog at server start (spec §4.2).

use dashmap::DashMap;

use crate::condition::{ConditionBag, Keyword};
use crate::driver::DriverKind;
use crate::error::{Error, Result};

/// Class a resource plays in a hierarchy (spec §3 "Resource").
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    Cache,
    Archive,
    Bundle,
    Primary,
}

/// A named backing store (spec §3 "Resource").
#[derive(Debug, Clone)]
pub struct ResourceInfo {
    pub name: String,
    pub zone: String,
    pub host: String,
    pub driver_kind: DriverKind,
    pub vault_path: String,
    pub class: ResourceClass,
    /// Name of the resource group this resource belongs to, if any.
    pub group: Option<String>,
    pub gateway_address: Option<String>,
    pub max_object_size: Option<u64>,
    pub free_space_bytes: Option<u64>,
}

impl ResourceInfo {
    pub fn vault_relative_path(&self, zone: &str, owner: &str, object_relative_path: &str) -> String {
        format!("{}/{}/home/{}/{}", self.vault_path.trim_end_matches('/'), zone, owner, object_relative_path)
    }
}

/// In-memory, read-mostly map from resource name to [`ResourceInfo`], plus
/// the resource-group index used for "any cache member"/"replicate across
/// the group" selection (spec §3 "Resource group").
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    resources: DashMap<String, ResourceInfo>,
    /// Group name -> ordered member resource names.
    groups: DashMap<String, Vec<String>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a resource, indexing it into its group if
    /// it declares one.
    pub fn register(&self, resource: ResourceInfo) {
        if let Some(group) = resource.group.clone() {
            let mut members = self.groups.entry(group).or_default();
            if !members.contains(&resource.name) {
                members.push(resource.name.clone());
            }
        }
        self.resources.insert(resource.name.clone(), resource);
    }

    pub fn resolve_by_name(&self, name: &str) -> Result<ResourceInfo> {
        self.resources
            .get(name)
            .map(|r| r.clone())
            .ok_or_else(|| Error::CatNoRowsFound)
    }

    /// Iterates a resource group's members in registration order. The
    /// cache member of a CACHE+ARCHIVE pair is returned first (spec §4.2:
    /// "the cache member is returned first for reads").
    pub fn iterate_group(&self, name: &str) -> Result<Vec<ResourceInfo>> {
        let members = self.groups.get(name).ok_or(Error::CatNoRowsFound)?;
        let mut infos: Vec<ResourceInfo> =
            members.iter().filter_map(|n| self.resources.get(n).map(|r| r.clone())).collect();
        infos.sort_by_key(|r| if r.class == ResourceClass::Cache { 0 } else { 1 });
        Ok(infos)
    }

    /// Picks the destination resource for a create/replicate operation,
    /// honoring DEST_RESC_NAME > BACKUP_RESC_NAME > user default > zone
    /// default (spec §4.2).
    pub fn pick_destination(&self, cond: &ConditionBag, default_resource: &str) -> Result<ResourceInfo> {
        if let Some(name) = cond.lookup(Keyword::DestRescName) {
            return self.resolve_by_name(name);
        }
        if let Some(name) = cond.lookup(Keyword::BackupRescName) {
            return self.resolve_by_name(name);
        }
        self.resolve_by_name(default_resource)
    }
}
