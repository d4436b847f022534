//! Server/resource bootstrap configuration, loaded from TOML at startup
//! (spec §3 ambient stack note: resource bootstrap is loadable the way the
//! teacher's root crate depends on `serde` + `toml`).

use serde::{Deserialize, Serialize};

use crate::driver::DriverKind;
use crate::error::{Error, Result};
use crate::resource::{ResourceClass, ResourceInfo, ResourceRegistry};
use crate::session::DEFAULT_TABLE_CAPACITY;

/// Top-level server configuration file shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub zone: String,
    pub host: String,
    #[serde(default = "default_table_capacity")]
    pub table_capacity: usize,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

fn default_table_capacity() -> usize {
    DEFAULT_TABLE_CAPACITY
}

/// One `[[resources]]` entry. `driver_kind` is the lowercase name of a
/// [`DriverKind`] variant (`unix`, `mounted_fs`, `tar_bundle`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub name: String,
    pub zone: String,
    pub host: String,
    pub driver_kind: String,
    pub vault_path: String,
    #[serde(default)]
    pub class: ResourceClassConfig,
    pub group: Option<String>,
    pub gateway_address: Option<String>,
    pub max_object_size: Option<u64>,
    pub free_space_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClassConfig {
    #[default]
    Primary,
    Cache,
    Archive,
    Bundle,
}

impl From<ResourceClassConfig> for ResourceClass {
    fn from(value: ResourceClassConfig) -> Self {
        match value {
            ResourceClassConfig::Primary => ResourceClass::Primary,
            ResourceClassConfig::Cache => ResourceClass::Cache,
            ResourceClassConfig::Archive => ResourceClass::Archive,
            ResourceClassConfig::Bundle => ResourceClass::Bundle,
        }
    }
}

fn parse_driver_kind(name: &str) -> Result<DriverKind> {
    match name {
        "unix" => Ok(DriverKind::Unix),
        "hpss" => Ok(DriverKind::Hpss),
        "s3" => Ok(DriverKind::S3),
        "haaw_bundle" => Ok(DriverKind::HaawBundle),
        "tar_bundle" => Ok(DriverKind::TarBundle),
        "mounted_fs" => Ok(DriverKind::MountedFs),
        "compound_cache" => Ok(DriverKind::CompoundCache),
        "compound_archive" => Ok(DriverKind::CompoundArchive),
        other => Err(Error::InvalidConfig(format!("unknown driver_kind {other:?}"))),
    }
}

impl ResourceConfig {
    fn into_resource_info(self) -> Result<ResourceInfo> {
        Ok(ResourceInfo {
            name: self.name,
            zone: self.zone,
            host: self.host,
            driver_kind: parse_driver_kind(&self.driver_kind)?,
            vault_path: self.vault_path,
            class: self.class.into(),
            group: self.group,
            gateway_address: self.gateway_address,
            max_object_size: self.max_object_size,
            free_space_bytes: self.free_space_bytes,
        })
    }
}

impl ServerConfig {
    /// Parses a TOML document into a [`ServerConfig`].
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    /// Builds the resource registry this configuration describes,
    /// rejecting an unknown `driver_kind` before any resource is
    /// registered.
    pub fn build_registry(&self) -> Result<ResourceRegistry> {
        let registry = ResourceRegistry::new();
        for resource in &self.resources {
            registry.register(resource.clone().into_resource_info()?);
        }
        Ok(registry)
    }
}
