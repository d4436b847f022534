//! Replication engine (C9): full source→destination replica transfer plan,
//! including compound/bundle cache staging and ALL-mode fan-out (spec
//! §4.8). Grounded in
//! `original_source/iRODS/lib/api/include/dataObjRepl.h`.
//!
//! Source and destination opens go through the L3 driver layer directly
//! rather than the L1 state machine (`crate::io`): replication creates a
//! brand-new replica row for an object that may already be open elsewhere,
//! which the L1 open flow (pick an *existing* replica) doesn't model. This
//! mirrors spec §4.8 step 5's own "driver-to-driver" framing for the
//! transfer itself.

use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use crate::catalog::{ReplicaMeta, ReplicaStatus, ReplicaUpdate, ResolvedObject};
use crate::driver::{dispatch, hash_handle, BundleDriver, BundleStageDriver, CompoundDriver, CompoundStageDriver, OpenFlags};
use crate::error::{Error, Result};
use crate::resource::{ResourceClass, ResourceInfo};
use crate::session::SessionContext;

fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

fn next_replica_number(resolved: &ResolvedObject) -> i32 {
    resolved.replicas.iter().map(|r| r.replica_number).max().map(|n| n + 1).unwrap_or(0)
}

/// Identifies the source of a replication (spec §4.8 "source specification").
#[derive(Debug, Clone, Default)]
pub struct SourceSpec {
    pub logical_path: String,
    pub repl_num: Option<i32>,
}

/// Identifies the destination (spec §4.8 "destination specification":
/// "resource or group, optional backup").
#[derive(Debug, Clone, Default)]
pub struct DestSpec {
    pub resource_name: Option<String>,
    pub group_name: Option<String>,
    pub backup_resource_name: Option<String>,
}

pub struct ReplicateRequest {
    pub source: SourceSpec,
    pub dest: DestSpec,
    pub all_mode: bool,
    pub owner: String,
}

/// Result of a replication call. `ALL` mode reports an aggregate: the
/// number of source replicas successfully replicated, the number
/// attempted, and the first failure encountered (spec §4.8 step 7: "ALL
/// mode: ... returning aggregate success ... or partial status (number
/// replicated, first failure)").
#[derive(Debug, Default)]
pub struct ReplicateOutcome {
    pub replicated: i32,
    pub attempted: i32,
    pub first_failure: Option<Error>,
}

/// Per-object-id advisory lock plus the replication plan (spec §4.8
/// "Concurrency": "concurrent replications of the same object with
/// overlapping destinations are serialized via a per-object-id advisory
/// lock ... the loser receives LOCK_CONTENTION").
#[derive(Default)]
pub struct ReplicationEngine {
    locks: DashMap<i64, ()>,
}

impl ReplicationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self, object_id: i64) -> Result<()> {
        if self.locks.insert(object_id, ()).is_some() {
            return Err(Error::LockContention(object_id));
        }
        Ok(())
    }

    fn release(&self, object_id: i64) {
        self.locks.remove(&object_id);
    }

    #[tracing::instrument(skip(self, session, req), fields(path = %req.source.logical_path, all_mode = req.all_mode), err)]
    pub async fn replicate(&self, session: &SessionContext, req: ReplicateRequest) -> Result<ReplicateOutcome> {
        let resolved = session.catalog.resolve(&req.source.logical_path).await?;
        self.acquire(resolved.meta.object_id)?;
        let result = self.replicate_locked(session, &req).await;
        self.release(resolved.meta.object_id);
        result
    }

    async fn replicate_locked(&self, session: &SessionContext, req: &ReplicateRequest) -> Result<ReplicateOutcome> {
        if req.all_mode {
            let resolved = session.catalog.resolve(&req.source.logical_path).await?;
            let good_numbers: Vec<i32> = resolved.replicas.iter().filter(|r| r.status == ReplicaStatus::Good).map(|r| r.replica_number).collect();

            let mut outcome = ReplicateOutcome::default();
            for number in good_numbers {
                outcome.attempted += 1;
                // re-resolve every iteration: a prior iteration's staging
                // or transfer may have registered new replicas.
                let fresh = session.catalog.resolve(&req.source.logical_path).await?;
                match self.replicate_one(session, req, &fresh, Some(number)).await {
                    Ok(()) => outcome.replicated += 1,
                    Err(e) => {
                        if outcome.first_failure.is_none() {
                            outcome.first_failure = Some(e);
                        }
                    }
                }
            }
            Ok(outcome)
        } else {
            let resolved = session.catalog.resolve(&req.source.logical_path).await?;
            self.replicate_one(session, req, &resolved, req.source.repl_num).await?;
            Ok(ReplicateOutcome { replicated: 1, attempted: 1, first_failure: None })
        }
    }

    async fn replicate_one(&self, session: &SessionContext, req: &ReplicateRequest, resolved: &ResolvedObject, repl_num: Option<i32>) -> Result<()> {
        let source_replica = self.resolve_source_replica(session, resolved, repl_num).await?;
        let source_resc = session.resources.resolve_by_name(&source_replica.resource_name)?;
        let dest_resc = self.resolve_destination(session, req, resolved)?;

        if source_resc.name == dest_resc.name || resolved.replicas.iter().any(|r| r.resource_name == dest_resc.name) {
            return Err(Error::HierarchyError(format!("resource {} already holds a replica of this object", dest_resc.name)));
        }

        let dest_phy = dest_resc.vault_relative_path(&session.identity.zone, &req.owner, &resolved.meta.logical_path);
        let dest_number = next_replica_number(resolved);
        let dest_row = ReplicaMeta {
            object_id: resolved.meta.object_id,
            replica_number: dest_number,
            resource_name: dest_resc.name.clone(),
            resource_group: dest_resc.group.clone(),
            physical_path: dest_phy.clone(),
            size: 0,
            checksum: None,
            status: ReplicaStatus::Stale,
            write_locked: true,
            expiry: None,
        };
        session.catalog.register_replica(resolved.meta.object_id, dest_row).await?;

        match transfer(&source_replica, &source_resc, &dest_resc, &dest_phy).await {
            Ok((size, checksum)) => {
                session
                    .catalog
                    .update_replica(
                        resolved.meta.object_id,
                        dest_number,
                        ReplicaUpdate { size: Some(size), checksum: Some(checksum), status: Some(ReplicaStatus::Good), modify_time: Some(unix_now()) },
                    )
                    .await?;
                Ok(())
            }
            Err(e) => {
                let _ = session.catalog.unregister_replica(resolved.meta.object_id, dest_number).await;
                Err(e)
            }
        }
    }

    /// Picks the source replica per spec §4.8 step 1, staging from a
    /// compound archive or bundle when necessary (steps 2-3).
    async fn resolve_source_replica(&self, session: &SessionContext, resolved: &ResolvedObject, repl_num: Option<i32>) -> Result<ReplicaMeta> {
        if let Some(n) = repl_num {
            return resolved.replicas.iter().find(|r| r.replica_number == n).cloned().ok_or(Error::CatNoRowsFound);
        }

        let mut staging_candidate = None;
        for replica in &resolved.replicas {
            if replica.status != ReplicaStatus::Good {
                continue;
            }
            let resc = session.resources.resolve_by_name(&replica.resource_name)?;
            if resc.class != ResourceClass::Archive && !resc.driver_kind.is_bundle() {
                return Ok(replica.clone());
            }
            if staging_candidate.is_none() {
                staging_candidate = Some((replica.clone(), resc));
            }
        }

        let (replica, resc) = staging_candidate.ok_or(Error::CatNoRowsFound)?;
        if resc.driver_kind.is_bundle() {
            self.stage_bundle_to_cache(session, resolved, &replica, &resc).await
        } else {
            self.stage_archive_to_cache(session, resolved, &replica, &resc).await
        }
    }

    async fn stage_archive_to_cache(
        &self,
        session: &SessionContext,
        resolved: &ResolvedObject,
        archive_replica: &ReplicaMeta,
        archive_resc: &ResourceInfo,
    ) -> Result<ReplicaMeta> {
        let group_name = archive_resc.group.clone().ok_or_else(|| Error::HierarchyError("archive resource has no compound group".into()))?;
        let members = session.resources.iterate_group(&group_name)?;
        let cache_resc =
            members.into_iter().find(|r| r.class == ResourceClass::Cache).ok_or_else(|| Error::HierarchyError("compound group has no cache member".into()))?;

        if let Some(existing) = resolved.replicas.iter().find(|r| r.resource_name == cache_resc.name && r.status == ReplicaStatus::Good) {
            return Ok(existing.clone());
        }

        let cache_phy = cache_resc.vault_relative_path(&session.identity.zone, &resolved.meta.owner, &resolved.meta.logical_path);
        let cache_number = next_replica_number(resolved);
        let cache_row = ReplicaMeta {
            object_id: resolved.meta.object_id,
            replica_number: cache_number,
            resource_name: cache_resc.name.clone(),
            resource_group: cache_resc.group.clone(),
            physical_path: cache_phy.clone(),
            size: 0,
            checksum: None,
            status: ReplicaStatus::Stale,
            write_locked: true,
            expiry: None,
        };
        session.catalog.register_replica(resolved.meta.object_id, cache_row).await?;

        let compound = CompoundDriver::default();
        match compound.stage(&archive_replica.physical_path, &cache_phy).await {
            Ok(()) => {
                let stat = compound.stat(&cache_phy).await?;
                session
                    .catalog
                    .update_replica(
                        resolved.meta.object_id,
                        cache_number,
                        ReplicaUpdate { size: Some(stat.size), status: Some(ReplicaStatus::Good), modify_time: Some(unix_now()), ..Default::default() },
                    )
                    .await?;
                Ok(ReplicaMeta {
                    object_id: resolved.meta.object_id,
                    replica_number: cache_number,
                    resource_name: cache_resc.name.clone(),
                    resource_group: cache_resc.group.clone(),
                    physical_path: cache_phy,
                    size: stat.size,
                    checksum: archive_replica.checksum.clone(),
                    status: ReplicaStatus::Good,
                    write_locked: false,
                    expiry: None,
                })
            }
            Err(e) => {
                let _ = session.catalog.unregister_replica(resolved.meta.object_id, cache_number).await;
                Err(e)
            }
        }
    }

    async fn stage_bundle_to_cache(
        &self,
        session: &SessionContext,
        resolved: &ResolvedObject,
        bundle_replica: &ReplicaMeta,
        bundle_resc: &ResourceInfo,
    ) -> Result<ReplicaMeta> {
        let group_name = bundle_resc.group.clone().ok_or_else(|| Error::HierarchyError("bundle resource has no cache group".into()))?;
        let members = session.resources.iterate_group(&group_name)?;
        let cache_resc =
            members.into_iter().find(|r| r.class == ResourceClass::Cache).ok_or_else(|| Error::HierarchyError("bundle group has no cache member".into()))?;

        let cache_phy = cache_resc.vault_relative_path(&session.identity.zone, &resolved.meta.owner, &resolved.meta.logical_path);
        let cache_number = next_replica_number(resolved);
        let cache_row = ReplicaMeta {
            object_id: resolved.meta.object_id,
            replica_number: cache_number,
            resource_name: cache_resc.name.clone(),
            resource_group: cache_resc.group.clone(),
            physical_path: cache_phy.clone(),
            size: 0,
            checksum: None,
            status: ReplicaStatus::Stale,
            write_locked: true,
            expiry: None,
        };
        session.catalog.register_replica(resolved.meta.object_id, cache_row).await?;

        let bundle = BundleDriver;
        match bundle.stage_to_cache(&bundle_replica.physical_path, &cache_phy).await {
            Ok(()) => {
                let stat = bundle.stat(&bundle_replica.physical_path).await?;
                session
                    .catalog
                    .update_replica(
                        resolved.meta.object_id,
                        cache_number,
                        ReplicaUpdate { size: Some(stat.size), status: Some(ReplicaStatus::Good), modify_time: Some(unix_now()), ..Default::default() },
                    )
                    .await?;
                Ok(ReplicaMeta {
                    object_id: resolved.meta.object_id,
                    replica_number: cache_number,
                    resource_name: cache_resc.name.clone(),
                    resource_group: cache_resc.group.clone(),
                    physical_path: cache_phy,
                    size: stat.size,
                    checksum: None,
                    status: ReplicaStatus::Good,
                    write_locked: false,
                    expiry: None,
                })
            }
            Err(e) => {
                let _ = session.catalog.unregister_replica(resolved.meta.object_id, cache_number).await;
                Err(e)
            }
        }
    }

    fn resolve_destination(&self, session: &SessionContext, req: &ReplicateRequest, resolved: &ResolvedObject) -> Result<ResourceInfo> {
        if let Some(name) = &req.dest.resource_name {
            return session.resources.resolve_by_name(name);
        }
        if let Some(group) = &req.dest.group_name {
            let members = session.resources.iterate_group(group)?;
            return members
                .into_iter()
                .find(|m| !resolved.replicas.iter().any(|r| r.resource_name == m.name))
                .ok_or_else(|| Error::HierarchyError(format!("no free member in group {group} for replication destination")));
        }
        if let Some(name) = &req.dest.backup_resource_name {
            return session.resources.resolve_by_name(name);
        }
        Err(Error::NullInput)
    }
}

/// Copies `source_replica`'s bytes to `dest_phy` on `dest_resc`, preserving
/// the source checksum if present, else computing one on write (spec §4.8
/// step 5).
async fn transfer(source_replica: &ReplicaMeta, source_resc: &ResourceInfo, dest_resc: &ResourceInfo, dest_phy: &str) -> Result<(u64, String)> {
    let src_driver = dispatch(source_resc.driver_kind)?;
    let dst_driver = dispatch(dest_resc.driver_kind)?;

    let mut src_handle = src_driver.open(&source_replica.physical_path, OpenFlags::read_only(), 0).await?;
    let mut dst_handle = dst_driver.open(dest_phy, OpenFlags::write_create(), 0o644).await?;

    const CHUNK: usize = 64 * 1024;
    let mut buf = vec![0u8; CHUNK];
    let mut total = 0u64;
    loop {
        let n = src_driver.read(&mut src_handle, &mut buf).await?;
        if n == 0 {
            break;
        }
        dst_driver.write(&mut dst_handle, &buf[..n]).await?;
        total += n as u64;
    }

    let checksum = match &source_replica.checksum {
        Some(existing) => existing.clone(),
        None => hash_handle(dst_driver.as_ref(), &mut dst_handle).await?,
    };

    src_driver.close(&mut src_handle).await?;
    dst_driver.close(&mut dst_handle).await?;
    Ok((total, checksum))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DataObjectMeta, InMemoryCatalog};
    use crate::driver::DriverKind;
    use crate::forwarder::{Connection, Forwarder, RemoteDispatch};
    use crate::resource::ResourceRegistry;
    use crate::session::LocalIdentity;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NoDispatch;
    #[async_trait]
    impl RemoteDispatch for NoDispatch {
        async fn connect(&self, _zone: &str, _host: &str) -> Result<Connection> {
            Err(Error::RemoteConnFail("no remote in tests".into()))
        }
    }

    fn new_session(vault: &std::path::Path) -> SessionContext {
        let resources = Arc::new(ResourceRegistry::new());
        resources.register(ResourceInfo {
            name: "resc1".to_string(),
            zone: "tempZone".to_string(),
            host: "localhost".to_string(),
            driver_kind: DriverKind::Unix,
            vault_path: vault.join("resc1").to_string_lossy().into_owned(),
            class: ResourceClass::Primary,
            group: None,
            gateway_address: None,
            max_object_size: None,
            free_space_bytes: None,
        });
        resources.register(ResourceInfo {
            name: "resc2".to_string(),
            zone: "tempZone".to_string(),
            host: "localhost".to_string(),
            driver_kind: DriverKind::Unix,
            vault_path: vault.join("resc2").to_string_lossy().into_owned(),
            class: ResourceClass::Primary,
            group: None,
            gateway_address: None,
            max_object_size: None,
            free_space_bytes: None,
        });
        SessionContext::new(
            LocalIdentity { zone: "tempZone".to_string(), host: "localhost".to_string() },
            resources,
            InMemoryCatalog::new(),
            Arc::new(Forwarder::new("tempZone", "localhost", Arc::new(NoDispatch))),
            Arc::new(ReplicationEngine::new()),
        )
    }

    #[tokio::test]
    async fn replicate_copies_bytes_to_new_resource() {
        let dir = tempfile::tempdir().unwrap();
        let session = new_session(dir.path());

        let object_id = session
            .catalog
            .create_object(DataObjectMeta {
                object_id: 0,
                logical_path: "/tempZone/home/alice/a.txt".to_string(),
                owner: "alice".to_string(),
                create_time: 0,
                modify_time: 0,
                logical_size: 5,
                checksum: None,
                data_type: "generic".to_string(),
                collection_id: 1,
            })
            .await
            .unwrap();

        let resc1 = session.resources.resolve_by_name("resc1").unwrap();
        let phy0 = resc1.vault_relative_path("tempZone", "alice", "/tempZone/home/alice/a.txt");
        tokio::fs::create_dir_all(std::path::Path::new(&phy0).parent().unwrap()).await.unwrap();
        tokio::fs::write(&phy0, b"hello").await.unwrap();
        session
            .catalog
            .register_replica(
                object_id,
                ReplicaMeta {
                    object_id,
                    replica_number: 0,
                    resource_name: "resc1".to_string(),
                    resource_group: None,
                    physical_path: phy0,
                    size: 5,
                    checksum: None,
                    status: ReplicaStatus::Good,
                    write_locked: false,
                    expiry: None,
                },
            )
            .await
            .unwrap();

        let outcome = session
            .replication
            .clone()
            .replicate(
                &session,
                ReplicateRequest {
                    source: SourceSpec { logical_path: "/tempZone/home/alice/a.txt".to_string(), repl_num: None },
                    dest: DestSpec { resource_name: Some("resc2".to_string()), group_name: None, backup_resource_name: None },
                    all_mode: false,
                    owner: "alice".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.replicated, 1);

        let resolved = session.catalog.resolve("/tempZone/home/alice/a.txt").await.unwrap();
        let new_replica = resolved.replicas.iter().find(|r| r.resource_name == "resc2").unwrap();
        assert_eq!(new_replica.status, ReplicaStatus::Good);
        assert_eq!(new_replica.size, 5);
        assert_eq!(tokio::fs::read(&new_replica.physical_path).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn replicate_to_existing_resource_is_hierarchy_error() {
        let dir = tempfile::tempdir().unwrap();
        let session = new_session(dir.path());

        let object_id = session
            .catalog
            .create_object(DataObjectMeta {
                object_id: 0,
                logical_path: "/tempZone/home/alice/a.txt".to_string(),
                owner: "alice".to_string(),
                create_time: 0,
                modify_time: 0,
                logical_size: 5,
                checksum: None,
                data_type: "generic".to_string(),
                collection_id: 1,
            })
            .await
            .unwrap();
        let resc1 = session.resources.resolve_by_name("resc1").unwrap();
        let phy0 = resc1.vault_relative_path("tempZone", "alice", "/tempZone/home/alice/a.txt");
        tokio::fs::create_dir_all(std::path::Path::new(&phy0).parent().unwrap()).await.unwrap();
        tokio::fs::write(&phy0, b"hello").await.unwrap();
        session
            .catalog
            .register_replica(
                object_id,
                ReplicaMeta {
                    object_id,
                    replica_number: 0,
                    resource_name: "resc1".to_string(),
                    resource_group: None,
                    physical_path: phy0,
                    size: 5,
                    checksum: None,
                    status: ReplicaStatus::Good,
                    write_locked: false,
                    expiry: None,
                },
            )
            .await
            .unwrap();

        let err = session
            .replication
            .clone()
            .replicate(
                &session,
                ReplicateRequest {
                    source: SourceSpec { logical_path: "/tempZone/home/alice/a.txt".to_string(), repl_num: None },
                    dest: DestSpec { resource_name: Some("resc1".to_string()), group_name: None, backup_resource_name: None },
                    all_mode: false,
                    owner: "alice".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HierarchyError(_)));
    }
}
