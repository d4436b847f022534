//! Data-object I/O state machine (C8): open/read/write/lseek/close, replica
//! selection, ALL-mode fan-out, and force-overwrite (spec §4.7).
//!
//! Grounded in `original_source/iRODS/lib/api/include/dataObjLseek.h` for
//! the seek contract and `dataObjRepl.h` for the shape of a replica
//! operation; the state diagram itself is spec §4.7's unchanged text.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::catalog::{DataObjectMeta, ReplicaMeta, ReplicaStatus, ReplicaUpdate, ResolvedObject};
use crate::condition::{ConditionBag, Keyword};
use crate::descriptor::{ChecksumMode, L1Entry, L3Entry, OperationType, RemoteRef};
use crate::driver::{dispatch, hash_handle, OpenFlags, Whence};
use crate::error::{Error, Result};
use crate::forwarder::{Connection, Locality};
use crate::resource::ResourceInfo;
use crate::session::SessionContext;

fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

fn checksum_mode_from_cond(cond: &ConditionBag) -> Option<ChecksumMode> {
    if cond.has(Keyword::ForceChksum) {
        Some(ChecksumMode::Force)
    } else if cond.has(Keyword::VerifyChksum) {
        Some(ChecksumMode::Verify)
    } else {
        None
    }
}

/// Parameters for [`open`]. `default_resource` is the fallback used when
/// neither `DEST_RESC_NAME` nor `BACKUP_RESC_NAME` is set in `cond` (spec
/// §4.2 `pick_destination`); resolving that default from user/zone policy
/// is out of scope (spec §1), so the caller supplies it.
pub struct OpenRequest {
    pub logical_path: String,
    pub flags: OpenFlags,
    pub cond: ConditionBag,
    pub mode: u32,
    pub owner: String,
    pub data_type: String,
    pub default_resource: String,
}

/// Opens (or creates) a data object, returning the allocated L1 index (spec
/// §4.7 `open`).
#[tracing::instrument(skip(session, req), fields(path = %req.logical_path, write = req.flags.write, create = req.flags.create), err)]
pub async fn open(session: &mut SessionContext, req: OpenRequest) -> Result<i32> {
    if req.logical_path.is_empty() {
        return Err(Error::NullInput);
    }
    match session.catalog.resolve(&req.logical_path).await {
        Ok(resolved) => open_existing(session, req, resolved).await,
        Err(e) if e.is_no_rows() && req.flags.create => open_create(session, req).await,
        Err(e) => Err(e),
    }
}

async fn open_create(session: &mut SessionContext, req: OpenRequest) -> Result<i32> {
    let resc = session.resources.pick_destination(&req.cond, &req.default_resource)?;
    let checksum_mode = checksum_mode_from_cond(&req.cond);

    let object_id = session
        .catalog
        .create_object(DataObjectMeta {
            object_id: 0,
            logical_path: req.logical_path.clone(),
            owner: req.owner.clone(),
            create_time: unix_now(),
            modify_time: unix_now(),
            logical_size: 0,
            checksum: None,
            data_type: req.data_type.clone(),
            collection_id: 0,
        })
        .await?;

    let phy_path = resc.vault_relative_path(&session.identity.zone, &req.owner, &req.logical_path);
    let replica = ReplicaMeta {
        object_id,
        replica_number: 0,
        resource_name: resc.name.clone(),
        resource_group: resc.group.clone(),
        physical_path: phy_path.clone(),
        size: 0,
        checksum: None,
        status: ReplicaStatus::Stale,
        write_locked: true,
        expiry: None,
    };
    session.catalog.register_replica(object_id, replica.clone()).await?;

    let data_object = DataObjectMeta {
        object_id,
        logical_path: req.logical_path.clone(),
        owner: req.owner.clone(),
        create_time: unix_now(),
        modify_time: unix_now(),
        logical_size: 0,
        checksum: None,
        data_type: req.data_type.clone(),
        collection_id: 0,
    };

    let operation = OperationType { put: true, ..Default::default() };
    match resolve_and_open(session, &resc, &phy_path, req.flags, req.mode, replica, operation, data_object, checksum_mode).await {
        Ok(l1_index) => Ok(l1_index),
        Err(e) => {
            let _ = session.catalog.unregister_replica(object_id, 0).await;
            Err(e)
        }
    }
}

async fn open_existing(session: &mut SessionContext, req: OpenRequest, resolved: ResolvedObject) -> Result<i32> {
    let all_mode = req.cond.has(Keyword::All);
    let checksum_mode = checksum_mode_from_cond(&req.cond);

    if req.flags.create && req.cond.has(Keyword::ForceFlag) {
        return open_force_overwrite(session, req, resolved, checksum_mode).await;
    }

    let chosen = select_replica(&req.cond, &resolved.replicas);
    let chosen = match chosen {
        Some(r) => r,
        None => {
            // No GOOD replica. A write-intent ALL open is documented (spec
            // §4.7) as promoting a STALE replica via the replication engine
            // and reopening; doing that here would make C8 depend on C9,
            // which depends on C8 for its own transfer step (spec §4.8),
            // an unwanted module cycle. Recorded in DESIGN.md: callers that
            // hit this need to invoke replication explicitly first.
            return Err(Error::CatNoRowsFound);
        }
    };

    let resc = session.resources.resolve_by_name(&chosen.resource_name)?;
    let operation = OperationType { get: req.flags.read && !req.flags.write, put: req.flags.write, ..Default::default() };
    let l1_index =
        resolve_and_open(session, &resc, &chosen.physical_path, req.flags, req.mode, chosen.clone(), operation, resolved.meta.clone(), checksum_mode)
            .await?;

    if req.flags.write && all_mode {
        let mut copy_pair = Vec::new();
        for sib in resolved.replicas.iter().filter(|r| r.status == ReplicaStatus::Good && r.replica_number != chosen.replica_number) {
            let sib_resc = match session.resources.resolve_by_name(&sib.resource_name) {
                Ok(r) => r,
                Err(_) => {
                    mark_unreachable_sibling_stale(session, &resolved.meta, sib).await;
                    continue;
                }
            };
            let sib_operation = OperationType { put: true, ..Default::default() };
            match resolve_and_open(
                session,
                &sib_resc,
                &sib.physical_path,
                req.flags,
                req.mode,
                sib.clone(),
                sib_operation,
                resolved.meta.clone(),
                checksum_mode,
            )
            .await
            {
                Ok(idx) => copy_pair.push(idx),
                // The sibling resource is unreachable for this write (spec
                // §4.8 scenario S4: "resource offline"). A sibling that
                // never got opened still needs to end up STALE in the
                // catalog, same as one whose write failed after opening.
                Err(_) => mark_unreachable_sibling_stale(session, &resolved.meta, sib).await,
            }
        }
        session.l1.get_mut(l1_index)?.copy_pair = copy_pair;
    }

    Ok(l1_index)
}

async fn open_force_overwrite(
    session: &mut SessionContext,
    req: OpenRequest,
    resolved: ResolvedObject,
    checksum_mode: Option<ChecksumMode>,
) -> Result<i32> {
    let primary = resolved
        .replicas
        .iter()
        .filter(|r| r.status == ReplicaStatus::Good)
        .min_by_key(|r| r.replica_number)
        .or_else(|| resolved.replicas.iter().min_by_key(|r| r.replica_number))
        .cloned()
        .ok_or(Error::CatNoRowsFound)?;

    let resc = session.resources.resolve_by_name(&primary.resource_name)?;
    let mut flags = req.flags;
    flags.truncate = true;
    let operation = OperationType { put: true, ..Default::default() };
    let l1_index =
        resolve_and_open(session, &resc, &primary.physical_path, flags, req.mode, primary.clone(), operation, resolved.meta.clone(), checksum_mode)
            .await?;

    let sibling_numbers: Vec<i32> =
        resolved.replicas.iter().filter(|r| r.replica_number != primary.replica_number).map(|r| r.replica_number).collect();
    session.l1.get_mut(l1_index)?.force_stale_replicas = sibling_numbers;
    Ok(l1_index)
}

/// Best-effort: flags a sibling STALE in the catalog when it couldn't even
/// be opened for the ALL-mode fan-out (spec §4.8 S4). Errors are swallowed
/// since the sibling is already unreachable; there's nothing more useful to
/// do than leave it at its last known status.
async fn mark_unreachable_sibling_stale(session: &SessionContext, data_object: &DataObjectMeta, sib: &ReplicaMeta) {
    let _ = session
        .catalog
        .update_replica(data_object.object_id, sib.replica_number, ReplicaUpdate { status: Some(ReplicaStatus::Stale), ..Default::default() })
        .await;
}

/// Lowest-replica-number-wins tie-break over REPL_NUM / RESC_NAME+GOOD / any
/// GOOD, exactly as spec §4.7 "Tie-breaks" describes.
fn select_replica(cond: &ConditionBag, replicas: &[ReplicaMeta]) -> Option<ReplicaMeta> {
    if let Some(n) = cond.lookup(Keyword::ReplNum).and_then(|s| s.parse::<i32>().ok()) {
        return replicas.iter().find(|r| r.replica_number == n).cloned();
    }
    if let Some(resc) = cond.lookup(Keyword::RescName) {
        if let Some(r) = replicas.iter().filter(|r| r.resource_name == resc && r.status == ReplicaStatus::Good).min_by_key(|r| r.replica_number) {
            return Some(r.clone());
        }
    }
    replicas.iter().filter(|r| r.status == ReplicaStatus::Good).min_by_key(|r| r.replica_number).cloned()
}

/// Consults the forwarder for the replica's locality before opening it
/// (spec §2: "resolves the operand to a catalog record, consults C7 for
/// locality, either dispatches locally through C8 or forwards through a
/// server-to-server connection"). A local replica opens through the usual
/// driver path; a remote one gets a proxied L1 entry that reserves the
/// pooled connection instead of a local L3 handle.
#[allow(clippy::too_many_arguments)]
async fn resolve_and_open(
    session: &mut SessionContext,
    resc: &ResourceInfo,
    phy_path: &str,
    flags: OpenFlags,
    mode: u32,
    replica: ReplicaMeta,
    operation: OperationType,
    data_object: DataObjectMeta,
    checksum_mode: Option<ChecksumMode>,
) -> Result<i32> {
    match session.forwarder.locate_replica(&replica, resc).await? {
        Locality::Local => open_physical_and_track(session, resc, phy_path, flags, mode, replica, operation, data_object, checksum_mode).await,
        Locality::RemoteHost(conn) | Locality::RemoteZone(conn) => {
            track_remote_entry(session, &conn, flags, replica, operation, data_object, checksum_mode)
        }
    }
}

/// Builds a proxied L1 entry for a replica that resolved to a remote host
/// or zone: no local L3 handle is allocated, and the pooled connection's
/// refcount is bumped for as long as this L1 entry is open. Re-issuing the
/// operation over the wire is a wire-protocol concern (spec §1) this crate
/// doesn't implement; `remote_l1_index` is left unset (`-1`) since only the
/// wire protocol would learn the peer's actual descriptor index.
fn track_remote_entry(
    session: &mut SessionContext,
    conn: &Connection,
    flags: OpenFlags,
    replica: ReplicaMeta,
    operation: OperationType,
    data_object: DataObjectMeta,
    checksum_mode: Option<ChecksumMode>,
) -> Result<i32> {
    session.forwarder.retain(&conn.zone, &conn.host);
    let mut entry = L1Entry::new(operation, flags, data_object, replica);
    entry.remote = Some(RemoteRef { zone: conn.zone.clone(), host: conn.host.clone(), remote_l1_index: -1 });
    entry.checksum_mode = checksum_mode;

    match session.l1.allocate(entry) {
        Ok(idx) => Ok(idx),
        Err(e) => {
            session.forwarder.release_connection(&conn.zone, &conn.host);
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn open_physical_and_track(
    session: &mut SessionContext,
    resc: &ResourceInfo,
    phy_path: &str,
    flags: OpenFlags,
    mode: u32,
    replica: ReplicaMeta,
    operation: OperationType,
    data_object: DataObjectMeta,
    checksum_mode: Option<ChecksumMode>,
) -> Result<i32> {
    let driver = dispatch(resc.driver_kind)?;
    let handle = driver.open(phy_path, flags, mode).await?;
    let l3_index = session.l3.allocate(L3Entry { resource_name: resc.name.clone(), driver_kind: resc.driver_kind, handle, offset: 0, flags })?;

    let mut entry = L1Entry::new(operation, flags, data_object, replica);
    entry.l3_index = l3_index;
    entry.checksum_mode = checksum_mode;

    match session.l1.allocate(entry) {
        Ok(idx) => Ok(idx),
        Err(e) => {
            let mut l3 = session.l3.release(l3_index)?;
            let _ = driver.close(&mut l3.handle).await;
            Err(e)
        }
    }
}

/// Reads up to `n` bytes from the L1's owned L3 (spec §4.7 `read`). No
/// replica failover on a mid-stream error — surfaced as-is.
#[tracing::instrument(skip(session, n), fields(l1 = l1_index, n), err)]
pub async fn read(session: &mut SessionContext, l1_index: i32, n: usize) -> Result<Vec<u8>> {
    let l3_index = session.l1.get(l1_index)?.l3_index;
    if l3_index < 0 {
        return Err(Error::InvariantViolated("l1 entry has no local l3 handle"));
    }
    let l3 = session.l3.get_mut(l3_index)?;
    let driver = dispatch(l3.driver_kind)?;
    let mut buf = vec![0u8; n];
    let read = driver.read(&mut l3.handle, &mut buf).await?;
    buf.truncate(read);
    Ok(buf)
}

/// Writes `buf` to the L1's owned L3, fanning out to every ALL-mode sibling
/// (spec §4.7 `write`). The operation fails only if the primary write
/// fails; a sibling failure marks that sibling STALE-on-close and the fan-
/// out continues.
#[tracing::instrument(skip(session, buf), fields(l1 = l1_index, len = buf.len()), err)]
pub async fn write(session: &mut SessionContext, l1_index: i32, buf: &[u8]) -> Result<u64> {
    let l3_index = session.l1.get(l1_index)?.l3_index;
    if l3_index < 0 {
        return Err(Error::InvariantViolated("l1 entry has no local l3 handle"));
    }
    let n = {
        let l3 = session.l3.get_mut(l3_index)?;
        let driver = dispatch(l3.driver_kind)?;
        driver.write(&mut l3.handle, buf).await?
    };

    let copy_pair = session.l1.get(l1_index)?.copy_pair.clone();
    for sib_idx in copy_pair {
        if !session.l1.is_in_use(sib_idx) {
            continue;
        }
        if session.l1.get(sib_idx)?.status_to_set_on_close == Some(ReplicaStatus::Stale) {
            continue;
        }
        let sib_l3_index = session.l1.get(sib_idx)?.l3_index;
        let sib_result = {
            let sib_l3 = session.l3.get_mut(sib_l3_index)?;
            let sib_driver = dispatch(sib_l3.driver_kind)?;
            sib_driver.write(&mut sib_l3.handle, buf).await
        };
        if sib_result.is_err() {
            session.l1.get_mut(sib_idx)?.status_to_set_on_close = Some(ReplicaStatus::Stale);
        }
    }

    let entry = session.l1.get_mut(l1_index)?;
    entry.bytes_written += n as u64;
    Ok(n as u64)
}

/// Seeks the L1's owned L3 and every still-good ALL-mode sibling to the
/// resulting absolute offset (spec §4.7 `lseek`).
#[tracing::instrument(skip(session), fields(l1 = l1_index, offset), err)]
pub async fn lseek(session: &mut SessionContext, l1_index: i32, offset: i64, whence: Whence) -> Result<i64> {
    let l3_index = session.l1.get(l1_index)?.l3_index;
    if l3_index < 0 {
        return Err(Error::InvariantViolated("l1 entry has no local l3 handle"));
    }
    let new_offset = {
        let l3 = session.l3.get_mut(l3_index)?;
        let driver = dispatch(l3.driver_kind)?;
        let off = driver.lseek(&mut l3.handle, offset, whence).await?;
        l3.offset = off;
        off
    };

    let copy_pair = session.l1.get(l1_index)?.copy_pair.clone();
    for sib_idx in copy_pair {
        if !session.l1.is_in_use(sib_idx) {
            continue;
        }
        if session.l1.get(sib_idx)?.status_to_set_on_close == Some(ReplicaStatus::Stale) {
            continue;
        }
        let sib_l3_index = session.l1.get(sib_idx)?.l3_index;
        let sib_result = {
            let sib_l3 = session.l3.get_mut(sib_l3_index)?;
            let sib_driver = dispatch(sib_l3.driver_kind)?;
            sib_driver.lseek(&mut sib_l3.handle, new_offset, Whence::Set).await
        };
        if sib_result.is_err() {
            session.l1.get_mut(sib_idx)?.status_to_set_on_close = Some(ReplicaStatus::Stale);
        }
    }

    Ok(new_offset)
}

/// Outcome of [`close`]: how many sibling replicas ended up GOOD vs STALE.
#[derive(Debug, Clone, Copy)]
pub struct CloseOutcome {
    pub object_id: i64,
    pub good_replicas: i32,
    pub stale_replicas: i32,
}

struct FinalizedReplica {
    object_id: i64,
    replica_number: i32,
    ok: bool,
    size: u64,
    checksum: Option<String>,
}

async fn finalize_entry(session: &mut SessionContext, l1_index: i32) -> Result<FinalizedReplica> {
    let entry = session.l1.release(l1_index)?;
    let mut ok = entry.status_to_set_on_close != Some(ReplicaStatus::Stale);
    let mut size = entry.replica.size;
    let mut checksum = entry.replica.checksum.clone();

    if entry.l3_index >= 0 {
        let mut l3 = session.l3.release(entry.l3_index)?;
        let driver = dispatch(l3.driver_kind)?;

        if ok {
            if let Some(mode) = entry.checksum_mode {
                match hash_handle(driver.as_ref(), &mut l3.handle).await {
                    Ok(digest) => {
                        if mode == ChecksumMode::Verify {
                            if let Some(existing) = &entry.replica.checksum {
                                if existing != &digest {
                                    ok = false;
                                }
                            }
                        }
                        checksum = Some(digest);
                    }
                    Err(_) => ok = false,
                }
            }
        }

        if let Ok(stat) = driver.stat(&entry.replica.physical_path).await {
            size = stat.size;
        }
        if driver.close(&mut l3.handle).await.is_err() {
            ok = false;
        }
    } else {
        // Remote-proxy L1 entries (no local L3) can't be finalized here:
        // re-issuing the close over the wire is a wire-protocol concern
        // (spec §1). Release this entry's hold on the pooled connection
        // regardless, so it doesn't outlive every L1 that referenced it.
        if let Some(remote) = &entry.remote {
            session.forwarder.release_connection(&remote.zone, &remote.host);
        }
        ok = false;
    }

    Ok(FinalizedReplica { object_id: entry.data_object.object_id, replica_number: entry.replica.replica_number, ok, size, checksum })
}

/// Closes the L1 (plus every ALL-mode sibling), updating the catalog: GOOD
/// with new size/checksum/modify-time on success, STALE on failure (spec
/// §4.7 `close`). A fully-failed create is simply left stale for GC.
#[tracing::instrument(skip(session), fields(l1 = l1_index), err)]
pub async fn close(session: &mut SessionContext, l1_index: i32) -> Result<CloseOutcome> {
    let preview = session.l1.get(l1_index)?;
    let siblings = preview.copy_pair.clone();
    let force_stale_replicas = preview.force_stale_replicas.clone();

    let primary = finalize_entry(session, l1_index).await?;
    let object_id = primary.object_id;
    let mut good = 0;
    let mut stale = 0;

    if primary.ok {
        session
            .catalog
            .update_replica(
                primary.object_id,
                primary.replica_number,
                ReplicaUpdate { size: Some(primary.size), checksum: primary.checksum, status: Some(ReplicaStatus::Good), modify_time: Some(unix_now()) },
            )
            .await?;
        good += 1;
    } else {
        let _ = session
            .catalog
            .update_replica(primary.object_id, primary.replica_number, ReplicaUpdate { status: Some(ReplicaStatus::Stale), ..Default::default() })
            .await;
        stale += 1;
    }

    for sib_idx in siblings {
        if !session.l1.is_in_use(sib_idx) {
            continue;
        }
        let finalized = finalize_entry(session, sib_idx).await?;
        if finalized.ok {
            session
                .catalog
                .update_replica(
                    finalized.object_id,
                    finalized.replica_number,
                    ReplicaUpdate {
                        size: Some(finalized.size),
                        checksum: finalized.checksum,
                        status: Some(ReplicaStatus::Good),
                        modify_time: Some(unix_now()),
                    },
                )
                .await?;
            good += 1;
        } else {
            let _ = session
                .catalog
                .update_replica(finalized.object_id, finalized.replica_number, ReplicaUpdate { status: Some(ReplicaStatus::Stale), ..Default::default() })
                .await;
            stale += 1;
        }
    }

    for replica_number in force_stale_replicas {
        let _ =
            session.catalog.update_replica(object_id, replica_number, ReplicaUpdate { status: Some(ReplicaStatus::Stale), ..Default::default() }).await;
        stale += 1;
    }

    Ok(CloseOutcome { object_id, good_replicas: good, stale_replicas: stale })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::driver::DriverKind;
    use crate::forwarder::{Connection, Forwarder, RemoteDispatch};
    use crate::resource::{ResourceClass, ResourceRegistry};
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
            vault_path: vault.to_string_lossy().into_owned(),
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
            vault_path: vault.to_string_lossy().into_owned(),
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
            Arc::new(crate::replication::ReplicationEngine::new()),
        )
    }

    fn open_req(path: &str, flags: OpenFlags, cond: ConditionBag) -> OpenRequest {
        OpenRequest {
            logical_path: path.to_string(),
            flags,
            cond,
            mode: 0o644,
            owner: "alice".to_string(),
            data_type: "generic".to_string(),
            default_resource: "resc1".to_string(),
        }
    }

    #[tokio::test]
    async fn create_write_close_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = new_session(dir.path());

        let l1 = open(&mut session, open_req("/tempZone/home/alice/a.txt", OpenFlags::write_create(), ConditionBag::new())).await.unwrap();
        write(&mut session, l1, b"hello world").await.unwrap();
        let outcome = close(&mut session, l1).await.unwrap();
        assert_eq!(outcome.good_replicas, 1);
        assert_eq!(outcome.stale_replicas, 0);

        let resolved = session.catalog.resolve("/tempZone/home/alice/a.txt").await.unwrap();
        assert_eq!(resolved.replicas[0].status, ReplicaStatus::Good);
        assert_eq!(resolved.replicas[0].size, 11);
    }

    #[tokio::test]
    async fn read_after_write_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = new_session(dir.path());

        let l1 = open(&mut session, open_req("/tempZone/home/alice/a.txt", OpenFlags::write_create(), ConditionBag::new())).await.unwrap();
        write(&mut session, l1, b"0123456789").await.unwrap();
        close(&mut session, l1).await.unwrap();

        let l1 = open(&mut session, open_req("/tempZone/home/alice/a.txt", OpenFlags::read_only(), ConditionBag::new())).await.unwrap();
        let bytes = read(&mut session, l1, 10).await.unwrap();
        assert_eq!(bytes, b"0123456789");
        close(&mut session, l1).await.unwrap();
    }

    #[tokio::test]
    async fn lseek_moves_the_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = new_session(dir.path());

        let l1 = open(&mut session, open_req("/tempZone/home/alice/a.txt", OpenFlags::write_create(), ConditionBag::new())).await.unwrap();
        write(&mut session, l1, b"0123456789").await.unwrap();
        close(&mut session, l1).await.unwrap();

        let l1 = open(&mut session, open_req("/tempZone/home/alice/a.txt", OpenFlags::read_only(), ConditionBag::new())).await.unwrap();
        let off = lseek(&mut session, l1, 5, Whence::Set).await.unwrap();
        assert_eq!(off, 5);
        let bytes = read(&mut session, l1, 5).await.unwrap();
        assert_eq!(bytes, b"56789");
        close(&mut session, l1).await.unwrap();
    }

    #[tokio::test]
    async fn read_intent_open_with_no_good_replica_is_no_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = new_session(dir.path());

        let l1 = open(&mut session, open_req("/tempZone/home/alice/a.txt", OpenFlags::write_create(), ConditionBag::new())).await.unwrap();
        session.l1.get_mut(l1).unwrap().status_to_set_on_close = Some(ReplicaStatus::Stale);
        close(&mut session, l1).await.unwrap();

        let err = open(&mut session, open_req("/tempZone/home/alice/a.txt", OpenFlags::read_only(), ConditionBag::new())).await.unwrap_err();
        assert_eq!(err, Error::CatNoRowsFound);
    }

    #[tokio::test]
    async fn all_mode_write_fans_out_to_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = new_session(dir.path());

        let l1 = open(&mut session, open_req("/tempZone/home/alice/a.txt", OpenFlags::write_create(), ConditionBag::new())).await.unwrap();
        write(&mut session, l1, b"first").await.unwrap();
        close(&mut session, l1).await.unwrap();

        // register a second GOOD replica directly (simulating a prior
        // replication) so the next ALL-mode open has a sibling to fan out to
        let resolved = session.catalog.resolve("/tempZone/home/alice/a.txt").await.unwrap();
        let mut sibling = resolved.replicas[0].clone();
        sibling.replica_number = 1;
        sibling.resource_name = "resc2".to_string();
        sibling.physical_path = format!("{}.resc2", sibling.physical_path);
        session.catalog.register_replica(resolved.meta.object_id, sibling).await.unwrap();
        tokio::fs::write(&format!("{}.resc2", resolved.replicas[0].physical_path), b"first").await.unwrap();

        let mut cond = ConditionBag::new();
        cond.add_flag(Keyword::All);
        let l1 = open(&mut session, open_req("/tempZone/home/alice/a.txt", OpenFlags { read: false, write: true, create: false, truncate: false, append: false }, cond))
            .await
            .unwrap();
        assert_eq!(session.l1.get(l1).unwrap().copy_pair.len(), 1);
        write(&mut session, l1, b"second").await.unwrap();
        let outcome = close(&mut session, l1).await.unwrap();
        assert_eq!(outcome.good_replicas, 2);
    }

    #[tokio::test]
    async fn force_flag_collapses_and_stales_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = new_session(dir.path());

        let l1 = open(&mut session, open_req("/tempZone/home/alice/a.txt", OpenFlags::write_create(), ConditionBag::new())).await.unwrap();
        write(&mut session, l1, b"original").await.unwrap();
        close(&mut session, l1).await.unwrap();

        let resolved = session.catalog.resolve("/tempZone/home/alice/a.txt").await.unwrap();
        let mut sibling = resolved.replicas[0].clone();
        sibling.replica_number = 1;
        sibling.resource_name = "resc2".to_string();
        session.catalog.register_replica(resolved.meta.object_id, sibling).await.unwrap();

        let mut cond = ConditionBag::new();
        cond.add_flag(Keyword::ForceFlag);
        let l1 = open(&mut session, open_req("/tempZone/home/alice/a.txt", OpenFlags::write_create(), cond)).await.unwrap();
        write(&mut session, l1, b"overwritten").await.unwrap();
        close(&mut session, l1).await.unwrap();

        let resolved = session.catalog.resolve("/tempZone/home/alice/a.txt").await.unwrap();
        let replica1 = resolved.replicas.iter().find(|r| r.replica_number == 1).unwrap();
        assert_eq!(replica1.status, ReplicaStatus::Stale);
    }

    #[tokio::test]
    async fn verify_chksum_mismatch_marks_replica_stale() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = new_session(dir.path());

        let l1 = open(&mut session, open_req("/tempZone/home/alice/a.txt", OpenFlags::write_create(), ConditionBag::new())).await.unwrap();
        write(&mut session, l1, b"v1").await.unwrap();
        close(&mut session, l1).await.unwrap();

        // poison the cataloged checksum so VERIFY_CHKSUM on the next write fails
        let resolved = session.catalog.resolve("/tempZone/home/alice/a.txt").await.unwrap();
        session
            .catalog
            .update_replica(resolved.meta.object_id, 0, ReplicaUpdate { checksum: Some("sha2:deadbeef".to_string()), ..Default::default() })
            .await
            .unwrap();

        let mut cond = ConditionBag::new();
        cond.add_flag(Keyword::VerifyChksum);
        let l1 = open(&mut session, open_req("/tempZone/home/alice/a.txt", OpenFlags { read: false, write: true, create: false, truncate: false, append: false }, cond))
            .await
            .unwrap();
        let outcome = close(&mut session, l1).await.unwrap();
        assert_eq!(outcome.stale_replicas, 1);
    }

    struct StubDispatch;
    #[async_trait]
    impl RemoteDispatch for StubDispatch {
        async fn connect(&self, zone: &str, host: &str) -> Result<Connection> {
            Ok(Connection { zone: zone.to_string(), host: host.to_string() })
        }
    }

    #[tokio::test]
    async fn open_on_remote_host_proxies_instead_of_opening_locally() {
        let dir = tempfile::tempdir().unwrap();
        let resources = Arc::new(ResourceRegistry::new());
        resources.register(ResourceInfo {
            name: "resc_remote".to_string(),
            zone: "tempZone".to_string(),
            host: "otherhost".to_string(),
            driver_kind: DriverKind::Unix,
            vault_path: dir.path().to_string_lossy().into_owned(),
            class: ResourceClass::Primary,
            group: None,
            gateway_address: None,
            max_object_size: None,
            free_space_bytes: None,
        });
        let forwarder = Arc::new(Forwarder::new("tempZone", "localhost", Arc::new(StubDispatch)));
        let mut session = SessionContext::new(
            LocalIdentity { zone: "tempZone".to_string(), host: "localhost".to_string() },
            resources,
            InMemoryCatalog::new(),
            forwarder,
            Arc::new(crate::replication::ReplicationEngine::new()),
        );

        let mut cond = ConditionBag::new();
        cond.add(Keyword::DestRescName, "resc_remote");
        let l1 = open(&mut session, open_req("/tempZone/home/alice/a.txt", OpenFlags::write_create(), cond)).await.unwrap();

        let entry = session.l1.get(l1).unwrap();
        assert_eq!(entry.l3_index, -1);
        assert!(entry.remote.is_some());
        assert_eq!(session.forwarder.connection_count(), 1);

        close(&mut session, l1).await.unwrap();
        assert_eq!(session.forwarder.connection_count(), 0);
    }
}
