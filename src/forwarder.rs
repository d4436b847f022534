//! Cross-zone forwarder (C7): decides whether an operand is local, on
//! another host in this zone, or in a federated zone, and if remote,
//! establishes/reuses a server-to-server connection to re-issue the
//! operation there (spec §4.6, §9 design note).

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::catalog::ReplicaMeta;
use crate::error::Result;
use crate::resource::ResourceInfo;

/// A pooled server-to-server connection. The wire protocol itself (framing,
/// the request/response bus) is out of scope (spec §1); this crate only
/// needs to know there is one connection per `(zone, host)` per session and
/// that an operation can be re-issued over it.
#[derive(Debug, Clone)]
pub struct Connection {
    pub zone: String,
    pub host: String,
}

/// Where an operand lives relative to this server (spec §4.6, §9: "model as
/// a typed `Locality` variant ... dispatch is a match on the variant, not a
/// re-entrant call").
#[derive(Debug, Clone)]
pub enum Locality {
    Local,
    RemoteHost(Arc<Connection>),
    RemoteZone(Arc<Connection>),
}

/// A server-to-server API re-issue. A real deployment implements this over
/// the wire protocol; tests implement it in-process. The forwarded call
/// carries the "already resolved" marker on the wire (spec §4.6
/// `NATIVE_NETCDF_CALL`) so the remote side skips a second catalog
/// resolution — that marker is attached by the caller via
/// `request.already_resolved = true`, not modeled here since framing is out
/// of scope.
#[async_trait]
pub trait RemoteDispatch: Send + Sync {
    async fn connect(&self, zone: &str, host: &str) -> Result<Connection>;
}

/// Per-session connection pool and locality resolver (spec §4.6: "at most
/// one connection per (zone, host) per session; reused until session
/// teardown or explicit reconnect").
pub struct Forwarder {
    local_zone: String,
    local_host: String,
    pool: DashMap<(String, String), Arc<Connection>>,
    /// Number of L1 entries currently proxying through each pooled
    /// connection (spec §3: "closes the remote-zone connection if its
    /// refcount drops to zero").
    refcounts: DashMap<(String, String), usize>,
    dispatch: Arc<dyn RemoteDispatch>,
}

impl Forwarder {
    pub fn new(local_zone: impl Into<String>, local_host: impl Into<String>, dispatch: Arc<dyn RemoteDispatch>) -> Self {
        Self { local_zone: local_zone.into(), local_host: local_host.into(), pool: DashMap::new(), refcounts: DashMap::new(), dispatch }
    }

    /// Computes locality for a resolved replica's resource (spec §4.6).
    pub async fn locate(&self, resource: &ResourceInfo) -> Result<Locality> {
        if resource.zone == self.local_zone && resource.host == self.local_host {
            return Ok(Locality::Local);
        }
        if resource.zone == self.local_zone {
            let conn = self.get_or_connect(&resource.zone, &resource.host).await?;
            return Ok(Locality::RemoteHost(conn));
        }
        let conn = self.get_or_connect(&resource.zone, &resource.host).await?;
        Ok(Locality::RemoteZone(conn))
    }

    /// Convenience for the replica-level callers in C8/C9.
    pub async fn locate_replica(&self, replica: &ReplicaMeta, resource: &ResourceInfo) -> Result<Locality> {
        debug_assert_eq!(replica.resource_name, resource.name);
        self.locate(resource).await
    }

    #[tracing::instrument(skip(self), err)]
    async fn get_or_connect(&self, zone: &str, host: &str) -> Result<Arc<Connection>> {
        let key = (zone.to_string(), host.to_string());
        if let Some(existing) = self.pool.get(&key) {
            return Ok(existing.clone());
        }
        let conn = Arc::new(self.dispatch.connect(zone, host).await?);
        self.pool.insert(key, conn.clone());
        Ok(conn)
    }

    /// Forces a fresh connection on the next forward, used after a
    /// federation error (spec §7: "Federation errors are fatal; no
    /// automatic failover").
    pub fn reconnect(&self, zone: &str, host: &str) {
        let key = (zone.to_string(), host.to_string());
        self.pool.remove(&key);
        self.refcounts.remove(&key);
    }

    /// Marks one more L1 entry as proxying through the `(zone, host)`
    /// connection, called when an open resolves to a remote locality
    /// (spec §4.6, §3 "L1 descriptor entry").
    pub fn retain(&self, zone: &str, host: &str) {
        *self.refcounts.entry((zone.to_string(), host.to_string())).or_insert(0) += 1;
    }

    /// Releases one reference to the `(zone, host)` connection, dropping it
    /// from the pool once no L1 entry references it anymore (spec §3: "An
    /// L1 ... closes the remote-zone connection if its refcount drops to
    /// zero").
    pub fn release_connection(&self, zone: &str, host: &str) {
        let key = (zone.to_string(), host.to_string());
        let drained = match self.refcounts.get_mut(&key) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => return,
        };
        if drained {
            self.refcounts.remove(&key);
            self.pool.remove(&key);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.pool.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverKind;
    use crate::resource::ResourceClass;

    struct StubDispatch;

    #[async_trait]
    impl RemoteDispatch for StubDispatch {
        async fn connect(&self, zone: &str, host: &str) -> Result<Connection> {
            Ok(Connection { zone: zone.to_string(), host: host.to_string() })
        }
    }

    fn resc(zone: &str, host: &str) -> ResourceInfo {
        ResourceInfo {
            name: "resc1".to_string(),
            zone: zone.to_string(),
            host: host.to_string(),
            driver_kind: DriverKind::Unix,
            vault_path: "/vault".to_string(),
            class: ResourceClass::Primary,
            group: None,
            gateway_address: None,
            max_object_size: None,
            free_space_bytes: None,
        }
    }

    #[tokio::test]
    async fn same_zone_same_host_is_local() {
        let fwd = Forwarder::new("tempZone", "here", Arc::new(StubDispatch));
        let locality = fwd.locate(&resc("tempZone", "here")).await.unwrap();
        assert!(matches!(locality, Locality::Local));
    }

    #[tokio::test]
    async fn same_zone_different_host_is_remote_host() {
        let fwd = Forwarder::new("tempZone", "here", Arc::new(StubDispatch));
        let locality = fwd.locate(&resc("tempZone", "there")).await.unwrap();
        assert!(matches!(locality, Locality::RemoteHost(_)));
    }

    #[tokio::test]
    async fn different_zone_is_remote_zone() {
        let fwd = Forwarder::new("tempZone", "here", Arc::new(StubDispatch));
        let locality = fwd.locate(&resc("otherZone", "elsewhere")).await.unwrap();
        assert!(matches!(locality, Locality::RemoteZone(_)));
    }

    #[tokio::test]
    async fn connection_is_reused_within_session() {
        let fwd = Forwarder::new("tempZone", "here", Arc::new(StubDispatch));
        fwd.locate(&resc("tempZone", "there")).await.unwrap();
        fwd.locate(&resc("tempZone", "there")).await.unwrap();
        assert_eq!(fwd.connection_count(), 1);
    }

    #[tokio::test]
    async fn reconnect_drops_pooled_connection() {
        let fwd = Forwarder::new("tempZone", "here", Arc::new(StubDispatch));
        fwd.locate(&resc("tempZone", "there")).await.unwrap();
        fwd.reconnect("tempZone", "there");
        assert_eq!(fwd.connection_count(), 0);
    }

    #[tokio::test]
    async fn connection_survives_until_last_reference_released() {
        let fwd = Forwarder::new("tempZone", "here", Arc::new(StubDispatch));
        fwd.locate(&resc("tempZone", "there")).await.unwrap();
        fwd.retain("tempZone", "there");
        fwd.retain("tempZone", "there");
        fwd.release_connection("tempZone", "there");
        assert_eq!(fwd.connection_count(), 1);
        fwd.release_connection("tempZone", "there");
        assert_eq!(fwd.connection_count(), 0);
    }

    #[tokio::test]
    async fn releasing_an_unretained_connection_is_a_no_op() {
        let fwd = Forwarder::new("tempZone", "here", Arc::new(StubDispatch));
        fwd.locate(&resc("tempZone", "there")).await.unwrap();
        fwd.release_connection("tempZone", "there");
        assert_eq!(fwd.connection_count(), 1);
    }
}
