//! Per-session context: owns the per-session descriptor tables and the
//! shared, read-mostly collaborators every operation needs (spec §5:
//! "one server session per process/task ... per-session; no locking
//! needed"). Grounded in the teacher's `process_socket` task, which owns
//! one `Vfs` + one set of per-connection state per accepted connection.

use std::sync::Arc;

use crate::catalog::CatalogClient;
use crate::descriptor::{L1Table, L3Table};
use crate::forwarder::Forwarder;
use crate::replication::ReplicationEngine;
use crate::resource::ResourceRegistry;

/// Default descriptor-table capacity, matching the source's `NUM_L1_DESC`.
pub const DEFAULT_TABLE_CAPACITY: usize = 1024;

/// Identity of the local server, used by [`crate::forwarder::Forwarder`] to
/// decide whether an operand is local, same-zone, or federated.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub zone: String,
    pub host: String,
}

/// Everything one connected client's handler loop needs. Owned by exactly
/// one task; never shared across tasks (spec §5). Held behind no lock — the
/// single-threaded cooperative handler loop is the session's only caller.
pub struct SessionContext {
    pub identity: LocalIdentity,
    pub l1: L1Table,
    pub l3: L3Table,
    pub resources: Arc<ResourceRegistry>,
    pub catalog: Arc<dyn CatalogClient>,
    pub forwarder: Arc<Forwarder>,
    /// Shared across every session in the deployment so the per-object-id
    /// advisory lock it holds actually serializes concurrent replications
    /// of the same object (spec §4.8 "Concurrency").
    pub replication: Arc<ReplicationEngine>,
}

impl SessionContext {
    pub fn new(
        identity: LocalIdentity,
        resources: Arc<ResourceRegistry>,
        catalog: Arc<dyn CatalogClient>,
        forwarder: Arc<Forwarder>,
        replication: Arc<ReplicationEngine>,
    ) -> Self {
        Self::with_capacity(identity, resources, catalog, forwarder, replication, DEFAULT_TABLE_CAPACITY)
    }

    pub fn with_capacity(
        identity: LocalIdentity,
        resources: Arc<ResourceRegistry>,
        catalog: Arc<dyn CatalogClient>,
        forwarder: Arc<Forwarder>,
        replication: Arc<ReplicationEngine>,
        table_capacity: usize,
    ) -> Self {
        Self {
            identity,
            l1: L1Table::new(table_capacity),
            l3: L3Table::new(table_capacity),
            resources,
            catalog,
            forwarder,
            replication,
        }
    }

    /// Cancels every outstanding L1/L3 entry on session teardown (spec §5
    /// "Cancellation: on session teardown, every outstanding L1 is closed
    /// with its current state treated as a failed write"). Actual close
    /// semantics (catalog updates, driver close) live in [`crate::io`]; this
    /// just enumerates what must be torn down.
    pub fn outstanding_l1_indices(&self) -> Vec<i32> {
        self.l1.in_use_indices()
    }
}
